use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    plan_dashboard_lib::run(config_path.as_deref()).await?;
    Ok(())
}
