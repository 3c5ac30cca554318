use crate::cache::CommitGate;
use crate::errors::{AppError, AppResult};
use crate::models::StagingSnapshot;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const LATEST_SNAPSHOT_FILE: &str = "latest.json";

/// The intermediate tier between the warehouse and the local store.
///
/// Implementations are called from the blocking pool, so they may do plain
/// synchronous IO.
pub trait StagingStore: Send + Sync {
    /// Replaces the latest snapshot. Must not make the write visible unless
    /// `gate.begin_commit()` succeeds.
    fn write_snapshot(&self, snapshot: &StagingSnapshot, gate: &CommitGate) -> AppResult<()>;

    /// The most recently written snapshot, or `None` when staging is empty.
    fn read_latest(&self) -> AppResult<Option<StagingSnapshot>>;
}

/// Keeps the latest snapshot as one JSON file under `dir`.
#[derive(Debug, Clone)]
pub struct FileStagingStore {
    dir: PathBuf,
}

impl FileStagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_SNAPSHOT_FILE)
    }
}

impl StagingStore for FileStagingStore {
    fn write_snapshot(&self, snapshot: &StagingSnapshot, gate: &CommitGate) -> AppResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        write_atomic(&self.latest_path(), &bytes, gate)?;
        tracing::debug!(
            batch_id = %snapshot.batch_id,
            rows = snapshot.rows.len(),
            path = %self.latest_path().display(),
            "staging snapshot file replaced"
        );
        Ok(())
    }

    fn read_latest(&self) -> AppResult<Option<StagingSnapshot>> {
        let path = self.latest_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "Failed to read staging snapshot '{}': {}",
                    path.display(),
                    err
                )))
            }
        };
        let snapshot = serde_json::from_slice(&raw).map_err(|err| {
            AppError::Internal(format!("corrupt staging snapshot '{}': {}", path.display(), err))
        })?;
        Ok(Some(snapshot))
    }
}

/// Writes to a sibling temp file and renames it over `path`, so readers never
/// see a half-written snapshot.
fn write_atomic(path: &Path, bytes: &[u8], gate: &CommitGate) -> AppResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("'{}' has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("snapshot");
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4()));
    let written = write_then_rename(&tmp, path, bytes, gate);
    if written.is_err() {
        if let Err(err) = fs::remove_file(&tmp) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp.display(), error = %err, "stale staging temp file left behind");
            }
        }
    }
    written
}

fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8], gate: &CommitGate) -> AppResult<()> {
    {
        let mut file = fs::File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if !gate.begin_commit() {
        return Err(AppError::Conflict(format!(
            "write to '{}' abandoned before commit",
            path.display()
        )));
    }
    fs::rename(tmp, path)?;
    Ok(())
}
