use crate::access::UserStore;
use crate::cache::{CacheCoordinator, UNSET_TIMESTAMP};
use crate::colors::ColorPalette;
use crate::config::{ChartMetric, DashboardConfig};
use crate::errors::{AppError, AppResult};
use crate::formatting::{MetricCatalog, SUBSCRIPTIONS_METRIC};
use crate::models::{
    CacheInfo, ChartPair, ChartPoint, CurrentUser, DashboardStatus, DataFilters, DataVariant, FilterOptions,
    MetricFormat, MetricSeries, NewUserPayload, OverviewRequest, PlanOverview, PlanStatus, StatusResponse,
    UpdateUserPayload, UserSummary,
};
use crate::pivot::{build_chart_series, build_pivot, chart_title, plans_by_app};
use std::collections::BTreeMap;
use std::sync::Arc;

const ADMIN_REQUIRED: &str = "Admin privileges required";

struct VariantData {
    series: Vec<MetricSeries>,
    charts: BTreeMap<String, Vec<ChartPoint>>,
}

/// Everything the presentation layer calls. Owns the user store and shares
/// the cache coordinator with the background refresh loop.
pub struct DashboardService {
    users: UserStore,
    cache: Arc<CacheCoordinator>,
    catalog: MetricCatalog,
    palette: ColorPalette,
    billing_cycles: Vec<String>,
    cohorts: Vec<String>,
    default_plan: Option<String>,
}

impl DashboardService {
    pub fn new(config: &DashboardConfig, cache: Arc<CacheCoordinator>) -> Self {
        Self {
            users: UserStore::from_config(config),
            cache,
            catalog: MetricCatalog::from_config(config),
            palette: ColorPalette::from_config(config),
            billing_cycles: config.billing_cycles.clone(),
            cohorts: config.cohorts.clone(),
            default_plan: config.default_plan.clone(),
        }
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<CurrentUser> {
        self.users.authenticate(username, password)
    }

    /// Every configured dashboard with its status and cache timestamps.
    pub fn dashboard_hub(&self, user: Option<&CurrentUser>) -> Vec<DashboardStatus> {
        let info = self.cache.get_cache_info();
        self.users
            .dashboards()
            .iter()
            .map(|dashboard| {
                let (warehouse, staging) = if dashboard.enabled {
                    (info.last_warehouse_refresh.clone(), info.last_staging_refresh.clone())
                } else {
                    (UNSET_TIMESTAMP.to_string(), UNSET_TIMESTAMP.to_string())
                };
                DashboardStatus {
                    id: dashboard.id.clone(),
                    name: dashboard.name.clone(),
                    enabled: dashboard.enabled,
                    status: (if dashboard.enabled { "Active" } else { "Disabled" }).to_string(),
                    reachable: self.users.can_access_dashboard(user, &dashboard.id),
                    last_warehouse_refresh: warehouse,
                    last_staging_refresh: staging,
                }
            })
            .collect()
    }

    pub fn cache_info(&self, user: &CurrentUser, dashboard_id: &str) -> AppResult<CacheInfo> {
        self.ensure_access(user, dashboard_id)?;
        Ok(self.cache.get_cache_info())
    }

    pub fn filter_options(
        &self,
        user: &CurrentUser,
        dashboard_id: &str,
        status: PlanStatus,
    ) -> AppResult<FilterOptions> {
        self.ensure_access(user, dashboard_id)?;

        let groups = self.cache.load_plan_groups(status)?;
        let date_bounds = self.cache.load_date_bounds()?;
        let default_plan = self
            .default_plan
            .as_ref()
            .filter(|plan| groups.iter().any(|group| &group.plan == *plan))
            .cloned();

        Ok(FilterOptions {
            plans_by_app: plans_by_app(&groups),
            date_bounds,
            billing_cycles: self.billing_cycles.clone(),
            cohorts: self.cohorts.clone(),
            metrics: self.catalog.options(),
            default_plan,
        })
    }

    /// Both pivot tables plus every chart panel for one filter selection.
    /// Regular and Crystal Ball data load concurrently.
    pub async fn plan_overview(
        &self,
        user: &CurrentUser,
        dashboard_id: &str,
        request: &OverviewRequest,
    ) -> AppResult<PlanOverview> {
        self.ensure_access(user, dashboard_id)?;

        let chart_metrics = self.chart_metric_keys();
        let (regular, crystal_ball) = tokio::join!(
            self.load_variant(request.filters(DataVariant::Regular), chart_metrics.clone()),
            self.load_variant(request.filters(DataVariant::CrystalBall), chart_metrics),
        );
        let (regular, crystal_ball) = (regular?, crystal_ball?);

        let charts = self
            .catalog
            .chart_metrics()
            .iter()
            .map(|chart| self.chart_pair(chart, &regular, &crystal_ball))
            .collect();
        let subscriptions = self.chart_pair(&self.subscriptions_chart(), &regular, &crystal_ball);

        tracing::info!(
            username = %user.username,
            dashboard_id,
            plans = request.plans.len(),
            metrics = request.metrics.len(),
            status = request.plan_status.as_str(),
            "plan overview loaded"
        );

        Ok(PlanOverview {
            regular: build_pivot(&regular.series, &request.metrics, DataVariant::Regular, &self.catalog),
            crystal_ball: build_pivot(
                &crystal_ball.series,
                &request.metrics,
                DataVariant::CrystalBall,
                &self.catalog,
            ),
            charts,
            subscriptions,
        })
    }

    pub async fn refresh_warehouse(&self, user: &CurrentUser) -> StatusResponse {
        if let Err(denied) = self.ensure_any_access(user) {
            return denied;
        }
        tracing::info!(username = %user.username, "warehouse refresh requested");
        self.cache.refresh_warehouse_to_staging().await
    }

    pub async fn refresh_local(&self, user: &CurrentUser) -> StatusResponse {
        if let Err(denied) = self.ensure_any_access(user) {
            return denied;
        }
        tracing::info!(username = %user.username, "staging refresh requested");
        self.cache.refresh_staging_to_local().await
    }

    pub fn list_users(&self, actor: &CurrentUser) -> AppResult<Vec<UserSummary>> {
        if self.live_admin(actor).is_none() {
            return Err(AppError::AccessDenied(ADMIN_REQUIRED.to_string()));
        }
        Ok(self.users.list_users())
    }

    pub fn add_user(&self, actor: &CurrentUser, payload: NewUserPayload) -> StatusResponse {
        if self.live_admin(actor).is_none() {
            return StatusResponse::failed(ADMIN_REQUIRED);
        }
        self.users.add_user(payload)
    }

    pub fn update_user(&self, actor: &CurrentUser, username: &str, payload: UpdateUserPayload) -> StatusResponse {
        if self.live_admin(actor).is_none() {
            return StatusResponse::failed(ADMIN_REQUIRED);
        }
        self.users.update_user(username, payload)
    }

    pub fn delete_user(&self, actor: &CurrentUser, username: &str) -> StatusResponse {
        let Some(admin) = self.live_admin(actor) else {
            return StatusResponse::failed(ADMIN_REQUIRED);
        };
        self.users.delete_user(username, &admin.username)
    }

    /// The actor as the user store sees them now. Sessions outlive role
    /// changes, so the role carried in `actor` is not trusted.
    fn live_admin(&self, actor: &CurrentUser) -> Option<CurrentUser> {
        let live = self.users.current_user(&actor.username).filter(CurrentUser::is_admin);
        if live.is_none() {
            tracing::warn!(username = %actor.username, "admin action denied");
        }
        live
    }

    fn ensure_access(&self, user: &CurrentUser, dashboard_id: &str) -> AppResult<()> {
        if self.users.can_access_dashboard(Some(user), dashboard_id) {
            return Ok(());
        }
        tracing::warn!(username = %user.username, dashboard_id, "dashboard access denied");
        Err(AppError::AccessDenied(format!(
            "You do not have access to dashboard '{}'",
            dashboard_id
        )))
    }

    fn ensure_any_access(&self, user: &CurrentUser) -> Result<(), StatusResponse> {
        if self.users.accessible_dashboards(Some(user)).is_empty() {
            return Err(StatusResponse::failed("You do not have access to any dashboard"));
        }
        Ok(())
    }

    fn chart_metric_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .catalog
            .chart_metrics()
            .iter()
            .map(|chart| chart.metric.clone())
            .collect();
        if !keys.iter().any(|key| key == SUBSCRIPTIONS_METRIC) {
            keys.push(SUBSCRIPTIONS_METRIC.to_string());
        }
        keys
    }

    fn subscriptions_chart(&self) -> ChartMetric {
        self.catalog
            .chart_metrics()
            .iter()
            .find(|chart| chart.metric == SUBSCRIPTIONS_METRIC)
            .cloned()
            .unwrap_or_else(|| ChartMetric {
                metric: SUBSCRIPTIONS_METRIC.to_string(),
                display: self
                    .catalog
                    .definition(SUBSCRIPTIONS_METRIC)
                    .map(|definition| definition.display.clone())
                    .unwrap_or_else(|| SUBSCRIPTIONS_METRIC.to_string()),
                format: MetricFormat::Number,
            })
    }

    fn chart_pair(&self, chart: &ChartMetric, regular: &VariantData, crystal_ball: &VariantData) -> ChartPair {
        let series = |data: &VariantData, variant: DataVariant| {
            let points = data.charts.get(&chart.metric).map(Vec::as_slice).unwrap_or_default();
            build_chart_series(points, chart, variant, &self.catalog, &self.palette)
        };
        ChartPair {
            metric: chart.metric.clone(),
            title: chart_title(chart),
            format: chart.format,
            regular: series(regular, DataVariant::Regular),
            crystal_ball: series(crystal_ball, DataVariant::CrystalBall),
        }
    }

    async fn load_variant(&self, filters: DataFilters, chart_metrics: Vec<String>) -> AppResult<VariantData> {
        let cache = Arc::clone(&self.cache);
        let variant = filters.variant;
        tokio::task::spawn_blocking(move || {
            let (series, charts) = cache.load_variant_data(&filters, &chart_metrics)?;
            Ok(VariantData { series, charts })
        })
        .await
        .map_err(|err| AppError::Internal(format!("{} load task failed: {}", variant.as_str(), err)))?
    }
}

#[cfg(test)]
mod tests {
    use super::DashboardService;
    use crate::cache::CacheCoordinator;
    use crate::config::DashboardConfig;
    use crate::db::Database;
    use crate::errors::{AppError, AppResult};
    use crate::models::{
        CurrentUser, DashboardAccess, DataVariant, MetricSeries, NewUserPayload, OverviewRequest, PlanStatus, Role,
        UpdateUserPayload, WarehouseRow,
    };
    use crate::staging::FileStagingStore;
    use crate::warehouse::Warehouse;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedWarehouse(Vec<WarehouseRow>);

    impl Warehouse for FixedWarehouse {
        fn name(&self) -> &str {
            "fixed"
        }

        fn fetch_extract(&self) -> AppResult<Vec<WarehouseRow>> {
            Ok(self.0.clone())
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, day).expect("valid date")
    }

    fn extract() -> Vec<WarehouseRow> {
        let mut rows = Vec::new();
        for (variant, scale) in [(DataVariant::Regular, 1.0), (DataVariant::CrystalBall, 1.5)] {
            for (plan, day) in [("AT001", 1), ("AT001", 2), ("AT002", 2)] {
                for (metric, value) in [("Subscriptions", 100.0), ("Rebills", 12.3456), ("Churn_Rate", 0.0425)] {
                    rows.push(WarehouseRow {
                        series: MetricSeries::new("AT", plan, date(day), metric, Some(value * scale)),
                        billing_cycle: "1".to_string(),
                        cohort: "All".to_string(),
                        variant,
                        plan_status: PlanStatus::Active,
                    });
                }
            }
        }
        rows
    }

    async fn service(dir: &std::path::Path) -> DashboardService {
        let config = DashboardConfig::builtin().expect("builtin config");
        let db = Arc::new(Database::new(&dir.join("dashboard.db")).expect("db"));
        let cache = Arc::new(CacheCoordinator::new(
            db,
            Arc::new(FixedWarehouse(extract())),
            Arc::new(FileStagingStore::new(dir.join("staging"))),
            Duration::from_secs(5),
        ));
        let outcome = cache.refresh_all().await;
        assert!(outcome.success, "{}", outcome.message);
        DashboardService::new(&config, cache)
    }

    fn request(plans: &[&str], metrics: &[&str]) -> OverviewRequest {
        OverviewRequest {
            from_date: date(1),
            to_date: date(31),
            billing_cycle: "1".to_string(),
            cohort: "All".to_string(),
            plans: plans.iter().map(ToString::to_string).collect(),
            metrics: metrics.iter().map(ToString::to_string).collect(),
            plan_status: PlanStatus::Active,
        }
    }

    fn admin(service: &DashboardService) -> CurrentUser {
        service.authenticate("admin", "admin123").expect("admin login")
    }

    fn outsider() -> CurrentUser {
        CurrentUser {
            username: "outsider".to_string(),
            role: Role::Readonly,
            name: "Outsider".to_string(),
            dashboard_access: DashboardAccess::subset(Vec::<String>::new()),
        }
    }

    #[tokio::test]
    async fn overview_builds_both_variants_and_charts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let viewer = service.authenticate("viewer", "viewer123").expect("viewer login");

        let overview = service
            .plan_overview(
                &viewer,
                "icarus_historical",
                &request(&["AT001", "AT002"], &["Rebills", "Subscriptions"]),
            )
            .await
            .expect("overview");

        assert_eq!(overview.regular.rows.len(), 4);
        assert_eq!(overview.regular.date_columns, vec!["05/02/2025", "05/01/2025"]);
        let rebills_regular = &overview.regular.rows[0];
        assert_eq!(rebills_regular.metric_key, "Rebills");
        assert_eq!(rebills_regular.value("05/02/2025"), Some(12.35));
        let rebills_crystal = &overview.crystal_ball.rows[0];
        assert_eq!(rebills_crystal.value("05/02/2025"), Some(19.0));

        assert_eq!(overview.charts.len(), 3);
        let churn = overview
            .charts
            .iter()
            .find(|pair| pair.metric == "Churn_Rate")
            .expect("churn chart");
        assert_eq!(churn.title, "Churn Rate (%)");
        assert_eq!(churn.regular.len(), 2);
        assert_eq!(churn.regular[0].points[0].value, Some(4.25));
        assert_eq!(overview.subscriptions.regular.len(), 2);
        assert_eq!(overview.subscriptions.regular[1].color, "#2655a0");
    }

    #[tokio::test]
    async fn overview_requires_dashboard_access_and_selection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let admin = admin(&service);

        let disabled = service
            .plan_overview(&admin, "icarus_forecast", &request(&["AT001"], &["Rebills"]))
            .await;
        assert!(matches!(disabled, Err(AppError::AccessDenied(_))));

        let empty = service
            .plan_overview(&admin, "icarus_historical", &request(&["AT001"], &[]))
            .await;
        assert!(matches!(empty, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn filter_options_group_plans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let options = service
            .filter_options(&admin(&service), "icarus_historical", PlanStatus::Active)
            .expect("options");
        assert_eq!(options.plans_by_app["AT"], vec!["AT001", "AT002"]);
        assert_eq!(options.date_bounds.min_date, date(1));
        assert_eq!(options.default_plan.as_deref(), Some("AT001"));
        assert!(!options.metrics.is_empty());
    }

    #[tokio::test]
    async fn hub_marks_reachability_and_blanks_disabled_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let viewer = service.authenticate("viewer", "viewer123").expect("viewer login");

        let hub = service.dashboard_hub(Some(&viewer));
        let historical = hub.iter().find(|entry| entry.id == "icarus_historical").expect("historical");
        assert!(historical.reachable);
        assert_eq!(historical.status, "Active");
        assert_ne!(historical.last_warehouse_refresh, "--");

        let forecast = hub.iter().find(|entry| entry.id == "icarus_forecast").expect("forecast");
        assert!(!forecast.reachable);
        assert_eq!(forecast.last_warehouse_refresh, "--");

        assert!(service.dashboard_hub(None).iter().all(|entry| !entry.reachable));
    }

    #[tokio::test]
    async fn admin_actions_need_admin_role() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let viewer = service.authenticate("viewer", "viewer123").expect("viewer login");
        let payload = NewUserPayload {
            username: "analyst".to_string(),
            password: "pw".to_string(),
            role: Role::Readonly,
            name: "Analyst".to_string(),
            dashboards: DashboardAccess::subset(["icarus_historical"]),
        };

        let denied = service.add_user(&viewer, payload.clone());
        assert_eq!(denied.message, "Admin privileges required");
        assert!(matches!(service.list_users(&viewer), Err(AppError::AccessDenied(_))));

        let admin = admin(&service);
        assert!(service.add_user(&admin, payload).success);
        assert_eq!(service.delete_user(&admin, "admin").message, "Cannot delete yourself");
        assert!(service.delete_user(&admin, "analyst").success);
    }

    #[tokio::test]
    async fn demoted_admin_session_loses_admin_rights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;
        let admin = admin(&service);
        let created = service.add_user(
            &admin,
            NewUserPayload {
                username: "ops".to_string(),
                password: "ops-pw".to_string(),
                role: Role::Admin,
                name: "Ops".to_string(),
                dashboards: DashboardAccess::All,
            },
        );
        assert!(created.success);
        let ops = service.authenticate("ops", "ops-pw").expect("ops login");
        assert_eq!(service.delete_user(&ops, "admin").message, "Cannot delete admin user");

        let demoted = service.update_user(
            &admin,
            "ops",
            UpdateUserPayload {
                role: Some(Role::Readonly),
                ..UpdateUserPayload::default()
            },
        );
        assert!(demoted.success);

        assert!(ops.is_admin());
        assert!(matches!(service.list_users(&ops), Err(AppError::AccessDenied(_))));
        assert_eq!(service.delete_user(&ops, "viewer").message, "Admin privileges required");
        assert!(service.authenticate("viewer", "viewer123").is_some());

        let forged = CurrentUser {
            role: Role::Admin,
            ..outsider()
        };
        let sneaky = NewUserPayload {
            username: "sneaky".to_string(),
            password: "pw".to_string(),
            role: Role::Admin,
            name: "Sneaky".to_string(),
            dashboards: DashboardAccess::All,
        };
        assert_eq!(service.add_user(&forged, sneaky).message, "Admin privileges required");
    }

    #[tokio::test]
    async fn refresh_requires_some_dashboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path()).await;

        let denied = service.refresh_warehouse(&outsider()).await;
        assert!(!denied.success);

        let viewer = service.authenticate("viewer", "viewer123").expect("viewer login");
        assert!(service.refresh_warehouse(&viewer).await.success);
        assert!(service.refresh_local(&viewer).await.success);
    }
}
