//! Two-tier cache in front of the warehouse.
//!
//! Refreshes move data warehouse -> staging -> local store, each step under
//! its own lock. Reads are served only from the local store and never
//! trigger a refresh.

use crate::db::{Database, TierState};
use crate::errors::{AppError, AppResult};
use crate::models::{
    CacheInfo, ChartPoint, DataFilters, DateBounds, MetricSeries, PlanGroup, PlanStatus, RefreshTier, StagingSnapshot,
    StatusResponse,
};
use crate::staging::StagingStore;
use crate::warehouse::Warehouse;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

pub const UNSET_TIMESTAMP: &str = "--";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const GATE_OPEN: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Settles once whether a refresh step commits or is abandoned.
///
/// The step calls `begin_commit` right before its write becomes visible and
/// the coordinator calls `cancel` when the step outlives the refresh timeout.
/// Whichever call comes first wins.
#[derive(Debug, Default)]
pub struct CommitGate {
    state: AtomicU8,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_commit(&self) -> bool {
        self.settle(GATE_COMMITTING)
    }

    pub fn cancel(&self) -> bool {
        self.settle(GATE_CANCELLED)
    }

    fn settle(&self, outcome: u8) -> bool {
        match self
            .state
            .compare_exchange(GATE_OPEN, outcome, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == outcome,
        }
    }
}

/// Held by a refresh and by every blocking step it spawned.
type TierGuard = Arc<OwnedMutexGuard<()>>;

pub struct CacheCoordinator {
    db: Arc<Database>,
    warehouse: Arc<dyn Warehouse>,
    staging: Arc<dyn StagingStore>,
    refresh_timeout: Duration,
    warehouse_refresh: Arc<Mutex<()>>,
    staging_refresh: Arc<Mutex<()>>,
}

impl CacheCoordinator {
    pub fn new(
        db: Arc<Database>,
        warehouse: Arc<dyn Warehouse>,
        staging: Arc<dyn StagingStore>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            db,
            warehouse,
            staging,
            refresh_timeout,
            warehouse_refresh: Arc::new(Mutex::new(())),
            staging_refresh: Arc::new(Mutex::new(())),
        }
    }

    pub fn load_date_bounds(&self) -> AppResult<DateBounds> {
        self.db
            .date_bounds()
            .map_err(AppError::into_upstream)?
            .ok_or_else(|| AppError::UpstreamUnavailable("local store holds no promoted data".to_string()))
    }

    pub fn load_plan_groups(&self, status: PlanStatus) -> AppResult<Vec<PlanGroup>> {
        self.db.plan_groups(status).map_err(AppError::into_upstream)
    }

    pub fn load_pivot_data(&self, filters: &DataFilters) -> AppResult<Vec<MetricSeries>> {
        validate_selection(filters)?;
        self.db.metric_series(filters).map_err(AppError::into_upstream)
    }

    /// Chart points for every metric in `metrics`, keyed by metric.
    pub fn load_all_chart_data(
        &self,
        filters: &DataFilters,
        metrics: &[String],
    ) -> AppResult<BTreeMap<String, Vec<ChartPoint>>> {
        let filters = DataFilters {
            metrics: metrics.to_vec(),
            ..filters.clone()
        };
        validate_selection(&filters)?;
        self.db.chart_points(&filters).map_err(AppError::into_upstream)
    }

    /// Pivot series and chart points for one variant, read from the same
    /// promoted snapshot.
    pub fn load_variant_data(
        &self,
        filters: &DataFilters,
        chart_metrics: &[String],
    ) -> AppResult<(Vec<MetricSeries>, BTreeMap<String, Vec<ChartPoint>>)> {
        let chart_filters = DataFilters {
            metrics: chart_metrics.to_vec(),
            ..filters.clone()
        };
        validate_selection(filters)?;
        validate_selection(&chart_filters)?;
        self.db
            .series_and_chart_points(filters, &chart_filters)
            .map_err(AppError::into_upstream)
    }

    /// Pulls the full extract into a fresh staging snapshot.
    pub async fn refresh_warehouse_to_staging(&self) -> StatusResponse {
        let Ok(guard) = Arc::clone(&self.warehouse_refresh).try_lock_owned() else {
            return StatusResponse::failed("Warehouse refresh already in progress");
        };

        match self.pull_warehouse(Arc::new(guard)).await {
            Ok((batch_id, rows)) => {
                tracing::info!(batch_id = %batch_id, rows, warehouse = self.warehouse.name(), "staging snapshot written");
                StatusResponse::ok(format!("Cached {} rows from the warehouse to staging", rows))
            }
            Err(err) => {
                tracing::warn!(error = %err, warehouse = self.warehouse.name(), "warehouse refresh failed");
                StatusResponse::failed(format!("Warehouse refresh failed: {}", err.detail()))
            }
        }
    }

    /// Promotes the latest staging snapshot into the local store.
    pub async fn refresh_staging_to_local(&self) -> StatusResponse {
        let Ok(guard) = Arc::clone(&self.staging_refresh).try_lock_owned() else {
            return StatusResponse::failed("Staging refresh already in progress");
        };

        match self.promote_staging(Arc::new(guard)).await {
            Ok((batch_id, rows)) => {
                tracing::info!(batch_id = %batch_id, rows, "staging snapshot promoted");
                StatusResponse::ok(format!("Loaded {} rows from staging into the local store", rows))
            }
            Err(err) => {
                tracing::warn!(error = %err, "staging refresh failed");
                StatusResponse::failed(format!("Staging refresh failed: {}", err.detail()))
            }
        }
    }

    /// Both stages in order; a failed warehouse pull skips promotion.
    pub async fn refresh_all(&self) -> StatusResponse {
        let pulled = self.refresh_warehouse_to_staging().await;
        if !pulled.success {
            return pulled;
        }
        let promoted = self.refresh_staging_to_local().await;
        if !promoted.success {
            return promoted;
        }
        StatusResponse::ok(format!("{}. {}", pulled.message, promoted.message))
    }

    pub fn get_cache_info(&self) -> CacheInfo {
        let staging = self.tier_state_or_log(RefreshTier::Staging);
        let local = self.tier_state_or_log(RefreshTier::Local);

        CacheInfo {
            last_warehouse_refresh: display_timestamp(staging.as_ref().map(|state| state.refreshed_at)),
            last_staging_refresh: display_timestamp(local.as_ref().map(|state| state.refreshed_at)),
            batch_id: local.as_ref().and_then(|state| state.batch_id.clone()),
            data_as_of: local
                .as_ref()
                .and_then(|state| state.data_as_of)
                .map(|at| at.format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    async fn pull_warehouse(&self, tier: TierGuard) -> AppResult<(String, usize)> {
        let warehouse = Arc::clone(&self.warehouse);
        let rows = self
            .run_blocking("warehouse fetch", &tier, move |_| warehouse.fetch_extract())
            .await?;
        if rows.is_empty() {
            return Err(AppError::UpstreamUnavailable("warehouse returned no rows".to_string()));
        }

        let snapshot = StagingSnapshot {
            batch_id: Uuid::new_v4().to_string(),
            fetched_at: Utc::now(),
            rows,
        };
        let batch_id = snapshot.batch_id.clone();
        let fetched_at = snapshot.fetched_at;
        let row_count = snapshot.rows.len();

        let staging = Arc::clone(&self.staging);
        self.run_blocking("staging write", &tier, move |gate| staging.write_snapshot(&snapshot, gate))
            .await?;

        let previous = self.db.tier_state(RefreshTier::Staging)?;
        self.db.record_tier_state(&TierState {
            tier: RefreshTier::Staging,
            refreshed_at: monotonic(previous.as_ref(), fetched_at),
            batch_id: Some(batch_id.clone()),
            data_as_of: Some(fetched_at),
        })?;
        Ok((batch_id, row_count))
    }

    async fn promote_staging(&self, tier: TierGuard) -> AppResult<(String, usize)> {
        let staging = Arc::clone(&self.staging);
        let snapshot = self
            .run_blocking("staging read", &tier, move |_| staging.read_latest())
            .await?
            .ok_or_else(|| AppError::NotFound("no staging snapshot available".to_string()))?;

        let previous = self.db.tier_state(RefreshTier::Local)?;
        let promoted_at = monotonic(previous.as_ref(), Utc::now());
        let batch_id = snapshot.batch_id.clone();

        let db = Arc::clone(&self.db);
        let rows = self
            .run_blocking("local promotion", &tier, move |gate| {
                db.replace_metric_rows(&snapshot, promoted_at, gate)
            })
            .await?;
        Ok((batch_id, rows))
    }

    /// Runs `job` on the blocking pool under the refresh timeout. The job
    /// keeps the tier locked until it returns, even after the caller has
    /// given up, and a timed-out job is refused at its commit point.
    async fn run_blocking<T, F>(&self, operation: &'static str, tier: &TierGuard, job: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CommitGate) -> AppResult<T> + Send + 'static,
    {
        let gate = Arc::new(CommitGate::new());
        let job_gate = Arc::clone(&gate);
        let held = Arc::clone(tier);
        let mut handle = tokio::task::spawn_blocking(move || {
            let _held = held;
            job(&job_gate)
        });

        let joined = match timeout(self.refresh_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) if gate.cancel() => {
                return Err(AppError::UpstreamUnavailable(format!(
                    "{} timed out after {}s",
                    operation,
                    self.refresh_timeout.as_secs_f64()
                )))
            }
            Err(_) => {
                tracing::debug!(operation, "refresh step already committing past its timeout");
                handle.await
            }
        };
        match joined {
            Ok(result) => result.map_err(AppError::into_upstream),
            Err(join_error) => Err(AppError::Internal(format!("{} task failed: {}", operation, join_error))),
        }
    }

    fn tier_state_or_log(&self, tier: RefreshTier) -> Option<TierState> {
        match self.db.tier_state(tier) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(tier = tier.as_str(), error = %err, "cache state unreadable");
                None
            }
        }
    }
}

fn validate_selection(filters: &DataFilters) -> AppResult<()> {
    if filters.metrics.is_empty() {
        return Err(AppError::Validation("Please select at least one metric".to_string()));
    }
    if filters.plans.is_empty() {
        return Err(AppError::Validation("Please select at least one plan".to_string()));
    }
    if filters.from_date > filters.to_date {
        return Err(AppError::Validation(format!(
            "start date {} is after end date {}",
            filters.from_date, filters.to_date
        )));
    }
    Ok(())
}

/// Refresh timestamps never move backwards, even if the clock does.
fn monotonic(previous: Option<&TierState>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    previous
        .map(|state| state.refreshed_at.max(candidate))
        .unwrap_or(candidate)
}

pub fn display_timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|at| at.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| UNSET_TIMESTAMP.to_string())
}
