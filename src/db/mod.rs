use crate::cache::CommitGate;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChartPoint, DataFilters, DateBounds, MetricSeries, PlanGroup, PlanStatus, RawValue, RefreshTier, StagingSnapshot,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Last successful refresh of one cache tier, as persisted in `cache_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierState {
    pub tier: RefreshTier,
    pub refreshed_at: DateTime<Utc>,
    pub batch_id: Option<String>,
    pub data_as_of: Option<DateTime<Utc>>,
}

/// The local fast store. Holds the promoted metric rows and the refresh
/// bookkeeping for both tiers.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Swaps the whole local snapshot for `snapshot` in one transaction and
    /// records the promotion. Readers see either the old rows or the new ones.
    /// Rolls back if `gate` was cancelled before the commit.
    pub fn replace_metric_rows(
        &self,
        snapshot: &StagingSnapshot,
        promoted_at: DateTime<Utc>,
        gate: &CommitGate,
    ) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM metric_rows", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO metric_rows (
                   app, plan, reporting_date, metric, value_num, value_text,
                   billing_cycle, cohort, variant, plan_status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for row in &snapshot.rows {
                let (value_num, value_text) = split_value(row.series.value.as_ref());
                insert.execute(params![
                    row.series.app,
                    row.series.plan,
                    row.series.reporting_date.to_string(),
                    row.series.metric,
                    value_num,
                    value_text,
                    row.billing_cycle,
                    row.cohort,
                    row.variant.as_str(),
                    row.plan_status.as_str(),
                ])?;
            }
        }
        upsert_tier_state(
            &tx,
            &TierState {
                tier: RefreshTier::Local,
                refreshed_at: promoted_at,
                batch_id: Some(snapshot.batch_id.clone()),
                data_as_of: Some(snapshot.fetched_at),
            },
        )?;
        if !gate.begin_commit() {
            return Err(AppError::Conflict(format!(
                "promotion of batch {} abandoned before commit",
                snapshot.batch_id
            )));
        }
        tx.commit()?;
        Ok(snapshot.rows.len())
    }

    pub fn record_tier_state(&self, state: &TierState) -> AppResult<()> {
        let conn = self.lock()?;
        upsert_tier_state(&conn, state)
    }

    pub fn tier_state(&self, tier: RefreshTier) -> AppResult<Option<TierState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT refreshed_at, batch_id, data_as_of FROM cache_state WHERE tier = ?1",
                [tier.as_str()],
                |row| {
                    let refreshed_at: String = row.get(0)?;
                    let batch_id: Option<String> = row.get(1)?;
                    let data_as_of: Option<String> = row.get(2)?;
                    Ok((refreshed_at, batch_id, data_as_of))
                },
            )
            .optional()?;

        let Some((refreshed_at, batch_id, data_as_of)) = state else {
            return Ok(None);
        };
        Ok(Some(TierState {
            tier,
            refreshed_at: parse_time(&refreshed_at)?,
            batch_id,
            data_as_of: data_as_of.as_deref().map(parse_time).transpose()?,
        }))
    }

    pub fn date_bounds(&self) -> AppResult<Option<DateBounds>> {
        let conn = self.lock()?;
        let (min_date, max_date): (Option<NaiveDate>, Option<NaiveDate>) = conn.query_row(
            "SELECT MIN(reporting_date), MAX(reporting_date) FROM metric_rows",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(match (min_date, max_date) {
            (Some(min_date), Some(max_date)) => Some(DateBounds { min_date, max_date }),
            _ => None,
        })
    }

    pub fn plan_groups(&self, status: PlanStatus) -> AppResult<Vec<PlanGroup>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT DISTINCT app, plan FROM metric_rows WHERE plan_status = ?1 ORDER BY app, plan",
        )?;
        let rows = statement.query_map([status.as_str()], |row| {
            Ok(PlanGroup {
                app: row.get(0)?,
                plan: row.get(1)?,
            })
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn metric_series(&self, filters: &DataFilters) -> AppResult<Vec<MetricSeries>> {
        let conn = self.lock()?;
        query_metric_series(&conn, filters)
    }

    pub fn chart_points(&self, filters: &DataFilters) -> AppResult<BTreeMap<String, Vec<ChartPoint>>> {
        let conn = self.lock()?;
        query_chart_points(&conn, filters)
    }

    /// Pivot series and chart points read from the same promoted snapshot.
    pub fn series_and_chart_points(
        &self,
        series_filters: &DataFilters,
        chart_filters: &DataFilters,
    ) -> AppResult<(Vec<MetricSeries>, BTreeMap<String, Vec<ChartPoint>>)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let series = query_metric_series(&tx, series_filters)?;
        let charts = query_chart_points(&tx, chart_filters)?;
        tx.commit()?;
        Ok((series, charts))
    }

    pub fn row_count(&self) -> AppResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM metric_rows", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn query_metric_series(conn: &Connection, filters: &DataFilters) -> AppResult<Vec<MetricSeries>> {
    let (query, params_vec) = filtered_query(
        "SELECT app, plan, reporting_date, metric, value_num, value_text FROM metric_rows",
        filters,
        " ORDER BY reporting_date DESC, app, plan, metric",
    );

    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
        Ok(MetricSeries {
            app: row.get(0)?,
            plan: row.get(1)?,
            reporting_date: row.get(2)?,
            metric: row.get(3)?,
            value: join_value(row.get(4)?, row.get(5)?),
        })
    })?;

    let mut series = Vec::new();
    for row in rows {
        series.push(row?);
    }
    Ok(series)
}

fn query_chart_points(conn: &Connection, filters: &DataFilters) -> AppResult<BTreeMap<String, Vec<ChartPoint>>> {
    let (query, params_vec) = filtered_query(
        "SELECT metric, plan, reporting_date, value_num, value_text FROM metric_rows",
        filters,
        " ORDER BY metric, plan, reporting_date",
    );

    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
        let metric: String = row.get(0)?;
        Ok((
            metric,
            ChartPoint {
                plan: row.get(1)?,
                reporting_date: row.get(2)?,
                value: join_value(row.get(3)?, row.get(4)?),
            },
        ))
    })?;

    let mut by_metric: BTreeMap<String, Vec<ChartPoint>> = BTreeMap::new();
    for row in rows {
        let (metric, point) = row?;
        by_metric.entry(metric).or_default().push(point);
    }
    Ok(by_metric)
}

fn filtered_query(select: &str, filters: &DataFilters, order_by: &str) -> (String, Vec<String>) {
    let mut query = format!(
        "{} WHERE reporting_date >= ? AND reporting_date <= ? AND billing_cycle = ? AND cohort = ? \
         AND variant = ? AND plan_status = ?",
        select
    );
    let mut params_vec = vec![
        filters.from_date.to_string(),
        filters.to_date.to_string(),
        filters.billing_cycle.clone(),
        filters.cohort.clone(),
        filters.variant.as_str().to_string(),
        filters.plan_status.as_str().to_string(),
    ];

    push_in_clause(&mut query, &mut params_vec, "plan", &filters.plans);
    push_in_clause(&mut query, &mut params_vec, "metric", &filters.metrics);
    query.push_str(order_by);
    (query, params_vec)
}

fn push_in_clause(query: &mut String, params_vec: &mut Vec<String>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    query.push_str(&format!(" AND {} IN ({})", column, placeholders));
    params_vec.extend(values.iter().cloned());
}

fn upsert_tier_state(conn: &Connection, state: &TierState) -> AppResult<()> {
    conn.execute(
        "INSERT INTO cache_state (tier, refreshed_at, batch_id, data_as_of) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tier) DO UPDATE SET
           refreshed_at = excluded.refreshed_at,
           batch_id = excluded.batch_id,
           data_as_of = excluded.data_as_of",
        params![
            state.tier.as_str(),
            state.refreshed_at.to_rfc3339(),
            state.batch_id,
            state.data_as_of.map(|at| at.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn split_value(value: Option<&RawValue>) -> (Option<f64>, Option<String>) {
    match value {
        Some(RawValue::Number(number)) if number.is_finite() => (Some(*number), None),
        Some(RawValue::Number(_)) => (None, None),
        Some(RawValue::Text(text)) => (None, Some(text.clone())),
        None => (None, None),
    }
}

fn join_value(value_num: Option<f64>, value_text: Option<String>) -> Option<RawValue> {
    match (value_num, value_text) {
        (Some(number), _) => Some(RawValue::Number(number)),
        (None, Some(text)) => Some(RawValue::Text(text)),
        (None, None) => None,
    }
}

fn parse_time(raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| AppError::Internal(format!("invalid timestamp '{}': {}", raw, err)))
}
