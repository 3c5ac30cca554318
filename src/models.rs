use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataVariant {
    #[serde(rename = "Regular")]
    Regular,
    #[serde(rename = "Crystal Ball")]
    CrystalBall,
}

impl DataVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "Regular",
            Self::CrystalBall => "Crystal Ball",
        }
    }

    pub fn is_crystal_ball(self) -> bool {
        matches!(self, Self::CrystalBall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanStatus {
    Active,
    Inactive,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }
}

/// A metric value as the warehouse hands it over. Most values are numeric;
/// some extracts carry numbers as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSeries {
    pub app: String,
    pub plan: String,
    pub reporting_date: NaiveDate,
    pub metric: String,
    pub value: Option<RawValue>,
}

impl MetricSeries {
    pub fn new(app: &str, plan: &str, reporting_date: NaiveDate, metric: &str, value: Option<f64>) -> Self {
        Self {
            app: app.to_string(),
            plan: plan.to_string(),
            reporting_date,
            metric: metric.to_string(),
            value: value.map(RawValue::Number),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseRow {
    #[serde(flatten)]
    pub series: MetricSeries,
    pub billing_cycle: String,
    pub cohort: String,
    pub variant: DataVariant,
    pub plan_status: PlanStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingSnapshot {
    pub batch_id: String,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<WarehouseRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGroup {
    pub app: String,
    pub plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateBounds {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFilters {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub billing_cycle: String,
    pub cohort: String,
    pub plans: Vec<String>,
    pub metrics: Vec<String>,
    pub variant: DataVariant,
    pub plan_status: PlanStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub plan: String,
    pub reporting_date: NaiveDate,
    pub value: Option<RawValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotCell {
    pub date: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotRow {
    pub app: String,
    pub plan: String,
    pub metric: String,
    pub metric_key: String,
    pub cells: Vec<PivotCell>,
}

impl PivotRow {
    pub fn value(&self, date_column: &str) -> Option<f64> {
        self.cells
            .iter()
            .find(|cell| cell.date == date_column)
            .and_then(|cell| cell.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotTable {
    pub rows: Vec<PivotRow>,
    pub date_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFormat {
    #[default]
    Number,
    Percent,
    Dollar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeriesPoint {
    pub reporting_date: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub app: String,
    pub plan: String,
    pub color: String,
    pub points: Vec<ChartSeriesPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPair {
    pub metric: String,
    pub title: String,
    pub format: MetricFormat,
    pub regular: Vec<ChartSeries>,
    pub crystal_ball: Vec<ChartSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewRequest {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub billing_cycle: String,
    pub cohort: String,
    pub plans: Vec<String>,
    pub metrics: Vec<String>,
    pub plan_status: PlanStatus,
}

impl OverviewRequest {
    pub fn filters(&self, variant: DataVariant) -> DataFilters {
        DataFilters {
            from_date: self.from_date,
            to_date: self.to_date,
            billing_cycle: self.billing_cycle.clone(),
            cohort: self.cohort.clone(),
            plans: self.plans.clone(),
            metrics: self.metrics.clone(),
            variant,
            plan_status: self.plan_status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOverview {
    pub regular: PivotTable,
    pub crystal_ball: PivotTable,
    pub charts: Vec<ChartPair>,
    /// Subscriber counts per plan, shown alongside every chart panel.
    pub subscriptions: ChartPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub plans_by_app: BTreeMap<String, Vec<String>>,
    pub date_bounds: DateBounds,
    pub billing_cycles: Vec<String>,
    pub cohorts: Vec<String>,
    pub metrics: Vec<MetricOption>,
    pub default_plan: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Readonly,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Readonly => "readonly",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Readonly => "Read Only",
        }
    }
}

/// Which dashboards a user may open. Stored form is either the keyword
/// `"all"` or a list of dashboard ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DashboardAccessRepr", into = "DashboardAccessRepr")]
pub enum DashboardAccess {
    All,
    Subset(BTreeSet<String>),
}

impl DashboardAccess {
    pub fn subset<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Subset(ids.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, dashboard_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Subset(ids) => ids.contains(dashboard_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DashboardAccessRepr {
    Keyword(String),
    Ids(Vec<String>),
}

impl TryFrom<DashboardAccessRepr> for DashboardAccess {
    type Error = String;

    fn try_from(value: DashboardAccessRepr) -> Result<Self, Self::Error> {
        match value {
            DashboardAccessRepr::Keyword(keyword) if keyword.eq_ignore_ascii_case("all") => Ok(Self::All),
            DashboardAccessRepr::Keyword(keyword) => Err(format!(
                "dashboard access must be \"all\" or a list of dashboard ids, got \"{}\"",
                keyword
            )),
            DashboardAccessRepr::Ids(ids) => Ok(Self::Subset(ids.into_iter().collect())),
        }
    }
}

impl From<DashboardAccess> for DashboardAccessRepr {
    fn from(value: DashboardAccess) -> Self {
        match value {
            DashboardAccess::All => Self::Keyword("all".to_string()),
            DashboardAccess::Subset(ids) => Self::Ids(ids.into_iter().collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub name: String,
    pub dashboards: DashboardAccess,
}

/// The identity handed to the core by the session provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub username: String,
    pub role: Role,
    pub name: String,
    pub dashboard_access: DashboardAccess,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<&UserRecord> for CurrentUser {
    fn from(record: &UserRecord) -> Self {
        Self {
            username: record.username.clone(),
            role: record.role,
            name: record.name.clone(),
            dashboard_access: record.dashboards.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub username: String,
    pub name: String,
    pub role: Role,
    pub role_display: String,
    pub dashboard_access: DashboardAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUserPayload {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub name: String,
    pub dashboards: DashboardAccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserPayload {
    pub password: Option<String>,
    pub role: Option<Role>,
    pub name: Option<String>,
    pub dashboards: Option<DashboardAccess>,
}

/// The `(success, message)` pair returned by refreshes and admin mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The two cache tiers a refresh can target: warehouse into staging, and
/// staging into the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshTier {
    Staging,
    Local,
}

impl RefreshTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub last_warehouse_refresh: String,
    pub last_staging_refresh: String,
    pub batch_id: Option<String>,
    pub data_as_of: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub status: String,
    pub reachable: bool,
    pub last_warehouse_refresh: String,
    pub last_staging_refresh: String,
}

#[cfg(test)]
mod tests {
    use super::{DashboardAccess, DataVariant, RawValue, WarehouseRow};

    #[test]
    fn dashboard_access_accepts_keyword_or_list() {
        let all: DashboardAccess = serde_json::from_str("\"all\"").expect("all keyword");
        assert_eq!(all, DashboardAccess::All);

        let subset: DashboardAccess = serde_json::from_str("[\"icarus_historical\"]").expect("id list");
        assert!(subset.allows("icarus_historical"));
        assert!(!subset.allows("other"));

        let bad = serde_json::from_str::<DashboardAccess>("\"some\"");
        assert!(bad.is_err());

        assert_eq!(serde_json::to_string(&DashboardAccess::All).expect("serialize"), "\"all\"");
    }

    #[test]
    fn warehouse_row_reads_flat_json() {
        let row: WarehouseRow = serde_json::from_str(
            r#"{
                "app": "AT",
                "plan": "AT001",
                "reportingDate": "2025-01-31",
                "metric": "Rebills",
                "value": "12.5",
                "billingCycle": "1",
                "cohort": "All",
                "variant": "Crystal Ball",
                "planStatus": "Active"
            }"#,
        )
        .expect("parse row");
        assert_eq!(row.series.plan, "AT001");
        assert_eq!(row.series.value, Some(RawValue::Text("12.5".to_string())));
        assert_eq!(row.variant, DataVariant::CrystalBall);
    }
}
