use crate::colors::Rgb;
use crate::errors::{AppError, AppResult};
use crate::models::{Dashboard, MetricFormat, Role, UserRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const MAX_AUTO_REFRESH_MINUTES: u64 = 7 * 24 * 60;
pub const CONFIG_PATH_ENV: &str = "PLAN_DASHBOARD_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub key: String,
    pub display: String,
    #[serde(default)]
    pub format: MetricFormat,
    #[serde(default)]
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartMetric {
    pub metric: String,
    pub display: String,
    #[serde(default)]
    pub format: MetricFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub data_dir: PathBuf,
    pub refresh_timeout_seconds: u64,
    #[serde(default)]
    pub auto_refresh_minutes: Option<u64>,
    #[serde(default)]
    pub warehouse_extract_path: Option<PathBuf>,
    pub root_admin: String,
    #[serde(default)]
    pub default_plan: Option<String>,
    pub unknown_color: String,
    pub fallback_colors: Vec<String>,
    pub app_colors: BTreeMap<String, String>,
    pub metrics: Vec<MetricDefinition>,
    #[serde(default)]
    pub chart_metrics: Vec<ChartMetric>,
    #[serde(default)]
    pub billing_cycles: Vec<String>,
    #[serde(default)]
    pub cohorts: Vec<String>,
    pub dashboards: Vec<Dashboard>,
    pub users: Vec<UserRecord>,
}

impl DashboardConfig {
    /// The configuration compiled into the binary.
    pub fn builtin() -> AppResult<Self> {
        Self::from_yaml(DEFAULT_CONFIG_YAML)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("Failed to read config '{}': {}", path.display(), err)))?;
        Self::from_yaml(&raw)
    }

    /// Explicit path first, then `PLAN_DASHBOARD_CONFIG`, then the builtin.
    pub fn load(explicit: Option<&Path>) -> AppResult<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::from_path(Path::new(&path)),
            _ => Self::builtin(),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    /// `None` when auto refresh is off (unset or zero minutes).
    pub fn auto_refresh_interval(&self) -> Option<Duration> {
        self.auto_refresh_minutes
            .filter(|minutes| *minutes > 0)
            .and_then(|minutes| minutes.checked_mul(60))
            .map(Duration::from_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dashboard.db")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.refresh_timeout_seconds == 0 {
            return Err(AppError::Validation(
                "refresh_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if let Some(minutes) = self.auto_refresh_minutes {
            if minutes > MAX_AUTO_REFRESH_MINUTES {
                return Err(AppError::Validation(format!(
                    "auto_refresh_minutes must be at most {} (one week), got {}",
                    MAX_AUTO_REFRESH_MINUTES, minutes
                )));
            }
        }

        if Rgb::from_hex(&self.unknown_color).is_none() {
            return Err(AppError::Validation(format!(
                "unknown_color '{}' is not a #rrggbb color",
                self.unknown_color
            )));
        }
        if self.fallback_colors.is_empty() {
            return Err(AppError::Validation("fallback_colors cannot be empty".to_string()));
        }
        for (label, color) in self
            .app_colors
            .iter()
            .map(|(app, color)| (app.as_str(), color))
            .chain(self.fallback_colors.iter().map(|color| ("fallback", color)))
        {
            if Rgb::from_hex(color).is_none() {
                return Err(AppError::Validation(format!(
                    "color '{}' for '{}' is not a #rrggbb color",
                    color, label
                )));
            }
        }

        let mut metric_keys = BTreeSet::new();
        for metric in &self.metrics {
            if !metric_keys.insert(metric.key.as_str()) {
                return Err(AppError::Validation(format!("duplicate metric '{}'", metric.key)));
            }
        }

        let mut dashboard_ids = BTreeSet::new();
        for dashboard in &self.dashboards {
            if !dashboard_ids.insert(dashboard.id.as_str()) {
                return Err(AppError::Validation(format!("duplicate dashboard '{}'", dashboard.id)));
            }
        }

        let mut usernames = BTreeSet::new();
        for user in &self.users {
            if !usernames.insert(user.username.as_str()) {
                return Err(AppError::Validation(format!("duplicate user '{}'", user.username)));
            }
        }

        let root_is_admin = self
            .users
            .iter()
            .any(|user| user.username == self.root_admin && user.role == Role::Admin);
        if !root_is_admin {
            return Err(AppError::Validation(format!(
                "root admin '{}' must be a configured admin user",
                self.root_admin
            )));
        }

        Ok(())
    }
}
