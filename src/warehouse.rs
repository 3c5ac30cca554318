use crate::errors::{AppError, AppResult};
use crate::models::WarehouseRow;
use serde::Deserialize;
use std::path::PathBuf;

/// The slow, authoritative source of plan metrics.
///
/// `fetch_extract` is blocking and may take a long time; callers run it on
/// the blocking pool under a timeout.
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_extract(&self) -> AppResult<Vec<WarehouseRow>>;
}

/// Reads an exported extract: either a bare JSON array of rows or an object
/// with a `rows` array.
#[derive(Debug, Clone)]
pub struct JsonExtractWarehouse {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractFile {
    Rows(Vec<WarehouseRow>),
    Wrapped { rows: Vec<WarehouseRow> },
}

impl JsonExtractWarehouse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Warehouse for JsonExtractWarehouse {
    fn name(&self) -> &str {
        "json-extract"
    }

    fn fetch_extract(&self) -> AppResult<Vec<WarehouseRow>> {
        let raw = std::fs::read(&self.path).map_err(|err| {
            AppError::UpstreamUnavailable(format!(
                "warehouse extract '{}' unreadable: {}",
                self.path.display(),
                err
            ))
        })?;
        let parsed: ExtractFile = serde_json::from_slice(&raw).map_err(|err| {
            AppError::UpstreamUnavailable(format!(
                "warehouse extract '{}' is malformed: {}",
                self.path.display(),
                err
            ))
        })?;
        Ok(match parsed {
            ExtractFile::Rows(rows) | ExtractFile::Wrapped { rows } => rows,
        })
    }
}

/// Stands in when no extract is configured. Every fetch fails, which leaves
/// whatever the local store already holds servable.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredWarehouse;

impl Warehouse for UnconfiguredWarehouse {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn fetch_extract(&self) -> AppResult<Vec<WarehouseRow>> {
        Err(AppError::UpstreamUnavailable(
            "no warehouse extract configured".to_string(),
        ))
    }
}
