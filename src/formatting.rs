use crate::config::{ChartMetric, DashboardConfig, MetricDefinition};
use crate::errors::{AppError, AppResult};
use crate::models::{DataVariant, MetricFormat, MetricOption, RawValue};
use std::collections::HashMap;

/// Metric whose Crystal Ball values are whole counts.
pub const REBILLS_METRIC: &str = "Rebills";
/// Always loaded with the chart metrics.
pub const SUBSCRIPTIONS_METRIC: &str = "Subscriptions";

#[derive(Debug, Clone)]
pub struct MetricCatalog {
    ordered: Vec<MetricDefinition>,
    by_key: HashMap<String, usize>,
    chart_metrics: Vec<ChartMetric>,
}

impl MetricCatalog {
    pub fn new(metrics: Vec<MetricDefinition>, chart_metrics: Vec<ChartMetric>) -> Self {
        let by_key = metrics
            .iter()
            .enumerate()
            .map(|(index, metric)| (metric.key.clone(), index))
            .collect();
        Self {
            ordered: metrics,
            by_key,
            chart_metrics,
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(config.metrics.clone(), config.chart_metrics.clone())
    }

    pub fn definition(&self, metric: &str) -> Option<&MetricDefinition> {
        self.by_key.get(metric).map(|index| &self.ordered[*index])
    }

    pub fn format_kind(&self, metric: &str) -> MetricFormat {
        self.definition(metric)
            .map(|definition| definition.format)
            .unwrap_or_default()
    }

    /// Display name plus suffix; unknown metrics are shown by key.
    pub fn display_label(&self, metric: &str) -> String {
        match self.definition(metric) {
            Some(definition) => format!("{}{}", definition.display, definition.suffix),
            None => metric.to_string(),
        }
    }

    pub fn options(&self) -> Vec<MetricOption> {
        self.ordered
            .iter()
            .map(|definition| MetricOption {
                key: definition.key.clone(),
                label: definition.display.clone(),
            })
            .collect()
    }

    pub fn chart_metrics(&self) -> &[ChartMetric] {
        &self.chart_metrics
    }

    /// Formats one raw value for display. `None` means "no data"; a value
    /// that cannot be read as a number is reported as `FormatCoercion`.
    pub fn try_format_value(
        &self,
        raw: Option<&RawValue>,
        metric: &str,
        variant: DataVariant,
    ) -> AppResult<Option<f64>> {
        try_format_as(raw, metric, self.format_kind(metric), variant)
    }

    pub fn format_value(&self, raw: Option<&RawValue>, metric: &str, variant: DataVariant) -> Option<f64> {
        absorb(self.try_format_value(raw, metric, variant), metric)
    }

    /// Chart panels carry their own format kind, which may differ from the
    /// pivot table's.
    pub fn format_chart_value(&self, raw: Option<&RawValue>, chart: &ChartMetric, variant: DataVariant) -> Option<f64> {
        absorb(try_format_as(raw, &chart.metric, chart.format, variant), &chart.metric)
    }
}

fn try_format_as(
    raw: Option<&RawValue>,
    metric: &str,
    kind: MetricFormat,
    variant: DataVariant,
) -> AppResult<Option<f64>> {
    let Some(value) = coerce_numeric(raw)? else {
        return Ok(None);
    };

    if metric == REBILLS_METRIC && variant.is_crystal_ball() {
        return Ok(Some(value.round_ties_even()));
    }

    let formatted = match kind {
        MetricFormat::Percent => round_to(value * 100.0, 2),
        MetricFormat::Number | MetricFormat::Dollar => round_to(value, 2),
    };
    Ok(Some(formatted))
}

fn absorb(result: AppResult<Option<f64>>, metric: &str) -> Option<f64> {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(metric, error = %err, "metric value dropped");
            None
        }
    }
}

fn coerce_numeric(raw: Option<&RawValue>) -> AppResult<Option<f64>> {
    let value = match raw {
        None => return Ok(None),
        Some(RawValue::Number(value)) => *value,
        Some(RawValue::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| AppError::FormatCoercion(format!("'{}' is not numeric", text)))?
        }
    };

    if value.is_nan() {
        return Ok(None);
    }
    if value.is_infinite() {
        return Err(AppError::FormatCoercion(format!("{} is not a finite number", value)));
    }
    Ok(Some(value))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}
