//! Reshapes flat metric extracts into the wide pivot table and the per-plan
//! chart series the dashboard pages render.

use crate::colors::ColorPalette;
use crate::config::ChartMetric;
use crate::formatting::MetricCatalog;
use crate::models::{
    ChartPoint, ChartSeries, ChartSeriesPoint, DataVariant, MetricFormat, MetricSeries, PivotCell, PivotRow,
    PivotTable, PlanGroup, RawValue,
};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const DATE_COLUMN_FORMAT: &str = "%m/%d/%Y";

type CellKey<'a> = (&'a str, &'a str, NaiveDate);

/// Builds one row per (app, plan, metric) with a cell for every reporting
/// date in the extract, newest date first.
///
/// Rows are ordered by (app, plan) and then by the caller's metric order.
/// A plan with no value for a metric still gets its row, with empty cells.
pub fn build_pivot(
    series: &[MetricSeries],
    selected_metrics: &[String],
    variant: DataVariant,
    catalog: &MetricCatalog,
) -> PivotTable {
    if series.is_empty() {
        return PivotTable::default();
    }

    let dates: Vec<NaiveDate> = series
        .iter()
        .map(|entry| entry.reporting_date)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .rev()
        .collect();
    let date_columns: Vec<String> = dates
        .iter()
        .map(|date| date.format(DATE_COLUMN_FORMAT).to_string())
        .collect();

    let groups: BTreeSet<(&str, &str)> = series
        .iter()
        .map(|entry| (entry.app.as_str(), entry.plan.as_str()))
        .collect();

    let mut lookup: HashMap<CellKey<'_>, HashMap<&str, Option<&RawValue>>> = HashMap::new();
    for entry in series {
        lookup
            .entry((entry.app.as_str(), entry.plan.as_str(), entry.reporting_date))
            .or_default()
            .insert(entry.metric.as_str(), entry.value.as_ref());
    }

    let metrics = distinct_in_order(selected_metrics);
    let mut rows = Vec::with_capacity(groups.len() * metrics.len());
    for (app, plan) in groups {
        for metric in &metrics {
            let cells = dates
                .iter()
                .zip(&date_columns)
                .map(|(date, column)| {
                    let raw = lookup
                        .get(&(app, plan, *date))
                        .and_then(|values| values.get(metric))
                        .copied()
                        .flatten();
                    PivotCell {
                        date: column.clone(),
                        value: catalog.format_value(raw, metric, variant),
                    }
                })
                .collect();

            rows.push(PivotRow {
                app: app.to_string(),
                plan: plan.to_string(),
                metric: catalog.display_label(metric),
                metric_key: metric.to_string(),
                cells,
            });
        }
    }

    PivotTable { rows, date_columns }
}

pub fn chart_title(chart: &ChartMetric) -> String {
    match chart.format {
        MetricFormat::Dollar => format!("{} ($)", chart.display),
        MetricFormat::Percent => format!("{} (%)", chart.display),
        MetricFormat::Number => chart.display.clone(),
    }
}

/// One series per plan, points in ascending date order, colored with the
/// same assignment the pivot table uses for this plan set.
pub fn build_chart_series(
    points: &[ChartPoint],
    chart: &ChartMetric,
    variant: DataVariant,
    catalog: &MetricCatalog,
    palette: &ColorPalette,
) -> Vec<ChartSeries> {
    let mut by_plan: BTreeMap<&str, BTreeMap<NaiveDate, Option<&RawValue>>> = BTreeMap::new();
    for point in points {
        by_plan
            .entry(point.plan.as_str())
            .or_default()
            .insert(point.reporting_date, point.value.as_ref());
    }

    let colors = palette.assign_colors(by_plan.keys());
    by_plan
        .into_iter()
        .map(|(plan, values)| ChartSeries {
            app: palette.app_for_plan(Some(plan)),
            plan: plan.to_string(),
            color: colors
                .get(plan)
                .cloned()
                .unwrap_or_else(|| palette.fallback_color(0).to_string()),
            points: values
                .into_iter()
                .map(|(reporting_date, raw)| ChartSeriesPoint {
                    reporting_date,
                    value: catalog.format_chart_value(raw, chart, variant),
                })
                .collect(),
        })
        .collect()
}

/// Groups the plan listing by app for the filter checklists.
pub fn plans_by_app(groups: &[PlanGroup]) -> BTreeMap<String, Vec<String>> {
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for group in groups {
        result.entry(group.app.clone()).or_default().push(group.plan.clone());
    }
    for plans in result.values_mut() {
        plans.sort();
        plans.dedup();
    }
    result
}

fn distinct_in_order(values: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(String::as_str)
        .filter(|value| seen.insert(*value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{build_chart_series, build_pivot, chart_title, plans_by_app};
    use crate::colors::ColorPalette;
    use crate::config::{ChartMetric, MetricDefinition};
    use crate::formatting::MetricCatalog;
    use crate::models::{ChartPoint, DataVariant, MetricFormat, MetricSeries, PlanGroup, RawValue};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).expect("valid date")
    }

    fn catalog() -> MetricCatalog {
        MetricCatalog::new(
            vec![
                MetricDefinition {
                    key: "Subscriptions".to_string(),
                    display: "Subscriptions".to_string(),
                    format: MetricFormat::Number,
                    suffix: String::new(),
                },
                MetricDefinition {
                    key: "Churn_Rate".to_string(),
                    display: "Churn Rate".to_string(),
                    format: MetricFormat::Percent,
                    suffix: " (%)".to_string(),
                },
            ],
            Vec::new(),
        )
    }

    fn metrics(keys: &[&str]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn empty_extract_is_empty_table() {
        let table = build_pivot(&[], &metrics(&["Subscriptions"]), DataVariant::Regular, &catalog());
        assert!(table.rows.is_empty());
        assert!(table.date_columns.is_empty());
    }

    #[test]
    fn dates_are_descending_and_formatted() {
        let series = vec![
            MetricSeries::new("AT", "AT001", date(3), "Subscriptions", Some(10.0)),
            MetricSeries::new("AT", "AT001", date(1), "Subscriptions", Some(8.0)),
            MetricSeries::new("AT", "AT001", date(2), "Subscriptions", Some(9.0)),
            MetricSeries::new("AT", "AT001", date(2), "Churn_Rate", Some(0.05)),
        ];
        let table = build_pivot(&series, &metrics(&["Subscriptions"]), DataVariant::Regular, &catalog());
        assert_eq!(table.date_columns, vec!["01/03/2025", "01/02/2025", "01/01/2025"]);
        assert_eq!(table.rows.len(), 1);
        let values: Vec<Option<f64>> = table.rows[0].cells.iter().map(|cell| cell.value).collect();
        assert_eq!(values, vec![Some(10.0), Some(9.0), Some(8.0)]);
    }

    #[test]
    fn every_plan_gets_a_row_per_metric_in_caller_order() {
        let series = vec![
            MetricSeries::new("CL", "CL010", date(1), "Subscriptions", Some(3.0)),
            MetricSeries::new("AT", "AT002", date(1), "Subscriptions", Some(2.0)),
            MetricSeries::new("AT", "AT001", date(2), "Churn_Rate", Some(0.1)),
        ];
        let selected = metrics(&["Churn_Rate", "Subscriptions", "Churn_Rate"]);
        let table = build_pivot(&series, &selected, DataVariant::Regular, &catalog());

        assert_eq!(table.rows.len(), 3 * 2);
        let identity: Vec<(&str, &str, &str)> = table
            .rows
            .iter()
            .map(|row| (row.app.as_str(), row.plan.as_str(), row.metric_key.as_str()))
            .collect();
        assert_eq!(
            identity,
            vec![
                ("AT", "AT001", "Churn_Rate"),
                ("AT", "AT001", "Subscriptions"),
                ("AT", "AT002", "Churn_Rate"),
                ("AT", "AT002", "Subscriptions"),
                ("CL", "CL010", "Churn_Rate"),
                ("CL", "CL010", "Subscriptions"),
            ]
        );

        let at001_churn = &table.rows[0];
        assert_eq!(at001_churn.metric, "Churn Rate (%)");
        assert_eq!(at001_churn.value("01/02/2025"), Some(10.0));
        assert_eq!(at001_churn.value("01/01/2025"), None);

        let cl_churn = &table.rows[4];
        assert!(cl_churn.cells.iter().all(|cell| cell.value.is_none()));
    }

    #[test]
    fn bad_cells_format_to_empty() {
        let series = vec![MetricSeries {
            app: "AT".to_string(),
            plan: "AT001".to_string(),
            reporting_date: date(1),
            metric: "Subscriptions".to_string(),
            value: Some(RawValue::Text("oops".to_string())),
        }];
        let table = build_pivot(&series, &metrics(&["Subscriptions"]), DataVariant::Regular, &catalog());
        assert_eq!(table.rows[0].value("01/01/2025"), None);
    }

    #[test]
    fn chart_series_are_colored_and_ascending() {
        let mut app_colors = BTreeMap::new();
        app_colors.insert("AT".to_string(), "#112233".to_string());
        let palette = ColorPalette::new(app_colors, "#6B7280".to_string(), vec!["#6B7280".to_string()]);
        let chart = ChartMetric {
            metric: "Churn_Rate".to_string(),
            display: "Churn Rate".to_string(),
            format: MetricFormat::Percent,
        };
        let points = vec![
            ChartPoint {
                plan: "AT002".to_string(),
                reporting_date: date(2),
                value: Some(RawValue::Number(0.2)),
            },
            ChartPoint {
                plan: "AT001".to_string(),
                reporting_date: date(2),
                value: Some(RawValue::Number(0.1)),
            },
            ChartPoint {
                plan: "AT001".to_string(),
                reporting_date: date(1),
                value: None,
            },
        ];

        let series = build_chart_series(&points, &chart, DataVariant::Regular, &catalog(), &palette);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].plan, "AT001");
        assert_eq!(series[0].color, "#112233");
        assert_eq!(series[1].color, "#0b1621");
        assert_eq!(series[0].points[0].reporting_date, date(1));
        assert_eq!(series[0].points[0].value, None);
        assert_eq!(series[0].points[1].value, Some(10.0));
        assert_eq!(chart_title(&chart), "Churn Rate (%)");
    }

    #[test]
    fn groups_plans_by_app() {
        let groups = vec![
            PlanGroup {
                app: "CL".to_string(),
                plan: "CL010".to_string(),
            },
            PlanGroup {
                app: "AT".to_string(),
                plan: "AT002".to_string(),
            },
            PlanGroup {
                app: "AT".to_string(),
                plan: "AT001".to_string(),
            },
            PlanGroup {
                app: "AT".to_string(),
                plan: "AT002".to_string(),
            },
        ];
        let grouped = plans_by_app(&groups);
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["AT", "CL"]);
        assert_eq!(grouped["AT"], vec!["AT001", "AT002"]);
    }
}
