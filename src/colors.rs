use crate::config::DashboardConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static HEX_COLOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#?([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})$").expect("valid hex color regex"));

/// Shade offsets handed out to the plans of one app in sorted order.
/// Positive values lighten, negative values darken.
pub const SHADE_PATTERN: [f64; 10] = [0.0, -0.35, 0.35, -0.55, 0.55, -0.25, 0.25, -0.45, 0.45, -0.15];

pub const UNKNOWN_APP: &str = "Unknown";
pub const CT_JP_APP: &str = "CT-JP";
pub const CT_NON_JP_APP: &str = "CT-Non-JP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn from_hex(raw: &str) -> Option<Self> {
        let captures = HEX_COLOR_RE.captures(raw.trim())?;
        let channel = |index: usize| u8::from_str_radix(&captures[index], 16).ok();
        Some(Self {
            r: channel(1)?,
            g: channel(2)?,
            b: channel(3)?,
        })
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Moves every channel toward white by `factor` of the remaining distance.
    pub fn lighten(self, factor: f64) -> Self {
        self.map(|c| c + (255.0 - c) * factor)
    }

    /// Scales every channel toward black by `factor`.
    pub fn darken(self, factor: f64) -> Self {
        self.map(|c| c * (1.0 - factor))
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        let channel = |value: u8| f(f64::from(value)).clamp(0.0, 255.0).round() as u8;
        Self {
            r: channel(self.r),
            g: channel(self.g),
            b: channel(self.b),
        }
    }
}

pub fn lighten_hex(hex: &str, factor: f64) -> Option<String> {
    Rgb::from_hex(hex).map(|rgb| rgb.lighten(factor).to_hex())
}

pub fn darken_hex(hex: &str, factor: f64) -> Option<String> {
    Rgb::from_hex(hex).map(|rgb| rgb.darken(factor).to_hex())
}

#[derive(Debug, Clone)]
pub struct ColorPalette {
    app_colors: BTreeMap<String, String>,
    unknown_color: String,
    fallback_colors: Vec<String>,
}

impl ColorPalette {
    pub fn new(app_colors: BTreeMap<String, String>, unknown_color: String, fallback_colors: Vec<String>) -> Self {
        Self {
            app_colors,
            unknown_color,
            fallback_colors,
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(
            config.app_colors.clone(),
            config.unknown_color.clone(),
            config.fallback_colors.clone(),
        )
    }

    /// Derives the app bucket a plan belongs to.
    ///
    /// CT plans split into Japan and non-Japan buckets; every other plan is
    /// keyed by its first two characters when that prefix is a known app.
    pub fn app_for_plan(&self, plan: Option<&str>) -> String {
        let Some(plan) = plan else {
            return UNKNOWN_APP.to_string();
        };

        let upper = plan.to_uppercase();
        if upper.contains("CT") {
            if upper.contains("NON-JP") || upper.contains("NONJP") {
                return CT_NON_JP_APP.to_string();
            }
            if upper.contains("JP") && !upper.contains("NON") {
                return CT_JP_APP.to_string();
            }
            if plan.starts_with("CT") {
                return CT_NON_JP_APP.to_string();
            }
        }

        let prefix: String = plan.chars().take(2).collect();
        if prefix.chars().count() == 2 {
            let prefix = prefix.to_uppercase();
            if self.app_colors.contains_key(&prefix) {
                return prefix;
            }
        }

        UNKNOWN_APP.to_string()
    }

    pub fn base_color(&self, app: &str) -> &str {
        self.app_colors
            .get(app)
            .map(String::as_str)
            .unwrap_or(&self.unknown_color)
    }

    /// Color for the plan sitting at `index_in_app` within its app's sorted plans.
    pub fn plan_color(&self, plan: &str, index_in_app: usize) -> String {
        let base = self.base_color(&self.app_for_plan(Some(plan))).to_string();
        let shade = SHADE_PATTERN[index_in_app % SHADE_PATTERN.len()];

        let shaded = if shade > 0.0 {
            lighten_hex(&base, shade)
        } else if shade < 0.0 {
            darken_hex(&base, shade.abs())
        } else {
            None
        };
        shaded.unwrap_or(base)
    }

    /// Assigns every plan a color. The result depends only on the set of plan
    /// names, never on their order.
    pub fn assign_colors<I, S>(&self, plans: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut by_app: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for plan in plans {
            let plan = plan.as_ref();
            by_app
                .entry(self.app_for_plan(Some(plan)))
                .or_default()
                .push(plan.to_string());
        }

        let mut colors = BTreeMap::new();
        for plans in by_app.values_mut() {
            plans.sort();
            plans.dedup();
            for (index, plan) in plans.iter().enumerate() {
                colors.insert(plan.clone(), self.plan_color(plan, index));
            }
        }
        colors
    }

    /// Colors in the same order as `plans`, for chart traces.
    pub fn chart_colors(&self, plans: &[String]) -> Vec<String> {
        let colors = self.assign_colors(plans);
        plans
            .iter()
            .map(|plan| {
                colors
                    .get(plan)
                    .cloned()
                    .unwrap_or_else(|| self.unknown_color.clone())
            })
            .collect()
    }

    pub fn fallback_color(&self, index: usize) -> &str {
        if self.fallback_colors.is_empty() {
            return &self.unknown_color;
        }
        &self.fallback_colors[index % self.fallback_colors.len()]
    }
}
