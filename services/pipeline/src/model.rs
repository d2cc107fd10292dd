//! Typed records flowing between pipeline stages.
//!
//! Every nullable field is an explicit `Option`; stages never rely on a key
//! being absent from a loosely-typed map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Metric
// =============================================================================

/// Statistic category requested from QuickStats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    Price,
    Production,
    Yield,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Price, Metric::Production, Metric::Yield];

    /// QuickStats `statisticcat_desc` facet value.
    pub fn category(&self) -> &'static str {
        match self {
            Metric::Price => "PRICE RECEIVED",
            Metric::Production => "PRODUCTION",
            Metric::Yield => "YIELD",
        }
    }

    /// Canonical column value written to the artifact and the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Price => "PRICE",
            Metric::Production => "PRODUCTION",
            Metric::Yield => "YIELD",
        }
    }

    /// Infer the metric from a declared statistic category.
    pub fn from_category(category: &str) -> Option<Metric> {
        let normalized = category.trim().to_uppercase();
        match normalized.as_str() {
            "PRICE RECEIVED" | "PRICE" => Some(Metric::Price),
            "PRODUCTION" => Some(Metric::Production),
            "YIELD" => Some(Metric::Yield),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::from_category(s).ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

// =============================================================================
// Task
// =============================================================================

/// One extraction unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub commodity: String,
    pub metric: Metric,
    pub region: String,
    pub year_from: i32,
    pub year_to: i32,
}

impl Task {
    /// Deterministic staging key, e.g. `soybeans_IA_price_received_2020_2024`.
    pub fn staging_key(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.commodity.trim().to_lowercase().replace(' ', "_"),
            self.region.trim(),
            self.metric.category().replace(' ', "_").to_lowercase(),
            self.year_from,
            self.year_to
        )
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} ({}-{})",
            self.commodity,
            self.metric.category(),
            self.region,
            self.year_from,
            self.year_to
        )
    }
}

/// Cartesian product commodities × metrics × regions, in that nesting order.
pub fn enumerate_tasks(
    commodities: &[String],
    metrics: &[Metric],
    regions: &[String],
    year_from: i32,
    year_to: i32,
) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(commodities.len() * metrics.len() * regions.len());
    for commodity in commodities {
        for metric in metrics {
            for region in regions {
                tasks.push(Task {
                    commodity: commodity.clone(),
                    metric: *metric,
                    region: region.clone(),
                    year_from,
                    year_to,
                });
            }
        }
    }
    tasks
}

// =============================================================================
// Raw records
// =============================================================================

/// One QuickStats row, projected to the fields the pipeline uses.
///
/// QuickStats mixes JSON numbers and strings for the same column across
/// queries, so every field is read as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state_alpha: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub commodity_desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub statisticcat_desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub unit_desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reference_period_desc: Option<String>,
    #[serde(rename = "Value", default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
}

impl RawRecord {
    /// Every optional text field, in declaration order.
    pub fn fields(&self) -> [Option<&str>; 8] {
        [
            self.year.as_deref(),
            self.state_name.as_deref(),
            self.state_alpha.as_deref(),
            self.commodity_desc.as_deref(),
            self.statisticcat_desc.as_deref(),
            self.unit_desc.as_deref(),
            self.reference_period_desc.as_deref(),
            self.value.as_deref(),
        ]
    }

    /// Apply `f` to every optional text field.
    pub fn map_fields(&mut self, mut f: impl FnMut(Option<String>) -> Option<String>) {
        for field in [
            &mut self.year,
            &mut self.state_name,
            &mut self.state_alpha,
            &mut self.commodity_desc,
            &mut self.statisticcat_desc,
            &mut self.unit_desc,
            &mut self.reference_period_desc,
            &mut self.value,
        ] {
            *field = f(field.take());
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Payload of one Task as staged by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    pub task: Task,
    pub fetched_at: DateTime<Utc>,
    /// `sha256:<hex>` over the serialized records.
    pub content_hash: String,
    pub records: Vec<RawRecord>,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Canonical records
// =============================================================================

/// Canonical output row, also the CSV artifact schema and the store schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub year: i32,
    pub region_name: String,
    pub commodity: String,
    pub metric: Metric,
    pub unit: String,
    pub raw_value: Option<f64>,
    pub derived_value_per_ton: Option<f64>,
}

/// Full merged output of one run.
pub type CanonicalDataset = Vec<NormalizedRecord>;

// =============================================================================
// Replace scope
// =============================================================================

/// Rows removed from the destination before new rows are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceScope {
    Everything,
    Subset { commodity: String, region: String },
}

impl ReplaceScope {
    /// One commodity in one region. Both are trimmed and upper-cased to match
    /// the stored form of normalized rows.
    pub fn subset(commodity: &str, region: &str) -> Self {
        ReplaceScope::Subset {
            commodity: commodity.trim().to_uppercase(),
            region: region.trim().to_uppercase(),
        }
    }

    /// True when `record` belongs to the slice this scope replaces. Exact
    /// comparison, the same predicate the store's delete uses.
    pub fn covers(&self, record: &NormalizedRecord) -> bool {
        match self {
            ReplaceScope::Everything => true,
            ReplaceScope::Subset { commodity, region } => {
                record.commodity == *commodity && record.region_name == *region
            }
        }
    }
}

impl fmt::Display for ReplaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceScope::Everything => f.write_str("everything"),
            ReplaceScope::Subset { commodity, region } => {
                write!(f, "subset(commodity={}, region={})", commodity, region)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_key_is_deterministic() {
        let task = Task {
            commodity: "SOYBEANS".to_string(),
            metric: Metric::Price,
            region: "IA".to_string(),
            year_from: 2020,
            year_to: 2024,
        };
        assert_eq!(task.staging_key(), "soybeans_IA_price_received_2020_2024");
        assert_eq!(task.staging_key(), task.clone().staging_key());
    }

    #[test]
    fn test_enumerate_tasks_is_cartesian_product() {
        let tasks = enumerate_tasks(
            &["CORN".to_string(), "WHEAT".to_string()],
            &Metric::ALL,
            &["IA".to_string(), "IL".to_string(), "MN".to_string()],
            2020,
            2024,
        );
        assert_eq!(tasks.len(), 18);
        assert_eq!(tasks[0].commodity, "CORN");
        assert_eq!(tasks[0].metric, Metric::Price);
        assert_eq!(tasks[1].region, "IL");
        assert_eq!(tasks[17].commodity, "WHEAT");
        assert_eq!(tasks[17].metric, Metric::Yield);
    }

    #[test]
    fn test_metric_from_category() {
        assert_eq!(Metric::from_category("PRICE RECEIVED"), Some(Metric::Price));
        assert_eq!(Metric::from_category(" yield "), Some(Metric::Yield));
        assert_eq!(Metric::from_category("AREA PLANTED"), None);
    }

    #[test]
    fn test_raw_record_accepts_numbers_and_strings() {
        let json = r#"{"year": 2023, "state_name": "IOWA", "Value": "4.50", "unit_desc": "$ / BU", "extra": 1}"#;
        let record: RawRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.year.as_deref(), Some("2023"));
        assert_eq!(record.value.as_deref(), Some("4.50"));
        assert_eq!(record.commodity_desc, None);
    }

    #[test]
    fn test_subset_scope_covers_matching_rows_only() {
        let scope = ReplaceScope::subset("CORN", "IOWA");
        let mut record = NormalizedRecord {
            year: 2023,
            region_name: "IOWA".to_string(),
            commodity: "CORN".to_string(),
            metric: Metric::Price,
            unit: "$ / BU".to_string(),
            raw_value: Some(4.5),
            derived_value_per_ton: Some(177.16),
        };
        assert!(scope.covers(&record));
        record.region_name = "ILLINOIS".to_string();
        assert!(!scope.covers(&record));
        assert!(ReplaceScope::Everything.covers(&record));
    }

    #[test]
    fn test_subset_constructor_normalizes_case() {
        let scope = ReplaceScope::subset(" corn ", "Iowa");
        assert_eq!(
            scope,
            ReplaceScope::Subset {
                commodity: "CORN".to_string(),
                region: "IOWA".to_string(),
            }
        );
    }

    #[test]
    fn test_subset_covers_is_exact() {
        let record = NormalizedRecord {
            year: 2023,
            region_name: "IOWA".to_string(),
            commodity: "CORN".to_string(),
            metric: Metric::Price,
            unit: "$ / BU".to_string(),
            raw_value: Some(4.5),
            derived_value_per_ton: None,
        };
        // A hand-built lower-case scope matches nothing, same as the SQL delete.
        let raw_scope = ReplaceScope::Subset {
            commodity: "corn".to_string(),
            region: "iowa".to_string(),
        };
        assert!(!raw_scope.covers(&record));
        assert!(ReplaceScope::subset("corn", "iowa").covers(&record));
    }
}
