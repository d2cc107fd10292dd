//! Pure normalization helpers: sentinels, numeric coercion, unit conversion.
//!
//! Everything in this module is DETERMINISTIC and free of I/O.
//! Same input = same output.

/// Missing-data markers used by QuickStats when a value is withheld or
/// unavailable.
pub const DEFAULT_MISSING_TOKENS: &[&str] = &["(D)", "(NA)", ""];

/// Bushels per metric ton, by commodity.
const BUSHELS_PER_TON: &[(&str, f64)] = &[
    ("SOYBEANS", 36.743),
    ("CORN", 39.368),
    ("WHEAT", 36.743),
];

/// Closed set of sentinel tokens replaced by "no value" at ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingValues {
    tokens: Vec<String>,
}

impl Default for MissingValues {
    fn default() -> Self {
        Self::new(DEFAULT_MISSING_TOKENS.iter().map(|t| t.to_string()))
    }
}

impl MissingValues {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut tokens: Vec<String> = tokens.into_iter().map(|t| t.trim().to_string()).collect();
        // Empty string is always a sentinel.
        if !tokens.iter().any(|t| t.is_empty()) {
            tokens.push(String::new());
        }
        Self { tokens }
    }

    pub fn is_sentinel(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        self.tokens.iter().any(|t| t == trimmed)
    }

    /// Map a sentinel to `None`, pass anything else through unchanged.
    pub fn clean(&self, raw: Option<String>) -> Option<String> {
        raw.filter(|s| !self.is_sentinel(s))
    }
}

/// Parse a reported value: strips grouping separators, returns `None` for
/// anything that is not a finite number.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a year column, accepting `2023` and `2023.0`.
pub fn parse_year(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if let Ok(year) = trimmed.parse::<i32>() {
        return Some(year);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i32::MAX as f64 => Some(f as i32),
        _ => None,
    }
}

/// Upper-case and collapse runs of whitespace to a single space.
pub fn normalize_unit(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Bushels-per-ton factor for `commodity`, if known.
pub fn bushels_per_ton(commodity: &str) -> Option<f64> {
    let key = commodity.trim().to_uppercase();
    BUSHELS_PER_TON
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, factor)| *factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceBasis {
    Bushel,
    Ton,
    Kilogram,
}

/// Denominator of a `$ / X` style unit.
fn price_basis(unit: &str) -> Option<PriceBasis> {
    let (numerator, denominator) = unit.rsplit_once('/')?;
    if !numerator.contains('$') {
        return None;
    }
    match denominator.trim() {
        "BU" | "BUSHEL" | "BUSHELS" => Some(PriceBasis::Bushel),
        "TON" | "TONS" | "TONNE" | "TONNES" | "MT" => Some(PriceBasis::Ton),
        "KG" | "KGS" | "KILOGRAM" | "KILOGRAMS" => Some(PriceBasis::Kilogram),
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Convert a price to a per-ton price.
///
/// Rules, first match wins: per-bushel (commodity factor, unknown commodity
/// gives `None`), per-ton (unchanged), per-kilogram (× 1000), otherwise `None`.
/// `unit` may be raw or normalized.
pub fn convert_to_ton(value: Option<f64>, unit: &str, commodity: &str) -> Option<f64> {
    let value = value?;
    let unit = normalize_unit(unit);
    let converted = match price_basis(&unit)? {
        PriceBasis::Bushel => value * bushels_per_ton(commodity)?,
        PriceBasis::Ton => value,
        PriceBasis::Kilogram => value * 1000.0,
    };
    Some(round2(converted))
}
