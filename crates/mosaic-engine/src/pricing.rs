use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use serde_json::{Map, Value};

const DEFAULT_PRICING_TABLES_JSON: &str = include_str!("../resources/default_pricing.json");

/// Gemini flash image input price, used when a model has no pricing row.
pub const FALLBACK_COST_PER_IMAGE_USD: f64 = 0.0025;

#[derive(Debug, Clone, Default)]
pub struct PricingTables {
    rows: BTreeMap<String, Map<String, Value>>,
}

impl PricingTables {
    /// Bundled table merged with `$HOME/.mosaic/pricing_overrides.json`.
    pub fn load() -> Self {
        let mut tables = Self::parse(DEFAULT_PRICING_TABLES_JSON);
        if let Some(path) = pricing_override_path() {
            if let Ok(raw) = fs::read_to_string(path) {
                tables.merge(&raw);
            }
        }
        tables
    }

    pub fn parse(raw: &str) -> Self {
        let mut tables = Self::default();
        tables.merge(raw);
        tables
    }

    pub fn merge(&mut self, raw: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(table) = payload.as_object() else {
            return;
        };
        for (pricing_key, row_value) in table {
            let Some(row) = row_value.as_object() else {
                continue;
            };
            let entry = self.rows.entry(pricing_key.to_string()).or_default();
            for (field, field_value) in row {
                entry.insert(field.to_string(), field_value.clone());
            }
        }
    }

    pub fn cost_per_image_usd(&self, pricing_key: Option<&str>) -> f64 {
        self.field(pricing_key, "cost_per_input_image_usd")
            .unwrap_or(FALLBACK_COST_PER_IMAGE_USD)
    }

    pub fn latency_per_batch_s(&self, pricing_key: Option<&str>) -> Option<f64> {
        self.field(pricing_key, "latency_per_batch_s")
    }

    fn field(&self, pricing_key: Option<&str>, field: &str) -> Option<f64> {
        let key = pricing_key.map(str::trim).filter(|value| !value.is_empty())?;
        self.rows
            .get(key)?
            .get(field)
            .and_then(parse_value_to_f64)
            .filter(|value| value.is_finite() && *value >= 0.0)
    }
}

fn pricing_override_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".mosaic").join("pricing_overrides.json"))
}

fn parse_value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
