//! Mimir coordinator option schema: declared user options, their domains and defaults.
//!
//! Options arrive as raw strings (ConfigMap data). `OptionSchema::resolve` validates every
//! declared option, applies defaults and reports all offending options at once.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Declared domain of an option value.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// `<= 0` disables the feature; positive values are raised to `floor`.
    Floor { floor: i64 },
    NonNegative,
    /// Mimir duration (`30d`, `1w`, ...) or `0` to disable.
    Duration,
    Bool,
    OneOf { values: &'static [&'static str] },
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub name: &'static str,
    pub domain: Domain,
    pub default: Option<&'static str>,
    pub help: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl OptionValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OptionValue::Int(i) => serde_json::Value::from(*i),
            OptionValue::Bool(b) => serde_json::Value::Bool(*b),
            OptionValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {reason}")]
pub struct OptionError {
    pub name: String,
    pub reason: String,
}

/// Options after validation and defaulting; only declared names are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedOptions(pub BTreeMap<String, OptionValue>);

impl ResolvedOptions {
    pub fn get(&self, name: &str) -> Option<&OptionValue> { self.0.get(name) }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) { Some(OptionValue::Int(i)) => Some(*i), _ => None }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name) { Some(OptionValue::Bool(b)) => Some(*b), _ => None }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) { Some(OptionValue::Str(s)) => Some(s.as_str()), _ => None }
    }
}

pub const EXEMPLARS_FLOOR: i64 = 100_000;

const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

#[derive(Debug, Clone)]
pub struct OptionSchema {
    specs: Vec<OptionSpec>,
}

impl Default for OptionSchema {
    fn default() -> Self { Self::mimir() }
}

impl OptionSchema {
    pub fn new(specs: Vec<OptionSpec>) -> Self { Self { specs } }

    /// Options the coordinator exposes for Mimir.
    pub fn mimir() -> Self {
        Self::new(vec![
            OptionSpec {
                name: "max_global_exemplars_per_user",
                domain: Domain::Floor { floor: EXEMPLARS_FLOOR },
                default: Some("0"),
                help: "Exemplars kept per tenant; <= 0 disables exemplar storage",
            },
            OptionSpec { name: "ingestion_rate", domain: Domain::NonNegative, default: None, help: "Per-tenant samples/s" },
            OptionSpec { name: "ingestion_burst_size", domain: Domain::NonNegative, default: None, help: "Per-tenant burst size" },
            OptionSpec {
                name: "max_global_series_per_user",
                domain: Domain::NonNegative,
                default: None,
                help: "Active series per tenant; 0 means unlimited",
            },
            OptionSpec {
                name: "blocks_retention_period",
                domain: Domain::Duration,
                default: Some("0"),
                help: "Compactor blocks retention, e.g. 30d; 0 keeps blocks forever",
            },
            OptionSpec { name: "log_level", domain: Domain::OneOf { values: LOG_LEVELS }, default: Some("info"), help: "Mimir server log level" },
            OptionSpec { name: "multitenancy_enabled", domain: Domain::Bool, default: Some("false"), help: "Require X-Scope-OrgID" },
        ])
    }

    pub fn specs(&self) -> &[OptionSpec] { &self.specs }

    pub fn spec(&self, name: &str) -> Option<&OptionSpec> { self.specs.iter().find(|s| s.name == name) }

    /// Validate raw options against the schema. Collects every error instead of stopping at the first.
    pub fn resolve(&self, raw: &BTreeMap<String, String>) -> Result<ResolvedOptions, Vec<OptionError>> {
        let mut out = ResolvedOptions::default();
        let mut errors = Vec::new();
        for (name, _) in raw.iter().filter(|(k, _)| self.spec(k).is_none()) {
            errors.push(OptionError { name: name.clone(), reason: "not a declared option".into() });
        }
        for spec in &self.specs {
            let value = match raw.get(spec.name).map(|s| s.trim()).or(spec.default) {
                Some(v) => v,
                None => continue,
            };
            match parse_value(spec.domain, value) {
                Ok(v) => {
                    debug!(option = spec.name, value = ?v, "option resolved");
                    out.0.insert(spec.name.to_string(), v);
                }
                Err(reason) => errors.push(OptionError { name: spec.name.to_string(), reason }),
            }
        }
        if errors.is_empty() { Ok(out) } else { Err(errors) }
    }
}

/// Floor policy: `<= 0` disables (0); below the floor coerces up; otherwise unchanged.
pub fn apply_floor(value: i64, floor: i64) -> i64 {
    if value <= 0 { 0 } else { value.max(floor) }
}

const DURATION_PATTERN: &str = r"^[0-9]+(ms|s|m|h|d|w|y)$";

fn duration_re() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, String>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DURATION_PATTERN).map_err(|e| e.to_string())).as_ref().map_err(|e| format!("duration pattern: {}", e))
}

fn parse_int(value: &str) -> Result<i64, String> {
    value.parse::<i64>().map_err(|_| format!("expected an integer, got {:?}", value))
}

fn parse_value(domain: Domain, value: &str) -> Result<OptionValue, String> {
    match domain {
        Domain::Floor { floor } => Ok(OptionValue::Int(apply_floor(parse_int(value)?, floor))),
        Domain::NonNegative => {
            let v = parse_int(value)?;
            if v < 0 { return Err(format!("must be >= 0, got {}", v)); }
            Ok(OptionValue::Int(v))
        }
        Domain::Duration => {
            if value == "0" { return Ok(OptionValue::Int(0)); }
            if duration_re()?.is_match(value) { Ok(OptionValue::Str(value.to_string())) }
            else { Err(format!("expected a duration like 30d or 0, got {:?}", value)) }
        }
        Domain::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(OptionValue::Bool(true)),
            "false" | "no" | "0" => Ok(OptionValue::Bool(false)),
            _ => Err(format!("expected a boolean, got {:?}", value)),
        },
        Domain::OneOf { values } => {
            let v = value.to_ascii_lowercase();
            if values.contains(&v.as_str()) { Ok(OptionValue::Str(v)) }
            else { Err(format!("expected one of {}, got {:?}", values.join("|"), value)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn floor_policy() {
        assert_eq!(apply_floor(-5, 100_000), 0);
        assert_eq!(apply_floor(0, 100_000), 0);
        assert_eq!(apply_floor(10, 100_000), 100_000);
        assert_eq!(apply_floor(99_999, 100_000), 100_000);
        assert_eq!(apply_floor(100_000, 100_000), 100_000);
        assert_eq!(apply_floor(200_000, 100_000), 200_000);
    }

    #[test]
    fn exemplars_option_follows_floor() {
        let s = OptionSchema::mimir();
        for (input, want) in [("-5", 0), ("10", 100_000), ("200000", 200_000), ("100001", 100_001)] {
            let r = s.resolve(&raw(&[("max_global_exemplars_per_user", input)])).unwrap();
            assert_eq!(r.int("max_global_exemplars_per_user"), Some(want), "input={}", input);
        }
    }

    #[test]
    fn defaults_apply() {
        let r = OptionSchema::mimir().resolve(&BTreeMap::new()).unwrap();
        assert_eq!(r.int("max_global_exemplars_per_user"), Some(0));
        assert_eq!(r.int("blocks_retention_period"), Some(0));
        assert_eq!(r.str("log_level"), Some("info"));
        assert_eq!(r.bool("multitenancy_enabled"), Some(false));
        assert!(r.get("ingestion_rate").is_none());
    }

    #[test]
    fn retention_accepts_durations() {
        let s = OptionSchema::mimir();
        let r = s.resolve(&raw(&[("blocks_retention_period", "1w")])).unwrap();
        assert_eq!(r.str("blocks_retention_period"), Some("1w"));
        assert!(s.resolve(&raw(&[("blocks_retention_period", "a week")])).is_err());
    }

    #[test]
    fn duration_pattern_compiles_once() {
        let re = duration_re().unwrap();
        assert!(re.is_match("30d") && re.is_match("500ms"));
        assert!(!re.is_match("30 d"));
        assert!(std::ptr::eq(re, duration_re().unwrap()));
    }

    #[test]
    fn collects_every_invalid_option() {
        let s = OptionSchema::mimir();
        let errs = s
            .resolve(&raw(&[
                ("ingestion_rate", "-1"),
                ("log_level", "chatty"),
                ("max_global_exemplars_per_user", "lots"),
                ("bogus", "1"),
            ]))
            .unwrap_err();
        let names: Vec<_> = errs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bogus", "max_global_exemplars_per_user", "ingestion_rate", "log_level"]);
        assert!(errs[2].to_string().contains("must be >= 0"));
    }
}
