//! Declarative field coercion plus the per-record transformation pipeline
//! (exclude -> alias -> normalize -> derive).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use frac_core::{Record, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "frac-transform";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {context}: {source}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("parser {parser:?} rule {index}: invalid pattern {pattern:?}: {source}")]
    Pattern {
        parser: String,
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("parser {parser:?}: {message}")]
    Rule { parser: String, message: String },
    #[error("{0}")]
    Invalid(String),
}

/// Scalar type a coercion rule converts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "double", alias = "decimal")]
    Float,
    #[serde(alias = "str", alias = "text")]
    String,
    Date,
    DateTime,
    #[serde(alias = "boolean")]
    Bool,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Int => "int",
            TargetType::Float => "float",
            TargetType::String => "string",
            TargetType::Date => "date",
            TargetType::DateTime => "datetime",
            TargetType::Bool => "bool",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field that failed coercion. Collected, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("field {field:?}: cannot parse {raw:?} as {target} ({parser}): {message}")]
pub struct ParseError {
    pub field: String,
    pub parser: String,
    pub target: TargetType,
    pub raw: String,
    pub message: String,
}

/// One `{pattern, type}` entry. The pattern is a regex matched against the
/// whole field name.
#[derive(Debug, Clone)]
pub struct CoercionRule {
    pub parser: String,
    pub pattern: String,
    pub target: TargetType,
    matcher: Regex,
}

impl CoercionRule {
    pub fn new(
        parser: impl Into<String>,
        pattern: impl Into<String>,
        target: TargetType,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let matcher = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            parser: parser.into(),
            pattern,
            target,
            matcher,
        })
    }

    pub fn matches(&self, field: &str) -> bool {
        self.matcher.is_match(field)
    }

    pub fn parse(&self, field: &str, value: &Value) -> Result<Value, ParseError> {
        coerce(value, self.target).map_err(|message| ParseError {
            field: field.to_string(),
            parser: self.parser.clone(),
            target: self.target,
            raw: value.to_string(),
            message,
        })
    }
}

/// Coerce `value` according to `rule`. Spelled out for call sites that do not
/// track a field name.
pub fn parse(value: &Value, rule: &CoercionRule) -> Result<Value, ParseError> {
    rule.parse(&rule.pattern, value)
}

#[derive(Debug, Clone)]
pub struct NamedParser {
    pub name: String,
    pub rules: Vec<CoercionRule>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParserDef {
    Wrapped { rules: Vec<RuleDef> },
    Bare(Vec<RuleDef>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDef {
    Explicit {
        pattern: String,
        #[serde(rename = "type")]
        target: TargetType,
    },
    Shorthand(BTreeMap<String, TargetType>),
}

/// Ordered coercion rules, grouped under logical parser names. Immutable once
/// loaded; evaluation order is declaration order so later rules win.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    parsers: Vec<NamedParser>,
}

impl Ruleset {
    /// Accepts either the parser mapping itself or a document holding it under
    /// a `parsers` key.
    pub fn load(config: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let root = config.get("parsers").unwrap_or(config);
        let mapping = match root {
            serde_yaml::Value::Null => return Ok(Self::default()),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::Invalid(
                    "parsers must be a mapping of parser name to rules".to_string(),
                ))
            }
        };

        let mut parsers = Vec::with_capacity(mapping.len());
        for (name, def) in mapping {
            let name = name
                .as_str()
                .ok_or_else(|| ConfigError::Invalid(format!("parser name {name:?} is not a string")))?
                .to_string();
            let def: ParserDef =
                serde_yaml::from_value(def.clone()).map_err(|source| ConfigError::Yaml {
                    context: format!("parser {name:?}"),
                    source,
                })?;
            let defs = match def {
                ParserDef::Wrapped { rules } | ParserDef::Bare(rules) => rules,
            };

            let mut rules = Vec::with_capacity(defs.len());
            for (index, def) in defs.into_iter().enumerate() {
                let (pattern, target) = match def {
                    RuleDef::Explicit { pattern, target } => (pattern, target),
                    RuleDef::Shorthand(entry) if entry.len() == 1 => {
                        entry.into_iter().next().ok_or_else(|| ConfigError::Rule {
                            parser: name.clone(),
                            message: format!("rule {index} is empty"),
                        })?
                    }
                    RuleDef::Shorthand(entry) => {
                        return Err(ConfigError::Rule {
                            parser: name.clone(),
                            message: format!(
                                "rule {index} must map exactly one pattern, found {}",
                                entry.len()
                            ),
                        })
                    }
                };
                let rule = CoercionRule::new(name.clone(), pattern.clone(), target).map_err(
                    |source| ConfigError::Pattern {
                        parser: name.clone(),
                        index,
                        pattern,
                        source,
                    },
                )?;
                rules.push(rule);
            }
            parsers.push(NamedParser { name, rules });
        }

        Ok(Self { parsers })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                context: "ruleset".to_string(),
                source,
            })?;
        Self::load(&value)
    }

    pub fn parsers(&self) -> &[NamedParser] {
        &self.parsers
    }

    /// Every rule, across parsers, in declaration order.
    pub fn rules(&self) -> impl Iterator<Item = &CoercionRule> {
        self.parsers.iter().flat_map(|p| p.rules.iter())
    }

    pub fn rule_count(&self) -> usize {
        self.parsers.iter().map(|p| p.rules.len()).sum()
    }
}

fn coerce(value: &Value, target: TargetType) -> Result<Value, String> {
    if let Value::Str(s) = value {
        if s.trim().is_empty() {
            return Ok(Value::Null);
        }
    }
    match value {
        Value::Null => Ok(Value::Null),
        _ => match target {
            TargetType::String => Ok(Value::Str(value.to_string())),
            TargetType::Int => to_int(value).map(Value::Int),
            TargetType::Float => to_float(value).map(Value::Float),
            TargetType::Bool => to_bool(value).map(Value::Bool),
            TargetType::Date => to_date(value).map(Value::Date),
            TargetType::DateTime => to_datetime(value).map(Value::DateTime),
        },
    }
}

fn float_to_int(f: f64) -> Result<i64, String> {
    let truncated = f.trunc();
    if !truncated.is_finite() || truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(format!("{f} is out of integer range"));
    }
    Ok(truncated as i64)
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => float_to_int(*f),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Str(s) => {
            let s = s.trim();
            s.parse::<i64>().or_else(|_| {
                s.parse::<f64>()
                    .map_err(|e| e.to_string())
                    .and_then(float_to_int)
            })
        }
        other => Err(format!("{} is not numeric", other.kind())),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    let parsed = match value {
        Value::Float(f) => *f,
        Value::Int(i) => *i as f64,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Str(s) => s.trim().parse::<f64>().map_err(|e| e.to_string())?,
        other => return Err(format!("{} is not numeric", other.kind())),
    };
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err("not a finite number".to_string())
    }
}

fn to_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err("invalid literal for boolean".to_string()),
        },
        other => Err(format!("{} is not a boolean", other.kind())),
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn to_date(value: &Value) -> Result<NaiveDate, String> {
    match value {
        Value::Date(d) => Ok(*d),
        Value::DateTime(ts) => Ok(ts.date_naive()),
        Value::Str(s) => {
            let s = s.trim();
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .or_else(|| parse_naive_datetime(s).map(|ts| ts.date()))
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|ts| ts.date_naive()))
                .ok_or_else(|| "unrecognized date format".to_string())
        }
        other => Err(format!("{} is not a date", other.kind())),
    }
}

fn to_datetime(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::DateTime(ts) => Ok(*ts),
        Value::Date(d) => Ok(d.and_time(NaiveTime::MIN).and_utc()),
        Value::Str(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_naive_datetime(s).map(|ts| ts.and_utc()))
                .or_else(|| {
                    DATE_FORMATS
                        .iter()
                        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
                })
                .ok_or_else(|| "unrecognized datetime format".to_string())
        }
        other => Err(format!("{} is not a datetime", other.kind())),
    }
}

/// Record-level failure causes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformFailure {
    #[error("more than one source field maps to {field:?}")]
    AliasCollision { field: String },
    #[error("normalized key {key:?} collides with another field")]
    KeyCollision { key: String },
    #[error("{count} parse errors exceed the limit of {limit}")]
    TooManyParseErrors { count: usize, limit: usize },
}

impl TransformFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            TransformFailure::AliasCollision { .. } => "alias_collision",
            TransformFailure::KeyCollision { .. } => "key_collision",
            TransformFailure::TooManyParseErrors { .. } => "too_many_parse_errors",
        }
    }
}

/// The whole record failed; nothing of it should be written.
#[derive(Debug, Error)]
#[error("record transformation failed: {cause}")]
pub struct TransformationError {
    #[source]
    pub cause: TransformFailure,
    pub parse_errors: Vec<ParseError>,
}

impl TransformationError {
    pub fn reason(&self) -> &'static str {
        self.cause.reason()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: Record,
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Clone)]
pub struct RowNormalizer {
    ruleset: Arc<Ruleset>,
    normalize_keys: bool,
}

impl RowNormalizer {
    pub fn new(ruleset: Arc<Ruleset>, normalize_keys: bool) -> Self {
        Self {
            ruleset,
            normalize_keys,
        }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Trim and lowercase every key.
    pub fn normalize_keys(&self, record: Record) -> Result<Record, TransformFailure> {
        let mut out = Record::new();
        for (key, value) in record {
            let normalized = key.trim().to_lowercase();
            if out.contains_key(&normalized) {
                return Err(TransformFailure::KeyCollision { key: normalized });
            }
            out.insert(normalized, value);
        }
        Ok(out)
    }

    /// Coerce every value with the last declared rule whose pattern matches its
    /// key. A failing field becomes null and its error is collected; the key set
    /// never changes.
    pub fn parse_value_dtypes(&self, mut record: Record) -> Normalized {
        let mut errors = Vec::new();
        for (field, value) in record.iter_mut() {
            let Some(rule) = self.ruleset.rules().filter(|r| r.matches(field)).last() else {
                continue;
            };
            match rule.parse(field, value) {
                Ok(parsed) => *value = parsed,
                Err(err) => {
                    errors.push(err);
                    *value = Value::Null;
                }
            }
        }
        Normalized { record, errors }
    }

    pub fn parse(&self, record: Record, parse_dtypes: bool) -> Result<Normalized, TransformFailure> {
        if !parse_dtypes {
            return Ok(Normalized {
                record,
                errors: Vec::new(),
            });
        }
        let record = if self.normalize_keys {
            self.normalize_keys(record)?
        } else {
            record
        };
        Ok(self.parse_value_dtypes(record))
    }
}

/// Fixed-length prefix of one field copied into another, e.g. api10 from api14.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedField {
    pub from: String,
    pub to: String,
    pub length: usize,
}

/// Per-dataset transformation settings as they appear in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub derive: Vec<DerivedField>,
    #[serde(default)]
    pub normalize_keys: bool,
    #[serde(default)]
    pub max_parse_errors: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub fields: Record,
    pub parse_errors: Vec<ParseError>,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    aliases: BTreeMap<String, String>,
    exclude: BTreeSet<String>,
    derive: Vec<DerivedField>,
    normalizer: RowNormalizer,
    max_parse_errors: Option<usize>,
}

impl Transformer {
    pub fn new(spec: TransformSpec, ruleset: Arc<Ruleset>) -> Result<Self, ConfigError> {
        let mut destinations = BTreeSet::new();
        for (source, destination) in &spec.aliases {
            if !destinations.insert(destination.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "alias {source:?} -> {destination:?}: destination is mapped more than once"
                )));
            }
        }
        for derived in &spec.derive {
            if derived.length == 0 || derived.from.is_empty() || derived.to.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "derived field {:?} needs a source and a positive length",
                    derived.to
                )));
            }
        }

        Ok(Self {
            aliases: spec.aliases,
            exclude: spec.exclude.into_iter().collect(),
            derive: spec.derive,
            normalizer: RowNormalizer::new(ruleset, spec.normalize_keys),
            max_parse_errors: spec.max_parse_errors,
        })
    }

    pub fn normalizer(&self) -> &RowNormalizer {
        &self.normalizer
    }

    pub fn drop_exclusions(&self, mut record: Record) -> Record {
        if !self.exclude.is_empty() {
            record.retain(|field, _| !self.exclude.contains(field));
        }
        record
    }

    /// Rename through the alias table; every alias destination is present
    /// afterwards, null when its source was missing.
    pub fn apply_aliases(&self, record: Record) -> Result<Record, TransformFailure> {
        let mut out = Record::new();
        for (field, value) in record {
            let destination = self.aliases.get(&field).cloned().unwrap_or(field);
            if out.contains_key(&destination) {
                return Err(TransformFailure::AliasCollision { field: destination });
            }
            out.insert(destination, value);
        }
        for destination in self.aliases.values() {
            out.entry(destination.clone()).or_insert(Value::Null);
        }
        Ok(out)
    }

    pub fn derive_fields(&self, record: &mut Record) {
        for derived in &self.derive {
            let Some(source) = record.get(&derived.from) else {
                continue;
            };
            let derived_value = match source.render() {
                Some(text) => {
                    let prefix: String = text.chars().take(derived.length).collect();
                    record.insert(derived.from.clone(), Value::Str(text));
                    Value::Str(prefix)
                }
                None => Value::Null,
            };
            record.insert(derived.to.clone(), derived_value);
        }
    }

    pub fn transform(&self, raw: Record) -> Result<TransformedRecord, TransformationError> {
        self.transform_with(raw, true)
    }

    /// Full pipeline; `parse_dtypes = false` skips coercion for inspection runs.
    pub fn transform_with(
        &self,
        raw: Record,
        parse_dtypes: bool,
    ) -> Result<TransformedRecord, TransformationError> {
        let fail = |cause: TransformFailure, parse_errors: Vec<ParseError>| {
            warn!(
                reason = cause.reason(),
                parse_errors = parse_errors.len(),
                errors = ?parse_errors,
                "transformation error: {cause}"
            );
            TransformationError {
                cause,
                parse_errors,
            }
        };

        let record = self.drop_exclusions(raw);
        let record = self
            .apply_aliases(record)
            .map_err(|cause| fail(cause, Vec::new()))?;
        let Normalized { mut record, errors } = self
            .normalizer
            .parse(record, parse_dtypes)
            .map_err(|cause| fail(cause, Vec::new()))?;

        if let Some(limit) = self.max_parse_errors {
            if errors.len() > limit {
                let count = errors.len();
                return Err(fail(TransformFailure::TooManyParseErrors { count, limit }, errors));
            }
        }

        self.derive_fields(&mut record);

        if !errors.is_empty() {
            warn!(count = errors.len(), ?errors, "captured parsing errors during transformation");
        }

        Ok(TransformedRecord {
            fields: record,
            parse_errors: errors,
        })
    }
}

impl fmt::Display for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transformer: {} aliases, {} exclusions, {} rules",
            self.aliases.len(),
            self.exclude.len(),
            self.normalizer.ruleset().rule_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frac_core::record;

    fn ruleset(yaml: &str) -> Arc<Ruleset> {
        Arc::new(Ruleset::from_yaml_str(yaml).expect("ruleset"))
    }

    fn transformer(yaml: &str, spec: TransformSpec) -> Transformer {
        Transformer::new(spec, ruleset(yaml)).expect("transformer")
    }

    fn aliases(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn alias_then_int_rule() {
        let t = transformer(
            "registry:\n  - mass: int\n",
            TransformSpec {
                aliases: aliases(&[("raw_mass", "mass")]),
                ..Default::default()
            },
        );
        let out = t
            .transform(record([("raw_mass", "12.0"), ("other", "x")]))
            .expect("transform");
        assert_eq!(out.fields, record([("mass", Value::Int(12)), ("other", Value::from("x"))]));
        assert!(out.parse_errors.is_empty());
    }

    #[test]
    fn missing_alias_source_becomes_null() {
        let t = transformer(
            "{}",
            TransformSpec {
                aliases: aliases(&[("id14", "identifier")]),
                ..Default::default()
            },
        );
        let out = t.transform(record([("operator", "Acme")])).expect("transform");
        assert_eq!(out.fields.get("identifier"), Some(&Value::Null));
        assert_eq!(out.fields.get("operator"), Some(&Value::from("Acme")));
    }

    #[test]
    fn failed_field_is_collected_not_fatal() {
        let t = transformer("registry:\n  - mass: int\n", TransformSpec::default());
        let out = t
            .transform(record([("mass", "abc"), ("operator", "Acme")]))
            .expect("transform");
        assert_eq!(out.fields.get("mass"), Some(&Value::Null));
        assert_eq!(out.fields.get("operator"), Some(&Value::from("Acme")));
        assert_eq!(out.parse_errors.len(), 1);
        assert_eq!(out.parse_errors[0].field, "mass");
        assert_eq!(out.parse_errors[0].target, TargetType::Int);
        assert_eq!(out.parse_errors[0].raw, "abc");
    }

    #[test]
    fn parse_error_limit_fails_whole_record() {
        let t = transformer(
            "registry:\n  - pattern: 'tvd|mass'\n    type: int\n",
            TransformSpec {
                max_parse_errors: Some(1),
                ..Default::default()
            },
        );
        let err = t
            .transform(record([("mass", "abc"), ("tvd", "deep")]))
            .unwrap_err();
        assert_eq!(err.reason(), "too_many_parse_errors");
        assert_eq!(err.parse_errors.len(), 2);
    }

    #[test]
    fn exclusions_run_before_aliases() {
        let t = transformer(
            "{}",
            TransformSpec {
                aliases: aliases(&[("UpdatedAt", "updated_at")]),
                exclude: vec!["UpdatedAt".into(), "inserted_at".into()],
                ..Default::default()
            },
        );
        let out = t
            .transform(record([("UpdatedAt", "x"), ("inserted_at", "y"), ("keep", "z")]))
            .expect("transform");
        assert_eq!(
            out.fields,
            record([("keep", Value::from("z")), ("updated_at", Value::Null)])
        );
    }

    #[test]
    fn alias_collision_is_a_transformation_error() {
        let t = transformer(
            "{}",
            TransformSpec {
                aliases: aliases(&[("APINumber", "api14")]),
                ..Default::default()
            },
        );
        let err = t
            .transform(record([("APINumber", "42127380120000"), ("api14", "dup")]))
            .unwrap_err();
        assert_eq!(
            err.cause,
            TransformFailure::AliasCollision { field: "api14".into() }
        );
    }

    #[test]
    fn duplicate_alias_destinations_are_rejected_at_startup() {
        let err = Transformer::new(
            TransformSpec {
                aliases: aliases(&[("a", "x"), ("b", "x")]),
                ..Default::default()
            },
            Arc::new(Ruleset::default()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn derived_identifier_is_stringified_prefix() {
        let t = transformer(
            "registry:\n  - api14: int\n",
            TransformSpec {
                derive: vec![DerivedField { from: "api14".into(), to: "api10".into(), length: 10 }],
                ..Default::default()
            },
        );
        let out = t.transform(record([("api14", "42127380120000")])).expect("transform");
        assert_eq!(out.fields.get("api14"), Some(&Value::from("42127380120000")));
        assert_eq!(out.fields.get("api10"), Some(&Value::from("4212738012")));

        let absent = t.transform(record([("operator", "Acme")])).expect("transform");
        assert!(!absent.fields.contains_key("api10"));

        let empty = t.transform(record([("api14", "")])).expect("transform");
        assert_eq!(empty.fields.get("api10"), Some(&Value::Null));
    }

    #[test]
    fn later_rules_override_general_ones() {
        let rules = ruleset(
            "parsers:\n  dates:\n    rules:\n      - pattern: '.*_date'\n        type: date\n  overrides:\n    - job_end_date: string\n",
        );
        assert_eq!(rules.rule_count(), 2);
        let normalizer = RowNormalizer::new(rules, false);
        let out = normalizer.parse_value_dtypes(record([
            ("job_start_date", "3/16/2011 12:00:00 AM"),
            ("job_end_date", "2011-03-20"),
        ]));
        assert!(out.errors.is_empty());
        assert_eq!(
            out.record.get("job_start_date"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2011, 3, 16).unwrap()))
        );
        assert_eq!(out.record.get("job_end_date"), Some(&Value::from("2011-03-20")));
    }

    #[test]
    fn override_applies_where_general_rule_would_fail() {
        let rules = ruleset(
            "parsers:\n  dates:\n    - '.*_date': date\n  overrides:\n    - job_end_date: string\n",
        );
        let normalizer = RowNormalizer::new(rules, false);
        let out = normalizer.parse_value_dtypes(record([
            ("job_start_date", "TBD"),
            ("job_end_date", "TBD"),
        ]));
        assert_eq!(out.record.get("job_end_date"), Some(&Value::from("TBD")));
        assert_eq!(out.record.get("job_start_date"), Some(&Value::Null));
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].field, "job_start_date");

        let out = normalizer.parse_value_dtypes(record([("job_end_date", "03/20/2011")]));
        assert!(out.errors.is_empty());
        assert_eq!(out.record.get("job_end_date"), Some(&Value::from("03/20/2011")));
    }

    #[test]
    fn parse_without_dtypes_returns_record_unchanged() {
        let normalizer = RowNormalizer::new(ruleset("r:\n  - mass: int\n"), true);
        let raw = record([(" Mass ", "12")]);
        let out = normalizer.parse(raw.clone(), false).expect("parse");
        assert_eq!(out.record, raw);

        let keyed = normalizer.parse(raw, true).expect("parse");
        assert_eq!(keyed.record, record([("mass", Value::Int(12))]));
    }

    #[test]
    fn key_normalization_detects_collisions() {
        let normalizer = RowNormalizer::new(Arc::new(Ruleset::default()), true);
        let err = normalizer
            .parse(record([("Mass", "1"), ("mass ", "2")]), true)
            .unwrap_err();
        assert_eq!(err, TransformFailure::KeyCollision { key: "mass".into() });
    }

    #[test]
    fn scalar_coercions() {
        let rule = |t| CoercionRule::new("test", "x", t).unwrap();
        let p = |v: &str, t| parse(&Value::from(v), &rule(t));

        assert_eq!(p("7", TargetType::Int).unwrap(), Value::Int(7));
        assert_eq!(p("12.9", TargetType::Int).unwrap(), Value::Int(12));
        assert_eq!(p("0.00094", TargetType::Float).unwrap(), Value::Float(0.00094));
        assert_eq!(p("Yes", TargetType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(p("f", TargetType::Bool).unwrap(), Value::Bool(false));
        assert_eq!(p("  ", TargetType::Int).unwrap(), Value::Null);
        assert_eq!(
            p("2019-12-30 09:22:10", TargetType::DateTime).unwrap(),
            Value::DateTime(
                NaiveDate::from_ymd_opt(2019, 12, 30)
                    .unwrap()
                    .and_hms_opt(9, 22, 10)
                    .unwrap()
                    .and_utc()
            )
        );
        assert!(p("maybe", TargetType::Bool).is_err());
        assert!(p("NaN", TargetType::Float).is_err());
        assert!(p("1e300", TargetType::Int).is_err());
        assert_eq!(
            parse(&Value::Int(42), &rule(TargetType::String)).unwrap(),
            Value::from("42")
        );
    }

    #[test]
    fn malformed_rulesets_are_config_errors() {
        assert!(matches!(
            Ruleset::from_yaml_str("r:\n  - pattern: '('\n    type: int\n"),
            Err(ConfigError::Pattern { .. })
        ));
        assert!(matches!(
            Ruleset::from_yaml_str("r:\n  - mass: kilograms\n"),
            Err(ConfigError::Yaml { .. })
        ));
        assert!(matches!(
            Ruleset::from_yaml_str("r:\n  - {mass: int, tvd: int}\n"),
            Err(ConfigError::Rule { .. })
        ));
        assert!(matches!(
            Ruleset::from_yaml_str("- mass: int\n"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
