use crate::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single value inside a [`Payload`].
///
/// Serialized untagged, so a payload reads and writes as plain JSON or TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    /// Explicit absence of a value.
    Null,
    /// A boolean flag.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A floating point number.
    Float(f64),
    /// A UTF-8 string.
    Text(String),
    /// An ordered list of values.
    List(Vec<PayloadValue>),
    /// A nested payload.
    Map(BTreeMap<String, PayloadValue>),
}

/// The kind of a [`PayloadValue`], used by [`PayloadSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Null,
    Bool,
    Integer,
    /// Any number; integers are accepted where a float is declared.
    Float,
    Text,
    List,
    Map,
    /// Any value, including null.
    Any,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::Null => write!(f, "null"),
            PayloadKind::Bool => write!(f, "bool"),
            PayloadKind::Integer => write!(f, "integer"),
            PayloadKind::Float => write!(f, "float"),
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::List => write!(f, "list"),
            PayloadKind::Map => write!(f, "map"),
            PayloadKind::Any => write!(f, "any"),
        }
    }
}

impl PayloadValue {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadValue::Null => PayloadKind::Null,
            PayloadValue::Bool(_) => PayloadKind::Bool,
            PayloadValue::Integer(_) => PayloadKind::Integer,
            PayloadValue::Float(_) => PayloadKind::Float,
            PayloadValue::Text(_) => PayloadKind::Text,
            PayloadValue::List(_) => PayloadKind::List,
            PayloadValue::Map(_) => PayloadKind::Map,
        }
    }

    /// Whether this value satisfies the declared `kind`.
    pub fn conforms_to(&self, kind: PayloadKind) -> bool {
        match (kind, self) {
            (PayloadKind::Any, _) => true,
            (PayloadKind::Float, PayloadValue::Integer(_)) => true,
            (kind, value) => value.kind() == kind,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Float(n) => Some(*n),
            PayloadValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Integer(value)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Integer(i64::from(value))
    }
}

impl From<u32> for PayloadValue {
    fn from(value: u32) -> Self {
        PayloadValue::Integer(i64::from(value))
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Float(value)
    }
}

impl<T: Into<PayloadValue>> From<Vec<T>> for PayloadValue {
    fn from(values: Vec<T>) -> Self {
        PayloadValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<Payload> for PayloadValue {
    fn from(payload: Payload) -> Self {
        PayloadValue::Map(payload.0)
    }
}

/// Ordered key/value bag carried as task context, step parameters and step results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, returning the previous one for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PayloadValue>,
    ) -> Option<PayloadValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PayloadValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(PayloadValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(PayloadValue::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(PayloadValue::as_bool)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// Copy every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &Payload) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Check this payload against `schema`.
    ///
    /// All problems are collected into a single validation error.
    pub fn validate(&self, schema: &PayloadSchema) -> ConductorResult<()> {
        let mut problems = Vec::new();

        for (key, field) in &schema.fields {
            match self.0.get(key) {
                None if field.required => problems.push(format!("missing required key '{key}'")),
                None => {}
                Some(value) if !value.conforms_to(field.kind) => problems.push(format!(
                    "key '{key}' expected {}, found {}",
                    field.kind,
                    value.kind()
                )),
                Some(_) => {}
            }
        }

        if schema.deny_unknown {
            for key in self.0.keys() {
                if !schema.fields.contains_key(key) {
                    problems.push(format!("unknown key '{key}'"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConductorError::Validation(problems.join("; ")))
        }
    }
}

impl FromIterator<(String, PayloadValue)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, PayloadValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldSpec {
    kind: PayloadKind,
    required: bool,
}

/// Declares which keys a [`Payload`] carries and what kind each value has.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadSchema {
    fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    deny_unknown: bool,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, key: impl Into<String>, kind: PayloadKind) -> Self {
        self.fields.insert(key.into(), FieldSpec { kind, required: true });
        self
    }

    pub fn optional(mut self, key: impl Into<String>, kind: PayloadKind) -> Self {
        self.fields.insert(
            key.into(),
            FieldSpec {
                kind,
                required: false,
            },
        );
        self
    }

    /// Reject keys the schema does not declare.
    pub fn deny_unknown(mut self) -> Self {
        self.deny_unknown = true;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let payload = Payload::new()
            .with("region", "emea")
            .with("quarter", 3)
            .with("threshold", 0.25)
            .with("dry_run", true);

        assert_eq!(payload.get_str("region"), Some("emea"));
        assert_eq!(payload.get_i64("quarter"), Some(3));
        assert_eq!(payload.get_f64("quarter"), Some(3.0));
        assert_eq!(payload.get_f64("threshold"), Some(0.25));
        assert_eq!(payload.get_bool("dry_run"), Some(true));
        assert_eq!(payload.get_str("quarter"), None);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn test_untagged_json_shape() {
        let payload = Payload::new()
            .with("name", "report")
            .with("tags", vec!["a", "b"]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["name"], "report");
        assert_eq!(json["tags"][1], "b");

        let parsed: Payload =
            serde_json::from_str(r#"{"count": 2, "ratio": 0.5, "missing": null}"#).unwrap();
        assert_eq!(parsed.get("count"), Some(&PayloadValue::Integer(2)));
        assert_eq!(parsed.get("ratio"), Some(&PayloadValue::Float(0.5)));
        assert_eq!(parsed.get("missing"), Some(&PayloadValue::Null));
    }

    #[test]
    fn test_schema_accepts_conforming_payload() {
        let schema = PayloadSchema::new()
            .required("region", PayloadKind::Text)
            .optional("budget", PayloadKind::Float);
        let payload = Payload::new().with("region", "apac").with("budget", 1200);
        assert!(payload.validate(&schema).is_ok());
    }

    #[test]
    fn test_schema_collects_all_problems() {
        let schema = PayloadSchema::new()
            .required("region", PayloadKind::Text)
            .required("budget", PayloadKind::Float)
            .deny_unknown();
        let payload = Payload::new().with("budget", "lots").with("extra", 1);

        let err = payload.validate(&schema).unwrap_err().to_string();
        assert!(err.contains("missing required key 'region'"));
        assert!(err.contains("key 'budget' expected float, found text"));
        assert!(err.contains("unknown key 'extra'"));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = Payload::new().with("a", 1).with("b", 2);
        base.merge(&Payload::new().with("b", 20).with("c", 30));
        assert_eq!(base.get_i64("b"), Some(20));
        assert_eq!(base.get_i64("c"), Some(30));
        assert_eq!(base.len(), 3);
    }
}
