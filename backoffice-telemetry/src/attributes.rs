//! Tagged attribute values shared by spans, log events and error context.
//!
//! Every attribute map in the crate is a `BTreeMap<String, AttributeValue>`,
//! so sanitization and JSON serialization are total over any value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder written in place of sensitive values.
pub const REDACTED: &str = "[REDACTED]";

/// Default key substrings that mark an attribute as sensitive.
pub const DEFAULT_SANITIZE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "auth",
    "credit_card",
    "ssn",
];

/// Ordered attribute map.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::String(v) => f.write_str(v),
            other => match serde_json::to_string(other) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<&String> for AttributeValue {
    fn from(v: &String) -> Self {
        AttributeValue::String(v.clone())
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<u16> for AttributeValue {
    fn from(v: u16) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(v: usize) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        AttributeValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeValue {
    fn from(v: BTreeMap<String, AttributeValue>) -> Self {
        AttributeValue::Map(v)
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => AttributeValue::String(String::new()),
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => AttributeValue::String(s),
            serde_json::Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => AttributeValue::Map(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// Builds an [`Attributes`] map from `key => value` pairs.
#[macro_export]
macro_rules! attrs {
    () => { $crate::attributes::Attributes::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::attributes::Attributes::new();
        $( map.insert(($key).to_string(), $crate::attributes::AttributeValue::from($value)); )+
        map
    }};
}

/// Redacts attributes whose key contains a configured substring.
///
/// Matching is case-insensitive and applies at every nesting depth, including
/// maps nested inside lists.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<String>,
    enabled: bool,
}

impl Sanitizer {
    pub fn new<I, S>(patterns: I, enabled: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self {
            patterns: Vec::new(),
            enabled: false,
        }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let key = key.to_lowercase();
        self.patterns.iter().any(|p| key.contains(p.as_str()))
    }

    /// Returns the value to store under `key`.
    pub fn sanitize(&self, key: &str, value: AttributeValue) -> AttributeValue {
        if !self.enabled {
            return value;
        }
        if self.is_sensitive(key) {
            return AttributeValue::String(REDACTED.to_string());
        }
        self.sanitize_nested(value)
    }

    pub fn sanitize_map(&self, attributes: Attributes) -> Attributes {
        attributes
            .into_iter()
            .map(|(k, v)| {
                let v = self.sanitize(&k, v);
                (k, v)
            })
            .collect()
    }

    fn sanitize_nested(&self, value: AttributeValue) -> AttributeValue {
        match value {
            AttributeValue::Map(map) => AttributeValue::Map(self.sanitize_map(map)),
            AttributeValue::List(items) => AttributeValue::List(
                items.into_iter().map(|v| self.sanitize_nested(v)).collect(),
            ),
            scalar => scalar,
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_SANITIZE_PATTERNS.iter().copied(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_top_level_redaction() {
        let sanitizer = Sanitizer::default();
        let attrs = sanitizer.sanitize_map(attrs! {
            "user.name" => "alice",
            "Auth-Header" => "Bearer abc",
            "db.password" => "hunter2",
            "retries" => 3i64,
        });

        assert_eq!(attrs["user.name"], AttributeValue::from("alice"));
        assert_eq!(attrs["Auth-Header"], AttributeValue::from(REDACTED));
        assert_eq!(attrs["db.password"], AttributeValue::from(REDACTED));
        assert_eq!(attrs["retries"], AttributeValue::Int(3));
    }

    #[test]
    fn test_nested_and_list_redaction() {
        let sanitizer = Sanitizer::default();
        let value: AttributeValue = serde_json::json!({
            "profile": {
                "name": "bob",
                "credentials": {"api_token": "t-1", "hint": "blue"}
            },
            "cards": [{"credit_card": "4111", "brand": "visa"}]
        })
        .into();

        let clean = sanitizer.sanitize("request", value);
        let json = serde_json::to_value(&clean).unwrap();

        assert_eq!(json["profile"]["name"], "bob");
        assert_eq!(json["profile"]["credentials"]["api_token"], REDACTED);
        assert_eq!(json["profile"]["credentials"]["hint"], "blue");
        assert_eq!(json["cards"][0]["credit_card"], REDACTED);
        assert_eq!(json["cards"][0]["brand"], "visa");
    }

    #[test]
    fn test_disabled_sanitizer_keeps_values() {
        let sanitizer = Sanitizer::new(["password"], false);
        let value = sanitizer.sanitize("password", "plain".into());
        assert_eq!(value, AttributeValue::from("plain"));
    }

    #[test]
    fn test_untagged_serialization() {
        let attrs = attrs! {"a" => 1i64, "b" => true, "c" => "x", "d" => vec![1i64, 2]};
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"a":1,"b":true,"c":"x","d":[1,2]}"#);
    }

    fn nest(depth: usize, key: &str) -> AttributeValue {
        let mut value = AttributeValue::from("sensitive");
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value);
        value = AttributeValue::Map(map);
        for level in 0..depth {
            let mut outer = BTreeMap::new();
            outer.insert(format!("level{level}"), value);
            value = AttributeValue::Map(outer);
        }
        value
    }

    fn find_leaf(value: &AttributeValue) -> &AttributeValue {
        match value {
            AttributeValue::Map(m) => find_leaf(m.values().next().unwrap()),
            leaf => leaf,
        }
    }

    proptest! {
        #[test]
        fn prop_redaction_at_any_depth(
            depth in 0usize..8,
            pattern_idx in 0usize..DEFAULT_SANITIZE_PATTERNS.len(),
            prefix in "[a-z]{0,4}",
            upper in any::<bool>(),
        ) {
            let pattern = DEFAULT_SANITIZE_PATTERNS[pattern_idx];
            let key = if upper {
                format!("{prefix}{}", pattern.to_uppercase())
            } else {
                format!("{prefix}{pattern}")
            };
            let sanitizer = Sanitizer::default();
            let clean = sanitizer.sanitize("root", nest(depth, &key));
            prop_assert_eq!(find_leaf(&clean), &AttributeValue::from(REDACTED));
        }
    }
}
