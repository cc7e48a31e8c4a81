//! Proxy descriptors and the identity used to cache results for them

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Egress geolocation attached to a node
pub const GEO_KEY: &str = "_geo";
/// Geolocation of the node's server address
pub const ENTRANCE_KEY: &str = "_entrance";
/// Set on nodes the kernel cannot run
pub const INCOMPATIBLE_KEY: &str = "_incompatible";
/// Set on nodes that failed the liveness test
pub const REMOVE_KEY: &str = "_remove";
/// Best measured delay in milliseconds
pub const LATENCY_KEY: &str = "_latency";

/// Every key the pipeline may attach to a descriptor
pub const ANNOTATION_KEYS: [&str; 5] = [GEO_KEY, ENTRANCE_KEY, INCOMPATIBLE_KEY, REMOVE_KEY, LATENCY_KEY];

/// One proxy node as supplied by the caller.
///
/// The descriptor is an open mapping; only `name`, `type`, `server` and `port`
/// have meaning to this crate, everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyDescriptor(Map<String, Value>);

impl ProxyDescriptor {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn name(&self) -> &str {
        self.0.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn set_name(&mut self, name: String) {
        self.0.insert("name".to_string(), Value::String(name));
    }

    pub fn server(&self) -> Option<&str> {
        self.0.get("server").and_then(Value::as_str)
    }

    /// Set a boolean flag annotation.
    pub fn mark(&mut self, key: &str) {
        self.insert(key, Value::Bool(true));
    }

    pub fn is_marked(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Remove every annotation key not listed in `keep`.
    pub fn strip_annotations(&mut self, keep: &[&str]) {
        for key in ANNOTATION_KEYS {
            if !keep.contains(&key) {
                self.0.remove(key);
            }
        }
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server() {
            Some(server) => write!(f, "{} ({})", self.name(), server),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// How two descriptors are recognised as the same node for caching.
#[derive(Clone)]
pub enum IdentityKey {
    /// The listed fields, in order
    Fields(Vec<String>),
    /// Every field whose name matches
    Pattern(Regex),
    Custom(Arc<dyn Fn(&ProxyDescriptor) -> String + Send + Sync>),
}

impl IdentityKey {
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }

    /// Render the identity of `descriptor` as a JSON object of the selected
    /// fields. Absent fields are omitted.
    pub fn extract(&self, descriptor: &ProxyDescriptor) -> String {
        let selected: BTreeMap<&str, &Value> = match self {
            Self::Fields(fields) => fields
                .iter()
                .filter_map(|f| descriptor.get(f).map(|v| (f.as_str(), v)))
                .collect(),
            Self::Pattern(pattern) => descriptor
                .fields()
                .iter()
                .filter(|(k, _)| !ANNOTATION_KEYS.contains(&k.as_str()) && pattern.is_match(k))
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
            Self::Custom(f) => return f(descriptor),
        };
        serde_json::to_string(&selected).unwrap_or_default()
    }
}

impl Default for IdentityKey {
    fn default() -> Self {
        Self::fields(["server"])
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            Self::Pattern(pattern) => f.debug_tuple("Pattern").field(&pattern.as_str()).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Keep the first descriptor for every combination of `fields`.
///
/// Descriptors carrying none of the fields cannot be compared and are all kept.
pub fn dedupe(descriptors: Vec<ProxyDescriptor>, fields: &[String]) -> Vec<ProxyDescriptor> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .filter(|d| {
            if fields.iter().all(|f| d.get(f).is_none()) {
                return true;
            }
            let key = fields
                .iter()
                .map(|f| match d.get(f) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                })
                .collect::<Vec<_>>()
                .join("-");
            seen.insert(key)
        })
        .collect()
}
