//! Values carried by traversers, vertex properties and memory slots

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::traverser::TraverserSet;

/// Identity of a graph vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub u64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v[{}]", self.0)
    }
}

impl From<u64> for VertexId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A dynamically typed, totally ordered value
///
/// Ordering and hashing make values usable as traverser identity and as
/// bulk set members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Vertex(VertexId),
    List(Vec<Value>),
    Map(#[serde(with = "entries")] BTreeMap<Value, Value>),
}

impl Value {
    pub fn as_vertex(&self) -> Option<VertexId> {
        match self {
            Value::Vertex(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Name of the variant, used in merge diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Vertex(_) => "vertex",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Vertex(id) => write!(f, "{id}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<VertexId> for Value {
    fn from(id: VertexId) -> Self {
        Value::Vertex(id)
    }
}

/// A multiset of values with per-value counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BulkSet {
    #[serde(with = "entries")]
    counts: BTreeMap<Value, u64>,
}

impl BulkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bulk` occurrences of `value`; a zero bulk is ignored
    pub fn add(&mut self, value: impl Into<Value>, bulk: u64) {
        if bulk == 0 {
            return;
        }
        *self.counts.entry(value.into()).or_insert(0) += bulk;
    }

    pub fn add_all(&mut self, other: BulkSet) {
        for (value, bulk) in other.counts {
            self.add(value, bulk);
        }
    }

    /// Occurrences of `value`
    pub fn get(&self, value: &Value) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    /// Total number of occurrences across all values
    pub fn size(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Number of distinct values
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, u64)> {
        self.counts.iter().map(|(v, n)| (v, *n))
    }
}

impl<V: Into<Value>> FromIterator<(V, u64)> for BulkSet {
    fn from_iter<I: IntoIterator<Item = (V, u64)>>(iter: I) -> Self {
        let mut set = BulkSet::new();
        for (value, bulk) in iter {
            set.add(value, bulk);
        }
        set
    }
}

/// What a memory slot, side effect or compute-key vertex property holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeValue {
    Value(Value),
    Traversers(TraverserSet),
    BulkSet(BulkSet),
}

impl ComputeValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ComputeValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_traversers(&self) -> Option<&TraverserSet> {
        match self {
            ComputeValue::Traversers(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_traversers(self) -> Option<TraverserSet> {
        match self {
            ComputeValue::Traversers(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bulk_set(&self) -> Option<&BulkSet> {
        match self {
            ComputeValue::BulkSet(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ComputeValue::Value(v) => v.type_name(),
            ComputeValue::Traversers(_) => "traversers",
            ComputeValue::BulkSet(_) => "bulk_set",
        }
    }
}

macro_rules! compute_value_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ComputeValue {
            fn from(value: $ty) -> Self {
                ComputeValue::Value(value.into())
            }
        })*
    };
}

compute_value_from!(Value, &str, String, i64, bool, VertexId);

impl From<TraverserSet> for ComputeValue {
    fn from(set: TraverserSet) -> Self {
        ComputeValue::Traversers(set)
    }
}

impl From<BulkSet> for ComputeValue {
    fn from(set: BulkSet) -> Self {
        ComputeValue::BulkSet(set)
    }
}

/// Serializes ordered maps as entry lists so non-string keys survive JSON
mod entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}
