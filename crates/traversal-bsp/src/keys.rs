//! Compute-key registry
//!
//! A program declares up front which vertex properties and which memory
//! slots take part in a run, and how concurrent contributions to a memory
//! slot are merged. The declarations are fixed for the whole run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::BspError;
use crate::pipeline::Pipeline;
use crate::value::{ComputeValue, Value};

/// Vertex key and memory key holding halted traversers
pub const HALTED_TRAVERSERS: &str = "bsp.haltedTraversers";

/// Memory key holding the active-traverser working set
pub const ACTIVE_TRAVERSERS: &str = "bsp.activeTraversers";

/// Binary merge operators for memory keys and side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Sum,
    Min,
    Max,
    And,
    Or,
    /// Union of traverser sets or bulk sets
    AddAll,
    /// Right operand wins; not commutative
    Assign,
}

impl Operator {
    pub fn is_associative(&self) -> bool {
        true
    }

    pub fn is_commutative(&self) -> bool {
        !matches!(self, Operator::Assign)
    }

    /// Fold `right` into `left`; `key` only labels errors
    pub fn apply(
        &self,
        key: &str,
        left: ComputeValue,
        right: ComputeValue,
    ) -> Result<ComputeValue, BspError> {
        use ComputeValue as C;

        let mismatch = |l: &C, r: &C| {
            BspError::merge_violation(
                key,
                format!("{self} cannot merge {} with {}", l.type_name(), r.type_name()),
            )
        };

        match self {
            Operator::Assign => Ok(right),
            Operator::Sum => match (&left, &right) {
                (C::Value(Value::Int(a)), C::Value(Value::Int(b))) => a
                    .checked_add(*b)
                    .map(|n| C::Value(Value::Int(n)))
                    .ok_or_else(|| BspError::merge_violation(key, "integer overflow in sum")),
                _ => Err(mismatch(&left, &right)),
            },
            Operator::Min | Operator::Max => match (left, right) {
                (C::Value(a), C::Value(b)) => {
                    let pick_left = if *self == Operator::Min { a <= b } else { a >= b };
                    Ok(C::Value(if pick_left { a } else { b }))
                }
                (l, r) => Err(mismatch(&l, &r)),
            },
            Operator::And | Operator::Or => match (&left, &right) {
                (C::Value(Value::Bool(a)), C::Value(Value::Bool(b))) => {
                    let merged = if *self == Operator::And { *a && *b } else { *a || *b };
                    Ok(C::Value(Value::Bool(merged)))
                }
                _ => Err(mismatch(&left, &right)),
            },
            Operator::AddAll => match (left, right) {
                (C::Traversers(mut a), C::Traversers(b)) => {
                    a.add_all(b)?;
                    Ok(C::Traversers(a))
                }
                (C::BulkSet(mut a), C::BulkSet(b)) => {
                    a.add_all(b);
                    Ok(C::BulkSet(a))
                }
                (l, r) => Err(mismatch(&l, &r)),
            },
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Sum => "sum",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::AddAll => "addAll",
            Operator::Assign => "assign",
        };
        f.write_str(name)
    }
}

/// A declared global memory slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryComputeKey {
    name: String,
    operator: Operator,
    broadcast: bool,
    transient: bool,
}

impl MemoryComputeKey {
    /// Declare a memory key; the operator must be order independent
    pub fn new(
        name: impl Into<String>,
        operator: Operator,
        broadcast: bool,
        transient: bool,
    ) -> Result<Self, BspError> {
        let name = name.into();
        if !operator.is_associative() || !operator.is_commutative() {
            return Err(BspError::merge_violation(
                name,
                format!("operator {operator} is not associative and commutative"),
            ));
        }
        Ok(Self {
            name,
            operator,
            broadcast,
            transient,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Visible to workers during `execute`
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Reset every superstep instead of persisting
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// A declared per-vertex property slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexComputeKey {
    name: String,
    transient: bool,
}

impl VertexComputeKey {
    pub fn new(name: impl Into<String>, transient: bool) -> Self {
        Self {
            name: name.into(),
            transient,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stripped from the result graph when the run ends
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// The immutable set of keys a run requires
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeKeys {
    vertex: BTreeMap<String, VertexComputeKey>,
    memory: BTreeMap<String, MemoryComputeKey>,
}

impl ComputeKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys for running `pipeline` distributed
    ///
    /// One memory key per declared side effect, plus the reserved halted
    /// (vertex and memory scoped) and active-traverser keys.
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<Self, BspError> {
        if pipeline.is_empty() {
            return Err(BspError::config(format!(
                "pipeline '{}' has no steps",
                pipeline.reference()
            )));
        }
        let mut keys = ComputeKeys::new();
        for decl in pipeline.side_effects() {
            if decl.key.starts_with("bsp.") {
                return Err(BspError::config(format!(
                    "side effect '{}' uses the reserved bsp. prefix",
                    decl.key
                )));
            }
            let key = MemoryComputeKey::new(&decl.key, decl.operator, true, false)?;
            keys = keys.with_memory_key(key)?;
        }
        let halted = MemoryComputeKey::new(HALTED_TRAVERSERS, Operator::AddAll, false, false)?;
        let active = MemoryComputeKey::new(ACTIVE_TRAVERSERS, Operator::AddAll, true, true)?;
        keys.with_vertex_key(VertexComputeKey::new(HALTED_TRAVERSERS, false))?
            .with_memory_key(halted)?
            .with_memory_key(active)
    }

    /// Add a vertex key; redeclaring with different semantics fails
    pub fn with_vertex_key(mut self, key: VertexComputeKey) -> Result<Self, BspError> {
        match self.vertex.get(key.name()) {
            Some(existing) if existing != &key => Err(BspError::config(format!(
                "vertex key '{}' declared twice with different semantics",
                key.name()
            ))),
            _ => {
                self.vertex.insert(key.name.clone(), key);
                Ok(self)
            }
        }
    }

    /// Add a memory key; redeclaring with different semantics fails
    pub fn with_memory_key(mut self, key: MemoryComputeKey) -> Result<Self, BspError> {
        match self.memory.get(key.name()) {
            Some(existing) if existing != &key => Err(BspError::config(format!(
                "memory key '{}' declared twice with different semantics",
                key.name()
            ))),
            _ => {
                self.memory.insert(key.name.clone(), key);
                Ok(self)
            }
        }
    }

    pub fn memory_key(&self, name: &str) -> Result<&MemoryComputeKey, BspError> {
        self.memory.get(name).ok_or_else(|| BspError::unknown_key(name))
    }

    pub fn vertex_key(&self, name: &str) -> Result<&VertexComputeKey, BspError> {
        self.vertex.get(name).ok_or_else(|| BspError::unknown_key(name))
    }

    pub fn memory_keys(&self) -> impl Iterator<Item = &MemoryComputeKey> {
        self.memory.values()
    }

    pub fn vertex_keys(&self) -> impl Iterator<Item = &VertexComputeKey> {
        self.vertex.values()
    }
}
