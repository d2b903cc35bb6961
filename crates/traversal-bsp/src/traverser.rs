//! Traversers: bulk-counted units of in-flight work
//!
//! A traverser pairs a value with the pipeline position it will resume at.
//! While a computation is distributed, traversers roam from vertex to vertex;
//! once halted they wait in vertex-local storage for the sequential phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::BspError;
use crate::pipeline::StepId;
use crate::side_effects::SideEffectsId;
use crate::value::Value;

/// One element of a traverser's history
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathEntry {
    pub labels: Vec<String>,
    pub value: Value,
}

/// The sequence of values a traverser has visited
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    entries: Vec<PathEntry>,
}

impl Path {
    pub fn extend(&mut self, labels: Vec<String>, value: Value) {
        self.entries.push(PathEntry { labels, value });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PathEntry] {
        &self.entries
    }

    /// Most recent value stored under `label`
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.labels.iter().any(|l| l == label))
            .map(|e| &e.value)
    }
}

/// A bulk-counted token carrying a value and a pipeline position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traverser {
    value: Value,
    bulk: u64,
    step_id: StepId,
    side_effects: SideEffectsId,
    path: Option<Path>,
}

/// Identity used to merge traversers; everything but bulk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TraverserKey {
    value: Value,
    step_id: StepId,
    side_effects: SideEffectsId,
    path: Option<Path>,
}

impl Traverser {
    /// Create a traverser with bulk 1
    pub fn new(value: impl Into<Value>, step_id: StepId, side_effects: SideEffectsId) -> Self {
        Self {
            value: value.into(),
            bulk: 1,
            step_id,
            side_effects,
            path: None,
        }
    }

    pub fn with_bulk(mut self, bulk: u64) -> Result<Self, BspError> {
        if bulk == 0 {
            return Err(BspError::InvalidBulk(bulk));
        }
        self.bulk = bulk;
        Ok(self)
    }

    /// Start recording the values this traverser visits
    pub fn with_path(mut self) -> Self {
        let mut path = Path::default();
        path.extend(Vec::new(), self.value.clone());
        self.path = Some(path);
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn bulk(&self) -> u64 {
        self.bulk
    }

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    pub fn side_effects(&self) -> SideEffectsId {
        self.side_effects
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    /// True once the traverser has left the distributed phase
    pub fn is_halted(&self) -> bool {
        self.step_id.is_resumable()
    }

    /// Clone onto `value` at `step_id`, inheriting bulk and side effects
    pub fn split(&self, value: impl Into<Value>, step_id: StepId) -> Traverser {
        let value = value.into();
        let path = self.path.clone().map(|mut p| {
            p.extend(Vec::new(), value.clone());
            p
        });
        Traverser {
            value,
            bulk: self.bulk,
            step_id,
            side_effects: self.side_effects,
            path,
        }
    }

    /// Like [`split`](Self::split) with an explicit bulk
    pub fn split_with_bulk(
        &self,
        value: impl Into<Value>,
        step_id: StepId,
        bulk: u64,
    ) -> Result<Traverser, BspError> {
        self.split(value, step_id).with_bulk(bulk)
    }

    /// Move `bulk` out of this traverser into a new one
    ///
    /// The source keeps the remainder, so the total bulk is unchanged. The
    /// source must keep at least 1.
    pub fn split_off(
        &mut self,
        value: impl Into<Value>,
        step_id: StepId,
        bulk: u64,
    ) -> Result<Traverser, BspError> {
        if bulk == 0 || bulk >= self.bulk {
            return Err(BspError::InvalidBulk(bulk));
        }
        let split = self.split_with_bulk(value, step_id, bulk)?;
        self.bulk -= bulk;
        Ok(split)
    }

    /// Partition this traverser's bulk over `targets`, all at `step_id`
    ///
    /// The target bulks must sum to this traverser's bulk.
    pub fn fan_out<V: Into<Value>>(
        self,
        targets: impl IntoIterator<Item = (V, u64)>,
        step_id: StepId,
    ) -> Result<Vec<Traverser>, BspError> {
        let mut out = Vec::new();
        let mut total = 0u64;
        for (value, bulk) in targets {
            total = total
                .checked_add(bulk)
                .ok_or(BspError::BulkOverflow { current: total, added: bulk })?;
            out.push(self.split_with_bulk(value, step_id.clone(), bulk)?);
        }
        if total != self.bulk {
            return Err(BspError::InvalidBulk(total));
        }
        Ok(out)
    }

    /// Reposition without splitting
    pub fn with_step(mut self, step_id: StepId) -> Traverser {
        self.step_id = step_id;
        self
    }

    /// Mark for vertex-local storage; position resets to the resumable marker
    pub fn halt(mut self) -> Traverser {
        self.step_id = StepId::resumable();
        self
    }

    /// Append `labels` to the most recent path entry
    pub fn label(&mut self, labels: &[String]) {
        if let Some(entry) = self.path.as_mut().and_then(|p| p.entries.last_mut()) {
            entry.labels.extend(labels.iter().cloned());
        }
    }

    fn key(&self) -> TraverserKey {
        TraverserKey {
            value: self.value.clone(),
            step_id: self.step_id.clone(),
            side_effects: self.side_effects,
            path: self.path.clone(),
        }
    }
}

/// An ordered set of traversers where equal traversers merge by summing bulk
///
/// The total bulk of a set never exceeds `u64::MAX`; a merge that would is
/// rejected instead of losing bulk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Traverser>", into = "Vec<Traverser>")]
pub struct TraverserSet {
    traversers: BTreeMap<TraverserKey, Traverser>,
    #[serde(skip)]
    bulk: u64,
}

impl TraverserSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, traverser: Traverser) -> Result<(), BspError> {
        let total = self
            .bulk
            .checked_add(traverser.bulk)
            .ok_or(BspError::BulkOverflow {
                current: self.bulk,
                added: traverser.bulk,
            })?;
        match self.traversers.get_mut(&traverser.key()) {
            // Cannot overflow: the entry is part of the total
            Some(existing) => existing.bulk += traverser.bulk,
            None => {
                self.traversers.insert(traverser.key(), traverser);
            }
        }
        self.bulk = total;
        Ok(())
    }

    pub fn add_all(&mut self, other: TraverserSet) -> Result<(), BspError> {
        for traverser in other.traversers.into_values() {
            self.add(traverser)?;
        }
        Ok(())
    }

    /// Build a set from traversers that may not fit in one set
    pub fn try_from_iter(
        traversers: impl IntoIterator<Item = Traverser>,
    ) -> Result<Self, BspError> {
        let mut set = TraverserSet::new();
        for traverser in traversers {
            set.add(traverser)?;
        }
        Ok(set)
    }

    /// Number of distinct traversers
    pub fn len(&self) -> usize {
        self.traversers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traversers.is_empty()
    }

    /// Sum of all bulks
    pub fn bulk(&self) -> u64 {
        self.bulk
    }

    pub fn iter(&self) -> impl Iterator<Item = &Traverser> {
        self.traversers.values()
    }

    /// First traverser in set order
    pub fn peek(&self) -> Option<&Traverser> {
        self.traversers.values().next()
    }

    /// Traversers currently holding `value`
    pub fn with_value<'a>(&'a self, value: &'a Value) -> impl Iterator<Item = &'a Traverser> + 'a {
        self.traversers.values().filter(move |t| &t.value == value)
    }

    /// Remove and return every traverser matching `predicate`
    pub fn extract(&mut self, mut predicate: impl FnMut(&Traverser) -> bool) -> TraverserSet {
        let keys: Vec<TraverserKey> = self
            .traversers
            .iter()
            .filter(|(_, t)| predicate(t))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = TraverserSet::new();
        for key in keys {
            if let Some(t) = self.traversers.remove(&key) {
                self.bulk -= t.bulk;
                out.bulk += t.bulk;
                out.traversers.insert(key, t);
            }
        }
        out
    }
}

impl IntoIterator for TraverserSet {
    type Item = Traverser;
    type IntoIter = std::vec::IntoIter<Traverser>;

    fn into_iter(self) -> Self::IntoIter {
        self.traversers.into_values().collect::<Vec<_>>().into_iter()
    }
}

impl TryFrom<Vec<Traverser>> for TraverserSet {
    type Error = BspError;

    fn try_from(traversers: Vec<Traverser>) -> Result<Self, Self::Error> {
        TraverserSet::try_from_iter(traversers)
    }
}

impl From<TraverserSet> for Vec<Traverser> {
    fn from(set: TraverserSet) -> Self {
        set.into_iter().collect()
    }
}
