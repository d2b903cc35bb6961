//! Global memory: per-superstep snapshot and merge
//!
//! During a superstep every worker reads the same immutable snapshot and
//! stages its writes. Only the barrier folds the staged writes into the next
//! snapshot, so nothing a vertex writes is visible to another vertex before
//! the following superstep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BspError;
use crate::keys::{ComputeKeys, MemoryComputeKey};
use crate::value::ComputeValue;

/// Access to global memory from a program hook
pub trait Memory {
    /// Current value of a declared key; `None` if it holds nothing yet
    fn get(&self, key: &str) -> Result<Option<&ComputeValue>, BspError>;

    /// Overwrite a declared key
    fn set(&mut self, key: &str, value: ComputeValue) -> Result<(), BspError>;

    /// Contribute `delta`, folded with the key's operator
    fn add(&mut self, key: &str, delta: ComputeValue) -> Result<(), BspError>;

    /// Zero-based superstep counter
    fn iteration(&self) -> usize;

    fn is_initial_iteration(&self) -> bool {
        self.iteration() == 0
    }

    fn exists(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }
}

/// An immutable view of memory at one superstep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    iteration: usize,
    values: BTreeMap<String, ComputeValue>,
}

impl MemorySnapshot {
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn get(&self, key: &str) -> Option<&ComputeValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Writes staged by one worker during a superstep
#[derive(Debug, Clone, Default)]
pub struct MemoryContributions {
    sets: BTreeMap<String, ComputeValue>,
    adds: BTreeMap<String, Vec<ComputeValue>>,
}

impl MemoryContributions {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.adds.is_empty()
    }

    /// Number of staged writes
    pub fn len(&self) -> usize {
        self.sets.len() + self.adds.values().map(Vec::len).sum::<usize>()
    }
}

/// Memory as seen by the master between supersteps
///
/// No vertex runs while the master holds memory, so writes apply at once.
#[derive(Debug, Clone)]
pub struct MasterMemory {
    keys: Arc<ComputeKeys>,
    snapshot: Arc<MemorySnapshot>,
    verify_merges: bool,
}

impl MasterMemory {
    pub fn new(keys: Arc<ComputeKeys>, verify_merges: bool) -> Self {
        Self {
            keys,
            snapshot: Arc::new(MemorySnapshot::default()),
            verify_merges,
        }
    }

    /// Shared snapshot handed to workers for the next superstep
    pub fn snapshot(&self) -> Arc<MemorySnapshot> {
        self.snapshot.clone()
    }

    pub fn keys(&self) -> &Arc<ComputeKeys> {
        &self.keys
    }

    /// A worker-side view over the current snapshot
    pub fn worker(&self) -> WorkerMemory {
        WorkerMemory::new(self.keys.clone(), self.snapshot.clone())
    }

    /// Merge every worker's contributions into the next snapshot
    ///
    /// All-or-nothing: on error the current snapshot is left untouched.
    /// Returns the number of keys that received contributions.
    pub fn barrier(&mut self, contributions: &[MemoryContributions]) -> Result<usize, BspError> {
        for staged in contributions {
            for key in staged.sets.keys().chain(staged.adds.keys()) {
                self.keys.memory_key(key)?;
            }
        }

        let mut next = BTreeMap::new();
        let mut touched = 0;
        for key in self.keys.memory_keys() {
            let name = key.name();
            let staged_set = contributions
                .iter()
                .rev()
                .find_map(|c| c.sets.get(name))
                .cloned();
            let deltas: Vec<&ComputeValue> = contributions
                .iter()
                .filter_map(|c| c.adds.get(name))
                .flatten()
                .collect();
            if staged_set.is_some() || !deltas.is_empty() {
                touched += 1;
            }

            let base = match staged_set {
                Some(value) => Some(value),
                None if key.is_transient() => None,
                None => self.snapshot.values.get(name).cloned(),
            };

            let merged = fold(key, deltas.iter().copied())?;
            if self.verify_merges && deltas.len() > 1 {
                let reversed = fold(key, deltas.iter().rev().copied())?;
                if merged != reversed {
                    return Err(BspError::merge_violation(
                        name,
                        format!(
                            "operator {} depends on contribution order",
                            key.operator()
                        ),
                    ));
                }
            }

            let value = match (base, merged) {
                (Some(base), Some(merged)) => Some(key.operator().apply(name, base, merged)?),
                (base, merged) => base.or(merged),
            };
            if let Some(value) = value {
                next.insert(name.to_string(), value);
            }
        }

        self.snapshot = Arc::new(MemorySnapshot {
            iteration: self.snapshot.iteration,
            values: next,
        });
        Ok(touched)
    }

    /// Advance to the next superstep
    pub fn increment_iteration(&mut self) {
        Arc::make_mut(&mut self.snapshot).iteration += 1;
    }

    /// Final memory with transient keys dropped
    pub fn into_result(self) -> MemorySnapshot {
        let keys = self.keys;
        let mut snapshot = Arc::unwrap_or_clone(self.snapshot);
        snapshot.values.retain(|name, _| {
            keys.memory_key(name)
                .map(|k| !k.is_transient())
                .unwrap_or(false)
        });
        snapshot
    }
}

fn fold<'a>(
    key: &MemoryComputeKey,
    deltas: impl Iterator<Item = &'a ComputeValue>,
) -> Result<Option<ComputeValue>, BspError> {
    let mut acc: Option<ComputeValue> = None;
    for delta in deltas {
        acc = Some(match acc {
            Some(current) => key.operator().apply(key.name(), current, delta.clone())?,
            None => delta.clone(),
        });
    }
    Ok(acc)
}

impl Memory for MasterMemory {
    fn get(&self, key: &str) -> Result<Option<&ComputeValue>, BspError> {
        self.keys.memory_key(key)?;
        Ok(self.snapshot.values.get(key))
    }

    fn set(&mut self, key: &str, value: ComputeValue) -> Result<(), BspError> {
        self.keys.memory_key(key)?;
        Arc::make_mut(&mut self.snapshot)
            .values
            .insert(key.to_string(), value);
        Ok(())
    }

    fn add(&mut self, key: &str, delta: ComputeValue) -> Result<(), BspError> {
        let operator = self.keys.memory_key(key)?.operator();
        let values = &mut Arc::make_mut(&mut self.snapshot).values;
        let merged = match values.get(key) {
            Some(current) => operator.apply(key, current.clone(), delta)?,
            None => delta,
        };
        values.insert(key.to_string(), merged);
        Ok(())
    }

    fn iteration(&self) -> usize {
        self.snapshot.iteration
    }
}

/// Memory as seen by one worker during a superstep
#[derive(Debug)]
pub struct WorkerMemory {
    keys: Arc<ComputeKeys>,
    snapshot: Arc<MemorySnapshot>,
    staged: MemoryContributions,
}

impl WorkerMemory {
    pub fn new(keys: Arc<ComputeKeys>, snapshot: Arc<MemorySnapshot>) -> Self {
        Self {
            keys,
            snapshot,
            staged: MemoryContributions::default(),
        }
    }

    pub fn into_contributions(self) -> MemoryContributions {
        self.staged
    }
}

impl Memory for WorkerMemory {
    fn get(&self, key: &str) -> Result<Option<&ComputeValue>, BspError> {
        if !self.keys.memory_key(key)?.is_broadcast() {
            return Err(BspError::KeyNotBroadcast {
                key: key.to_string(),
            });
        }
        Ok(self.snapshot.values.get(key))
    }

    fn set(&mut self, key: &str, value: ComputeValue) -> Result<(), BspError> {
        self.keys.memory_key(key)?;
        self.staged.sets.insert(key.to_string(), value);
        Ok(())
    }

    fn add(&mut self, key: &str, delta: ComputeValue) -> Result<(), BspError> {
        self.keys.memory_key(key)?;
        self.staged
            .adds
            .entry(key.to_string())
            .or_default()
            .push(delta);
        Ok(())
    }

    fn iteration(&self) -> usize {
        self.snapshot.iteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{MemoryComputeKey, Operator};
    use crate::value::{BulkSet, Value};
    use rand::seq::SliceRandom;

    fn keys() -> Arc<ComputeKeys> {
        let keys = ComputeKeys::new()
            .with_memory_key(MemoryComputeKey::new("count", Operator::Sum, true, false).unwrap())
            .unwrap()
            .with_memory_key(MemoryComputeKey::new("seen", Operator::AddAll, true, false).unwrap())
            .unwrap()
            .with_memory_key(MemoryComputeKey::new("vote", Operator::And, true, true).unwrap())
            .unwrap()
            .with_memory_key(MemoryComputeKey::new("hidden", Operator::Max, false, false).unwrap())
            .unwrap();
        Arc::new(keys)
    }

    #[test]
    fn test_worker_writes_invisible_until_barrier() {
        let mut master = MasterMemory::new(keys(), true);
        master.set("count", 10i64.into()).unwrap();

        let mut worker = master.worker();
        worker.add("count", 5i64.into()).unwrap();
        assert_eq!(worker.get("count").unwrap(), Some(&ComputeValue::from(10i64)));

        master.barrier(&[worker.into_contributions()]).unwrap();
        assert_eq!(master.get("count").unwrap(), Some(&ComputeValue::from(15i64)));
    }

    #[test]
    fn test_transient_keys_reset_each_barrier() {
        let mut master = MasterMemory::new(keys(), true);
        master.set("vote", true.into()).unwrap();
        master.barrier(&[]).unwrap();
        assert_eq!(master.get("vote").unwrap(), None);

        let mut a = master.worker();
        let mut b = master.worker();
        a.add("vote", true.into()).unwrap();
        b.add("vote", false.into()).unwrap();
        b.add("vote", true.into()).unwrap();
        master
            .barrier(&[a.into_contributions(), b.into_contributions()])
            .unwrap();
        assert_eq!(master.get("vote").unwrap(), Some(&ComputeValue::from(false)));
    }

    #[test]
    fn test_set_overrides_previous_then_adds_fold() {
        let mut master = MasterMemory::new(keys(), true);
        master.set("count", 100i64.into()).unwrap();

        let mut a = master.worker();
        let mut b = master.worker();
        a.set("count", 1i64.into()).unwrap();
        b.add("count", 2i64.into()).unwrap();
        master
            .barrier(&[a.into_contributions(), b.into_contributions()])
            .unwrap();
        assert_eq!(master.get("count").unwrap(), Some(&ComputeValue::from(3i64)));
    }

    #[test]
    fn test_merge_order_independent_under_permutation() {
        let mut rng = rand::thread_rng();
        let contributions: Vec<i64> = (1..=20).collect();
        let mut expected = None;

        for _ in 0..25 {
            let mut order = contributions.clone();
            order.shuffle(&mut rng);

            let mut master = MasterMemory::new(keys(), true);
            let staged: Vec<MemoryContributions> = order
                .iter()
                .map(|n| {
                    let mut w = master.worker();
                    w.add("count", (*n).into()).unwrap();
                    let mut bulk = BulkSet::new();
                    bulk.add(Value::Int(n % 3), 1);
                    w.add("seen", bulk.into()).unwrap();
                    w.into_contributions()
                })
                .collect();
            master.barrier(&staged).unwrap();

            let result = (
                master.get("count").unwrap().cloned(),
                master.get("seen").unwrap().cloned(),
            );
            match &expected {
                None => expected = Some(result),
                Some(e) => assert_eq!(e, &result),
            }
        }

        let (count, seen) = expected.unwrap();
        assert_eq!(count, Some(ComputeValue::from(210i64)));
        assert_eq!(seen.unwrap().as_bulk_set().unwrap().size(), 20);
    }

    #[test]
    fn test_failed_barrier_leaves_memory_untouched() {
        let mut master = MasterMemory::new(keys(), true);
        master.set("count", 1i64.into()).unwrap();

        let mut good = master.worker();
        good.add("seen", BulkSet::new().into()).unwrap();
        let mut bad = master.worker();
        bad.add("count", "not a number".into()).unwrap();

        let err = master
            .barrier(&[good.into_contributions(), bad.into_contributions()])
            .unwrap_err();
        assert!(matches!(err, BspError::MergeContractViolation { .. }));
        assert_eq!(master.get("count").unwrap(), Some(&ComputeValue::from(1i64)));
        assert_eq!(master.get("seen").unwrap(), None);
    }

    #[test]
    fn test_key_checks() {
        let master = MasterMemory::new(keys(), true);
        let mut worker = master.worker();

        assert!(matches!(master.get("nope"), Err(BspError::UnknownKey { .. })));
        assert!(matches!(worker.add("nope", 1i64.into()), Err(BspError::UnknownKey { .. })));
        assert!(matches!(
            worker.get("hidden"),
            Err(BspError::KeyNotBroadcast { .. })
        ));
        assert!(master.get("hidden").is_ok());
    }

    #[test]
    fn test_iteration_and_result() {
        let mut master = MasterMemory::new(keys(), true);
        assert!(master.is_initial_iteration());
        master.set("vote", true.into()).unwrap();
        master.set("count", 4i64.into()).unwrap();
        master.increment_iteration();
        assert_eq!(master.iteration(), 1);
        assert!(!master.is_initial_iteration());

        let result = master.into_result();
        assert_eq!(result.iteration(), 1);
        assert!(result.get("vote").is_none());
        assert_eq!(result.get("count"), Some(&ComputeValue::from(4i64)));
    }
}
