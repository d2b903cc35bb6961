//! Side-effect bags shared by all traversers of one computation
//!
//! Traversers never hold a bag directly; they carry a [`SideEffectsId`] into
//! a [`SideEffectArena`]. Before the distributed phase a bag holds its own
//! values. During it, reads and writes go through memory instead
//! ([`MemorySideEffects`]) so per-vertex contributions merge at the barrier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::BspError;
use crate::keys::{Operator, HALTED_TRAVERSERS};
use crate::memory::Memory;
use crate::pipeline::Pipeline;
use crate::value::ComputeValue;

/// Stable address of a bag inside a [`SideEffectArena`]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SideEffectsId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    operator: Operator,
    value: Option<ComputeValue>,
}

/// Named, operator-merged values accumulated by a computation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffects {
    slots: BTreeMap<String, Slot>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag with one empty slot per side effect `pipeline` declares
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<Self, BspError> {
        let mut bag = SideEffects::new();
        for decl in pipeline.side_effects() {
            bag.register(&decl.key, decl.operator)?;
        }
        Ok(bag)
    }

    /// Declare `key`; registering again with the same operator is a no-op
    pub fn register(&mut self, key: &str, operator: Operator) -> Result<(), BspError> {
        match self.slots.get(key) {
            Some(slot) if slot.operator != operator => Err(BspError::config(format!(
                "side effect '{key}' registered with {} and {operator}",
                slot.operator
            ))),
            Some(_) => Ok(()),
            None => {
                self.slots.insert(
                    key.to_string(),
                    Slot {
                        operator,
                        value: None,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.slots.get(key).is_some_and(|s| s.value.is_some())
    }

    pub fn get(&self, key: &str) -> Result<Option<&ComputeValue>, BspError> {
        self.slot(key).map(|s| s.value.as_ref())
    }

    pub fn set(&mut self, key: &str, value: ComputeValue) -> Result<(), BspError> {
        self.slot_mut(key)?.value = Some(value);
        Ok(())
    }

    pub fn add(&mut self, key: &str, delta: ComputeValue) -> Result<(), BspError> {
        let slot = self.slot_mut(key)?;
        let merged = match &slot.value {
            Some(current) => slot.operator.apply(key, current.clone(), delta)?,
            None => delta,
        };
        slot.value = Some(merged);
        Ok(())
    }

    /// Take the value out of `key`, leaving the slot declared but empty
    pub fn remove(&mut self, key: &str) -> Option<ComputeValue> {
        self.slots.get_mut(key).and_then(|s| s.value.take())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Copy every held value into memory
    ///
    /// Halted traversers are excluded; they seed the run instead of being
    /// a side effect of it.
    pub fn publish(&self, memory: &mut dyn Memory) -> Result<(), BspError> {
        for (key, slot) in &self.slots {
            if key == HALTED_TRAVERSERS {
                continue;
            }
            if let Some(value) = &slot.value {
                memory.set(key, value.clone())?;
            }
        }
        Ok(())
    }

    /// Pull the merged values of every registered key back out of memory
    pub fn absorb(&mut self, memory: &dyn Memory) -> Result<(), BspError> {
        for (key, slot) in self.slots.iter_mut() {
            if key == HALTED_TRAVERSERS {
                continue;
            }
            if let Some(value) = memory.get(key)? {
                slot.value = Some(value.clone());
            }
        }
        Ok(())
    }

    fn slot(&self, key: &str) -> Result<&Slot, BspError> {
        self.slots.get(key).ok_or_else(|| BspError::unknown_key(key))
    }

    fn slot_mut(&mut self, key: &str) -> Result<&mut Slot, BspError> {
        self.slots.get_mut(key).ok_or_else(|| BspError::unknown_key(key))
    }
}

/// Owner of every side-effect bag; traversers address bags by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectArena {
    bags: Vec<SideEffects>,
}

impl SideEffectArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, bag: SideEffects) -> SideEffectsId {
        self.bags.push(bag);
        SideEffectsId((self.bags.len() - 1) as u32)
    }

    pub fn get(&self, id: SideEffectsId) -> Result<&SideEffects, BspError> {
        self.bags
            .get(id.0 as usize)
            .ok_or_else(|| BspError::config(format!("no side-effect bag {}", id.0)))
    }

    pub fn get_mut(&mut self, id: SideEffectsId) -> Result<&mut SideEffects, BspError> {
        self.bags
            .get_mut(id.0 as usize)
            .ok_or_else(|| BspError::config(format!("no side-effect bag {}", id.0)))
    }

    pub fn len(&self) -> usize {
        self.bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }
}

/// Memory-backed side effects used while a computation is distributed
pub struct MemorySideEffects<'a> {
    memory: &'a mut dyn Memory,
}

impl<'a> MemorySideEffects<'a> {
    pub fn new(memory: &'a mut dyn Memory) -> Self {
        Self { memory }
    }

    /// Value as of the start of the current superstep
    pub fn get(&self, key: &str) -> Result<Option<&ComputeValue>, BspError> {
        self.memory.get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.memory.exists(key)
    }

    /// Contribute to `key`; merged at the next barrier
    pub fn add(&mut self, key: &str, delta: ComputeValue) -> Result<(), BspError> {
        self.memory.add(key, delta)
    }

    pub fn iteration(&self) -> usize {
        self.memory.iteration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ComputeKeys, MemoryComputeKey};
    use crate::memory::MasterMemory;
    use crate::value::BulkSet;
    use std::sync::Arc;

    fn java(n: u64) -> ComputeValue {
        let mut set = BulkSet::new();
        set.add("java", n);
        set.into()
    }

    #[test]
    fn test_local_bag_merges_with_operator() {
        let mut bag = SideEffects::new();
        bag.register("x", Operator::AddAll).unwrap();
        bag.add("x", java(3)).unwrap();
        bag.add("x", java(1)).unwrap();

        assert_eq!(bag.get("x").unwrap().unwrap().as_bulk_set().unwrap().size(), 4);
        assert!(matches!(bag.get("y"), Err(BspError::UnknownKey { .. })));
    }

    #[test]
    fn test_failed_add_keeps_value() {
        let mut bag = SideEffects::new();
        bag.register("x", Operator::AddAll).unwrap();
        bag.set("x", java(2)).unwrap();
        assert!(bag.add("x", ComputeValue::from(1i64)).is_err());
        assert_eq!(bag.get("x").unwrap(), Some(&java(2)));
    }

    #[test]
    fn test_conflicting_registration() {
        let mut bag = SideEffects::new();
        bag.register("x", Operator::AddAll).unwrap();
        assert!(bag.register("x", Operator::AddAll).is_ok());
        assert!(bag.register("x", Operator::Sum).is_err());
    }

    #[test]
    fn test_publish_and_absorb_through_memory() {
        let keys = ComputeKeys::new()
            .with_memory_key(MemoryComputeKey::new("x", Operator::AddAll, true, false).unwrap())
            .unwrap();
        let mut memory = MasterMemory::new(Arc::new(keys), true);

        let mut bag = SideEffects::new();
        bag.register("x", Operator::AddAll).unwrap();
        bag.register(HALTED_TRAVERSERS, Operator::AddAll).unwrap();
        bag.set("x", java(4)).unwrap();
        bag.publish(&mut memory).unwrap();

        {
            let mut view = MemorySideEffects::new(&mut memory);
            assert!(view.exists("x"));
            view.add("x", java(1)).unwrap();
        }

        let mut out = SideEffects::new();
        out.register("x", Operator::AddAll).unwrap();
        out.absorb(&memory).unwrap();
        assert_eq!(out.get("x").unwrap(), Some(&java(5)));
    }

    #[test]
    fn test_arena_addresses_bags_by_id() {
        let mut arena = SideEffectArena::new();
        let a = arena.alloc(SideEffects::new());
        let b = arena.alloc(SideEffects::new());
        assert_ne!(a, b);
        arena.get_mut(b).unwrap().register("x", Operator::Sum).unwrap();
        assert!(arena.get(b).unwrap().keys().any(|k| k == "x"));
        assert!(arena.get(SideEffectsId(7)).is_err());
    }
}
