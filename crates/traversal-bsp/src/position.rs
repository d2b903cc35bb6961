//! Pipeline position index
//!
//! Steps are copied into a flat arena once, in the same depth-first order
//! that assigned their ids. Traversers only ever carry a [`StepId`]; the
//! index turns that id back into the exact step object the sequential
//! evaluator uses.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BspError;
use crate::pipeline::{Pipeline, PipelineStep, StepId};

struct Slot {
    step: Arc<PipelineStep>,
    next: Option<usize>,
}

/// Lookup from step id to pipeline step
pub struct PositionIndex {
    reference: String,
    slots: Vec<Slot>,
    by_id: HashMap<StepId, usize>,
}

impl PositionIndex {
    pub fn new(pipeline: &Pipeline) -> Self {
        let mut index = PositionIndex {
            reference: pipeline.reference().to_string(),
            slots: Vec::new(),
            by_id: HashMap::new(),
        };
        index.insert_pipeline(pipeline);
        index
    }

    fn insert_pipeline(&mut self, pipeline: &Pipeline) {
        let mut previous: Option<usize> = None;
        for step in pipeline.steps() {
            let slot = self.slots.len();
            self.slots.push(Slot {
                step: step.clone(),
                next: None,
            });
            self.by_id.insert(step.id().clone(), slot);
            if let Some(prev) = previous {
                self.slots[prev].next = Some(slot);
            }
            previous = Some(slot);

            for child in step.children() {
                self.insert_pipeline(child);
            }
        }
    }

    /// Reference of the pipeline this index was built from
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn resolve(&self, id: &StepId) -> Result<&Arc<PipelineStep>, BspError> {
        self.slot(id).map(|s| &self.slots[s].step)
    }

    /// The step after `id` within its own (sub)pipeline
    pub fn next(&self, id: &StepId) -> Result<Option<&Arc<PipelineStep>>, BspError> {
        let slot = self.slot(id)?;
        Ok(self.slots[slot].next.map(|n| &self.slots[n].step))
    }

    /// Check a traverser position; the resumable marker is always valid
    pub fn validate(&self, id: &StepId) -> Result<(), BspError> {
        if id.is_resumable() {
            return Ok(());
        }
        self.slot(id).map(|_| ())
    }

    fn slot(&self, id: &StepId) -> Result<usize, BspError> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| BspError::UnresolvedStep {
                step_id: id.clone(),
                pipeline: self.reference.clone(),
            })
    }
}

impl std::fmt::Debug for PositionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionIndex")
            .field("reference", &self.reference)
            .field("steps", &self.slots.len())
            .finish()
    }
}
