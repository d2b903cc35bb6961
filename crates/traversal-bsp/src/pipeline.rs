//! Pipeline definitions and the step-logic seam
//!
//! The step library itself lives outside this crate. A pipeline here is an
//! ordered table of steps, each carrying an opaque [`StepLogic`] and a stable
//! [`StepId`] assigned depth-first in construction order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BspError;
use crate::graph::ComputeVertex;
use crate::keys::Operator;
use crate::side_effects::MemorySideEffects;
use crate::traverser::Traverser;
use crate::value::Value;

const RESUMABLE: &str = "~";

/// Stable identifier of a pipeline step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Marker for traversers that left the distributed phase
    pub fn resumable() -> Self {
        Self(RESUMABLE.to_string())
    }

    pub fn is_resumable(&self) -> bool {
        self.0 == RESUMABLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Behaviour of one step while a traverser sits on a vertex
pub trait StepLogic: Send + Sync {
    /// Process `traverser`, emitting zero or more successors through `ctx`
    fn process(&self, traverser: Traverser, ctx: &mut StepContext<'_, '_>) -> Result<(), BspError>;
}

struct FnStep<F>(F);

impl<F> StepLogic for FnStep<F>
where
    F: Fn(Traverser, &mut StepContext<'_, '_>) -> Result<(), BspError> + Send + Sync,
{
    fn process(&self, traverser: Traverser, ctx: &mut StepContext<'_, '_>) -> Result<(), BspError> {
        (self.0)(traverser, ctx)
    }
}

/// What a step produced for one input traverser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Positioned at the next step; may live on another vertex
    Advance(Traverser),
    /// Finished with the distributed phase
    Halt(Traverser),
}

/// Everything a step may touch while processing a traverser
pub struct StepContext<'a, 'v> {
    vertex: &'a ComputeVertex<'v>,
    side_effects: MemorySideEffects<'a>,
    step: &'a PipelineStep,
    next: Option<&'a Arc<PipelineStep>>,
    emissions: Vec<Emission>,
}

impl<'a, 'v> StepContext<'a, 'v> {
    pub fn new(
        vertex: &'a ComputeVertex<'v>,
        side_effects: MemorySideEffects<'a>,
        step: &'a PipelineStep,
        next: Option<&'a Arc<PipelineStep>>,
    ) -> Self {
        Self {
            vertex,
            side_effects,
            step,
            next,
            emissions: Vec::new(),
        }
    }

    pub fn vertex(&self) -> &ComputeVertex<'v> {
        self.vertex
    }

    pub fn side_effects(&mut self) -> &mut MemorySideEffects<'a> {
        &mut self.side_effects
    }

    pub fn step(&self) -> &PipelineStep {
        self.step
    }

    /// Advance a split of `from` carrying `value` to the next step
    ///
    /// Past the last step the split halts instead.
    pub fn emit(&mut self, from: &Traverser, value: impl Into<Value>) {
        let emission = self.successor(from.split(value, StepId::resumable()));
        self.emissions.push(emission);
    }

    pub fn emit_with_bulk(
        &mut self,
        from: &Traverser,
        value: impl Into<Value>,
        bulk: u64,
    ) -> Result<(), BspError> {
        let split = from.split_with_bulk(value, StepId::resumable(), bulk)?;
        let emission = self.successor(split);
        self.emissions.push(emission);
        Ok(())
    }

    /// Halt `traverser` where it stands
    pub fn halt(&mut self, traverser: Traverser) {
        self.emissions.push(Emission::Halt(traverser.halt()));
    }

    pub fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }

    fn successor(&self, mut split: Traverser) -> Emission {
        split.label(self.step.labels());
        match self.next {
            Some(next) => Emission::Advance(split.with_step(next.id().clone())),
            None => Emission::Halt(split),
        }
    }
}

/// One step of a pipeline
pub struct PipelineStep {
    id: StepId,
    name: String,
    labels: Vec<String>,
    children: Vec<Pipeline>,
    logic: Arc<dyn StepLogic>,
}

impl PipelineStep {
    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Nested pipelines evaluated on behalf of this step
    pub fn children(&self) -> &[Pipeline] {
        &self.children
    }

    pub fn logic(&self) -> &dyn StepLogic {
        self.logic.as_ref()
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("labels", &self.labels)
            .field("children", &self.children.len())
            .finish()
    }
}

/// A declared side effect and how contributions to it merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectDecl {
    pub key: String,
    pub operator: Operator,
}

/// An ordered table of steps
#[derive(Debug)]
pub struct Pipeline {
    reference: String,
    steps: Vec<Arc<PipelineStep>>,
    side_effects: Vec<SideEffectDecl>,
}

impl Pipeline {
    pub fn builder(reference: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(reference)
    }

    /// The string a program configuration uses to find this pipeline
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn steps(&self) -> &[Arc<PipelineStep>] {
        &self.steps
    }

    pub fn side_effects(&self) -> &[SideEffectDecl] {
        &self.side_effects
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First top-level step named `name`
    pub fn step_named(&self, name: &str) -> Option<&Arc<PipelineStep>> {
        self.steps.iter().find(|s| s.name == name)
    }
}

struct StepSpec {
    name: String,
    labels: Vec<String>,
    children: Vec<PipelineBuilder>,
    logic: Arc<dyn StepLogic>,
}

/// Builds a [`Pipeline`], assigning step ids on [`build`](Self::build)
pub struct PipelineBuilder {
    reference: String,
    steps: Vec<StepSpec>,
    side_effects: Vec<SideEffectDecl>,
    error: Option<String>,
}

impl PipelineBuilder {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            steps: Vec::new(),
            side_effects: Vec::new(),
            error: None,
        }
    }

    pub fn step(mut self, name: impl Into<String>, logic: impl StepLogic + 'static) -> Self {
        self.steps.push(StepSpec {
            name: name.into(),
            labels: Vec::new(),
            children: Vec::new(),
            logic: Arc::new(logic),
        });
        self
    }

    /// Add a step whose logic is a closure
    pub fn step_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Traverser, &mut StepContext<'_, '_>) -> Result<(), BspError> + Send + Sync + 'static,
    {
        self.step(name, FnStep(f))
    }

    /// Label the most recently added step
    pub fn label(mut self, label: impl Into<String>) -> Self {
        match self.steps.last_mut() {
            Some(step) => step.labels.push(label.into()),
            None => self.fail("label() called before any step"),
        }
        self
    }

    /// Nest `child` under the most recently added step
    pub fn child(mut self, child: PipelineBuilder) -> Self {
        match self.steps.last_mut() {
            Some(step) => step.children.push(child),
            None => self.fail("child() called before any step"),
        }
        self
    }

    pub fn side_effect(mut self, key: impl Into<String>, operator: Operator) -> Self {
        let key = key.into();
        if self.side_effects.iter().any(|d| d.key == key) {
            self.fail(&format!("side effect '{key}' declared twice"));
        } else {
            self.side_effects.push(SideEffectDecl { key, operator });
        }
        self
    }

    pub fn build(self) -> Result<Pipeline, BspError> {
        self.build_at(None)
    }

    fn fail(&mut self, message: &str) {
        if self.error.is_none() {
            self.error = Some(message.to_string());
        }
    }

    fn build_at(self, prefix: Option<&str>) -> Result<Pipeline, BspError> {
        if let Some(message) = self.error {
            return Err(BspError::config(format!("pipeline '{}': {message}", self.reference)));
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, spec) in self.steps.into_iter().enumerate() {
            let id = match prefix {
                Some(p) => format!("{p}.{i}"),
                None => i.to_string(),
            };
            let mut children = Vec::with_capacity(spec.children.len());
            for (c, child) in spec.children.into_iter().enumerate() {
                children.push(child.build_at(Some(&format!("{id}.{c}")))?);
            }
            steps.push(Arc::new(PipelineStep {
                id: StepId(id),
                name: spec.name,
                labels: spec.labels,
                children,
                logic: spec.logic,
            }));
        }

        Ok(Pipeline {
            reference: self.reference,
            steps,
            side_effects: self.side_effects,
        })
    }
}

/// Resolves pipeline references stored in program configurations
#[derive(Debug, Default, Clone)]
pub struct PipelineCatalog {
    pipelines: HashMap<String, Arc<Pipeline>>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pipeline` under its reference, replacing any previous entry
    pub fn register(&mut self, pipeline: Pipeline) -> Arc<Pipeline> {
        let pipeline = Arc::new(pipeline);
        self.pipelines
            .insert(pipeline.reference().to_string(), pipeline.clone());
        pipeline
    }

    pub fn resolve(&self, reference: &str) -> Result<Arc<Pipeline>, BspError> {
        self.pipelines
            .get(reference)
            .cloned()
            .ok_or_else(|| BspError::config(format!("unknown pipeline '{reference}'")))
    }
}
