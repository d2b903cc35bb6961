//! Running a pipeline as a vertex program
//!
//! Every traverser is driven through the pipeline's steps on the vertex it
//! currently sits on. A traverser that advances onto another vertex travels
//! there as a message and continues in the next superstep. A traverser that
//! runs past the last step, or is halted by a step, is stored on the vertex
//! under [`HALTED_TRAVERSERS`] for the sequential phase to pick up.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::VertexProgram;
use crate::config::{ProgramConfiguration, PIPELINE_KEY, SEED_KEY, SIDE_EFFECTS_KEY, STEP_ID_KEY};
use crate::error::BspError;
use crate::graph::{ComputeVertex, Graph};
use crate::keys::{ComputeKeys, MemoryComputeKey, Operator, ACTIVE_TRAVERSERS, HALTED_TRAVERSERS};
use crate::memory::{Memory, MemorySnapshot};
use crate::message::{MessageScope, Messenger};
use crate::pipeline::{Emission, Pipeline, PipelineCatalog, StepContext, StepId};
use crate::position::PositionIndex;
use crate::side_effects::{MemorySideEffects, SideEffectArena, SideEffects, SideEffectsId};
use crate::traverser::{Traverser, TraverserSet};
use crate::value::{ComputeValue, Value, VertexId};

/// Memory key every vertex votes on; true when it sent nothing
pub const VOTE_TO_HALT: &str = "bsp.voteToHalt";

/// Where the first superstep's traversers come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seed {
    /// One traverser per vertex, holding that vertex
    #[default]
    AllVertices,
    /// The halted traversers held in the side-effect bag
    Traversers,
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seed::AllVertices => f.write_str("all_vertices"),
            Seed::Traversers => f.write_str("traversers"),
        }
    }
}

impl FromStr for Seed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_vertices" => Ok(Seed::AllVertices),
            "traversers" => Ok(Seed::Traversers),
            other => Err(format!("unknown seed mode '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSideEffects {
    arena: SideEffectArena,
    root: SideEffectsId,
}

/// Vertex program evaluating a [`Pipeline`] across the graph
#[derive(Debug, Clone, Default)]
pub struct TraversalProgram {
    pipeline: Option<Arc<Pipeline>>,
    index: Option<Arc<PositionIndex>>,
    keys: ComputeKeys,
    side_effects: SideEffectArena,
    root: SideEffectsId,
    start: Option<StepId>,
    seed: Seed,
}

impl TraversalProgram {
    /// Program starting at the pipeline's first step with empty side effects
    pub fn new(pipeline: Arc<Pipeline>, seed: Seed) -> Result<Self, BspError> {
        let keys = ComputeKeys::for_pipeline(&pipeline)?.with_memory_key(MemoryComputeKey::new(
            VOTE_TO_HALT,
            Operator::And,
            true,
            true,
        )?)?;
        let index = Arc::new(PositionIndex::new(&pipeline));
        let mut side_effects = SideEffectArena::new();
        let root = side_effects.alloc(SideEffects::for_pipeline(&pipeline)?);
        let start = pipeline.steps().first().map(|s| s.id().clone());

        Ok(Self {
            pipeline: Some(pipeline),
            index: Some(index),
            keys,
            side_effects,
            root,
            start,
            seed,
        })
    }

    /// Replace the side-effect bag, e.g. with one holding seed traversers
    ///
    /// Side effects the pipeline declares are registered on `bag` if missing.
    pub fn with_side_effects(mut self, mut bag: SideEffects) -> Result<Self, BspError> {
        for decl in self.pipeline()?.side_effects() {
            bag.register(&decl.key, decl.operator)?;
        }
        *self.side_effects.get_mut(self.root)? = bag;
        Ok(self)
    }

    /// Seed traversers at `step` instead of the first step
    pub fn starting_at(mut self, step: StepId) -> Result<Self, BspError> {
        self.index()?.resolve(&step)?;
        self.start = Some(step);
        Ok(self)
    }

    pub fn pipeline(&self) -> Result<&Arc<Pipeline>, BspError> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| BspError::config("traversal program has no pipeline loaded"))
    }

    pub fn start_step(&self) -> Option<&StepId> {
        self.start.as_ref()
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    /// The bag traversers of this program write to
    ///
    /// After the run terminates it holds the merged side effects.
    pub fn side_effects(&self) -> Result<&SideEffects, BspError> {
        self.side_effects.get(self.root)
    }

    pub fn side_effects_id(&self) -> SideEffectsId {
        self.root
    }

    /// Every halted traverser in a finished run
    ///
    /// Unions the vertex-local halted sets with any the master left in memory.
    pub fn halted_traversers(
        graph: &Graph,
        memory: &MemorySnapshot,
    ) -> Result<TraverserSet, BspError> {
        let mut halted = TraverserSet::new();
        for set in Self::resume_points(graph).into_values() {
            halted.add_all(set)?;
        }
        if let Some(set) = memory.get(HALTED_TRAVERSERS).and_then(ComputeValue::as_traversers) {
            halted.add_all(set.clone())?;
        }
        Ok(halted)
    }

    /// Halted traversers grouped by the vertex the sequential phase resumes them on
    pub fn resume_points(graph: &Graph) -> BTreeMap<VertexId, TraverserSet> {
        graph
            .vertices()
            .filter_map(|v| {
                v.property(HALTED_TRAVERSERS)
                    .and_then(ComputeValue::as_traversers)
                    .filter(|set| !set.is_empty())
                    .map(|set| (v.id(), set.clone()))
            })
            .collect()
    }

    fn index(&self) -> Result<&Arc<PositionIndex>, BspError> {
        self.index
            .as_ref()
            .ok_or_else(|| BspError::config("traversal program has no pipeline loaded"))
    }

    fn start(&self) -> Result<StepId, BspError> {
        self.start
            .clone()
            .ok_or_else(|| BspError::config("traversal program has no start step"))
    }

    /// Traversers that begin this superstep on `vertex`
    fn gather(
        &self,
        vertex: &ComputeVertex<'_>,
        messages: &[Traverser],
        memory: &dyn Memory,
    ) -> Result<TraverserSet, BspError> {
        let mut incoming = TraverserSet::try_from_iter(messages.iter().cloned())?;

        let here = Value::Vertex(vertex.id());
        if let Some(active) = memory
            .get(ACTIVE_TRAVERSERS)?
            .and_then(ComputeValue::as_traversers)
        {
            for traverser in active.with_value(&here) {
                incoming.add(traverser.clone())?;
            }
        }

        if memory.is_initial_iteration() && self.seed == Seed::AllVertices {
            incoming.add(Traverser::new(vertex.id(), self.start()?, self.root))?;
        }
        Ok(incoming)
    }
}

/// Turn one seed traverser into the traversers that start on vertices
///
/// A vertex seed starts where it is. A map seed, such as a count per vertex,
/// starts one traverser on each key with the count times the seed's bulk.
fn expand_seed(seed: Traverser, step: StepId) -> Result<Vec<Traverser>, BspError> {
    if seed.value().as_vertex().is_some() {
        return Ok(vec![seed.with_step(step)]);
    }
    match seed.value() {
        Value::Map(counts) => counts
            .iter()
            .map(|(key, count)| {
                let vertex = key.as_vertex().ok_or_else(|| {
                    BspError::config(format!("seed map key {key} is not a vertex"))
                })?;
                let count = count.as_int().ok_or_else(|| {
                    BspError::config(format!(
                        "seed count for {vertex} is {}, not an int",
                        count.type_name()
                    ))
                })?;
                let count = u64::try_from(count).map_err(|_| BspError::InvalidBulk(0))?;
                let bulk = count.checked_mul(seed.bulk()).ok_or(BspError::BulkOverflow {
                    current: count,
                    added: seed.bulk(),
                })?;
                seed.split_with_bulk(vertex, step.clone(), bulk)
            })
            .collect(),
        other => Err(BspError::config(format!(
            "seed traverser holds {}, not a vertex or vertex counts",
            other.type_name()
        ))),
    }
}

impl VertexProgram for TraversalProgram {
    type Message = Traverser;

    fn name(&self) -> &str {
        "traversal"
    }

    fn load_state(
        &mut self,
        configuration: &ProgramConfiguration,
        catalog: &PipelineCatalog,
    ) -> Result<(), BspError> {
        let pipeline = catalog.resolve(configuration.require(PIPELINE_KEY)?)?;
        let seed = configuration.parse::<Seed>(SEED_KEY)?.unwrap_or_default();
        let mut program = TraversalProgram::new(pipeline, seed)?;

        if let Some(step) = configuration.get(STEP_ID_KEY) {
            program = program.starting_at(StepId::new(step))?;
        }
        if let Some(stored) = configuration.get_json::<StoredSideEffects>(SIDE_EFFECTS_KEY)? {
            stored.arena.get(stored.root)?;
            program.side_effects = stored.arena;
            program.root = stored.root;
        }

        *self = program;
        Ok(())
    }

    fn store_state(&self, configuration: &mut ProgramConfiguration) -> Result<(), BspError> {
        configuration.set(PIPELINE_KEY, self.pipeline()?.reference());
        if let Some(start) = &self.start {
            configuration.set(STEP_ID_KEY, start.as_str());
        }
        configuration.set(SEED_KEY, self.seed.to_string());
        configuration.set_json(
            SIDE_EFFECTS_KEY,
            &StoredSideEffects {
                arena: self.side_effects.clone(),
                root: self.root,
            },
        )
    }

    fn compute_keys(&self) -> &ComputeKeys {
        &self.keys
    }

    fn setup(&mut self, memory: &mut dyn Memory) -> Result<(), BspError> {
        let index = self.index()?.clone();
        let start = self.start()?;
        let seed = self.seed;
        let bag = self.side_effects.get_mut(self.root)?;
        bag.publish(memory)?;

        if seed != Seed::Traversers {
            return Ok(());
        }

        let seeds = match bag.remove(HALTED_TRAVERSERS) {
            None => TraverserSet::new(),
            Some(ComputeValue::Traversers(set)) => set,
            Some(other) => {
                return Err(BspError::config(format!(
                    "seed side effect holds {}, not traversers",
                    other.type_name()
                )))
            }
        };

        let mut active = TraverserSet::new();
        for traverser in seeds {
            let step = if traverser.is_halted() {
                start.clone()
            } else {
                index.validate(traverser.step_id())?;
                traverser.step_id().clone()
            };
            for expanded in expand_seed(traverser, step)? {
                active.add(expanded)?;
            }
        }

        tracing::debug!(
            traversers = active.len(),
            bulk = active.bulk(),
            "seeded active traversers"
        );
        memory.set(ACTIVE_TRAVERSERS, active.into())
    }

    fn execute(
        &mut self,
        vertex: &mut ComputeVertex<'_>,
        messenger: &mut dyn Messenger<Traverser>,
        memory: &mut dyn Memory,
    ) -> Result<(), BspError> {
        let index = self.index()?.clone();
        let incoming = self.gather(vertex, messenger.receive_messages(), &*memory)?;

        let mut queue: VecDeque<Traverser> = incoming.into_iter().collect();
        let mut halted = TraverserSet::new();
        let mut sent = false;

        while let Some(traverser) = queue.pop_front() {
            if traverser.is_halted() {
                halted.add(traverser)?;
                continue;
            }
            let step = index.resolve(traverser.step_id())?;
            let next = index.next(traverser.step_id())?;

            let emissions = {
                let side_effects = MemorySideEffects::new(&mut *memory);
                let mut ctx = StepContext::new(&*vertex, side_effects, step, next);
                step.logic().process(traverser, &mut ctx)?;
                ctx.into_emissions()
            };

            for emission in emissions {
                match emission {
                    Emission::Halt(t) => halted.add(t)?,
                    Emission::Advance(t) => match t.value().as_vertex() {
                        Some(target) if target == vertex.id() => queue.push_back(t),
                        Some(target) if !vertex.topology().contains(target) => {
                            tracing::debug!(
                                from = %vertex.id(),
                                to = %target,
                                step = %t.step_id(),
                                bulk = t.bulk(),
                                "traverser advanced to a vertex not in the graph; dropped"
                            );
                        }
                        Some(target) => {
                            messenger.send_message(&MessageScope::global([target]), t);
                            sent = true;
                        }
                        None => queue.push_back(t),
                    },
                }
            }
        }

        if !halted.is_empty() {
            let mut stored = vertex
                .property(HALTED_TRAVERSERS)
                .and_then(ComputeValue::as_traversers)
                .cloned()
                .unwrap_or_default();
            stored.add_all(halted)?;
            vertex.set_property(HALTED_TRAVERSERS, stored)?;
        }

        memory.add(VOTE_TO_HALT, ComputeValue::from(!sent))
    }

    fn terminate(&mut self, memory: &mut dyn Memory) -> Result<bool, BspError> {
        let voted = memory
            .get(VOTE_TO_HALT)?
            .and_then(ComputeValue::as_value)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let active = memory
            .get(ACTIVE_TRAVERSERS)?
            .and_then(ComputeValue::as_traversers)
            .map_or(0, TraverserSet::len);

        let done = !memory.is_initial_iteration() && voted && active == 0;
        if done {
            self.side_effects.get_mut(self.root)?.absorb(&*memory)?;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MasterMemory;
    use crate::value::BulkSet;

    fn catalog() -> (PipelineCatalog, Arc<Pipeline>) {
        let mut catalog = PipelineCatalog::new();
        let pipeline = catalog.register(
            Pipeline::builder("g.V().values(lang).aggregate(x)")
                .step_fn("V", |t, ctx| {
                    let value = t.value().clone();
                    ctx.emit(&t, value);
                    Ok(())
                })
                .step_fn("values", |t, ctx| {
                    if let Some(lang) = ctx.vertex().value("lang").cloned() {
                        ctx.emit(&t, lang);
                    }
                    Ok(())
                })
                .step_fn("aggregate", |t, ctx| {
                    let mut seen = BulkSet::new();
                    seen.add(t.value().clone(), t.bulk());
                    ctx.side_effects().add("x", seen.into())?;
                    let value = t.value().clone();
                    ctx.emit(&t, value);
                    Ok(())
                })
                .side_effect("x", Operator::AddAll)
                .build()
                .unwrap(),
        );
        (catalog, pipeline)
    }

    fn seed_bag(traversers: Vec<Traverser>) -> SideEffects {
        let mut bag = SideEffects::new();
        bag.register(HALTED_TRAVERSERS, Operator::AddAll).unwrap();
        let seeds = TraverserSet::try_from(traversers).unwrap();
        bag.set(HALTED_TRAVERSERS, seeds.into()).unwrap();
        bag
    }

    #[test]
    fn test_declares_vote_and_reserved_keys() {
        let (_, pipeline) = catalog();
        let program = TraversalProgram::new(pipeline, Seed::AllVertices).unwrap();
        let keys = program.compute_keys();

        let vote = keys.memory_key(VOTE_TO_HALT).unwrap();
        assert_eq!(vote.operator(), Operator::And);
        assert!(vote.is_transient());
        assert!(keys.memory_key("x").is_ok());
        assert!(keys.vertex_key(HALTED_TRAVERSERS).is_ok());
        assert_eq!(program.start_step(), Some(&StepId::new("0")));
    }

    #[test]
    fn test_store_then_load_reproduces_program() {
        let (catalog, pipeline) = catalog();
        let lop = Traverser::new(VertexId(3), StepId::resumable(), SideEffectsId(0))
            .with_bulk(3)
            .unwrap();
        let program = TraversalProgram::new(pipeline, Seed::Traversers)
            .unwrap()
            .starting_at(StepId::new("1"))
            .unwrap()
            .with_side_effects(seed_bag(vec![lop]))
            .unwrap();

        let mut configuration = ProgramConfiguration::new();
        program.store_state(&mut configuration).unwrap();
        let json = configuration.to_json().unwrap();

        let mut loaded = TraversalProgram::default();
        loaded
            .load_state(&ProgramConfiguration::from_json(&json).unwrap(), &catalog)
            .unwrap();

        assert_eq!(loaded.compute_keys(), program.compute_keys());
        assert_eq!(loaded.start_step(), Some(&StepId::new("1")));
        assert_eq!(loaded.seed(), Seed::Traversers);
        assert_eq!(loaded.side_effects().unwrap(), program.side_effects().unwrap());
        assert_eq!(
            loaded.pipeline().unwrap().reference(),
            "g.V().values(lang).aggregate(x)"
        );
    }

    #[test]
    fn test_load_rejects_mismatched_state() {
        let (catalog, _) = catalog();

        let mut configuration = ProgramConfiguration::new();
        configuration.set(PIPELINE_KEY, "g.V().values(lang).aggregate(x)");
        configuration.set(STEP_ID_KEY, "7.0.1");
        let err = TraversalProgram::default()
            .load_state(&configuration, &catalog)
            .unwrap_err();
        assert!(matches!(err, BspError::UnresolvedStep { .. }));

        let err = TraversalProgram::default()
            .load_state(&ProgramConfiguration::new(), &catalog)
            .unwrap_err();
        assert!(matches!(err, BspError::Configuration(_)));

        configuration.set(STEP_ID_KEY, "0");
        configuration.set(SEED_KEY, "sometimes");
        assert!(TraversalProgram::default()
            .load_state(&configuration, &catalog)
            .is_err());
    }

    #[test]
    fn test_setup_moves_seeds_into_active_memory() {
        let (_, pipeline) = catalog();
        let lop = Traverser::new(VertexId(3), StepId::resumable(), SideEffectsId(0))
            .with_bulk(3)
            .unwrap();
        let ripple = Traverser::new(VertexId(5), StepId::resumable(), SideEffectsId(0));
        let mut program = TraversalProgram::new(pipeline, Seed::Traversers)
            .unwrap()
            .starting_at(StepId::new("1"))
            .unwrap()
            .with_side_effects(seed_bag(vec![lop, ripple]))
            .unwrap();

        let mut memory = MasterMemory::new(Arc::new(program.compute_keys().clone()), true);
        program.setup(&mut memory).unwrap();

        let active = memory
            .get(ACTIVE_TRAVERSERS)
            .unwrap()
            .and_then(ComputeValue::as_traversers)
            .unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active.bulk(), 4);
        assert!(active.iter().all(|t| t.step_id() == &StepId::new("1")));
        assert!(!program.side_effects().unwrap().exists(HALTED_TRAVERSERS));
    }

    #[test]
    fn test_setup_rejects_non_vertex_seeds() {
        let (_, pipeline) = catalog();
        let stray = Traverser::new("java", StepId::resumable(), SideEffectsId(0));
        let mut program = TraversalProgram::new(pipeline, Seed::Traversers)
            .unwrap()
            .with_side_effects(seed_bag(vec![stray]))
            .unwrap();

        let mut memory = MasterMemory::new(Arc::new(program.compute_keys().clone()), true);
        let err = program.setup(&mut memory).unwrap_err();
        assert!(err.to_string().contains("not a vertex"));
    }

    fn counts(entries: &[(u64, i64)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(id, n)| (Value::Vertex(VertexId(*id)), Value::Int(*n)))
                .collect(),
        )
    }

    fn setup_with(seed: Traverser) -> Result<TraverserSet, BspError> {
        let (_, pipeline) = catalog();
        let mut program = TraversalProgram::new(pipeline, Seed::Traversers)
            .unwrap()
            .with_side_effects(seed_bag(vec![seed]))
            .unwrap();
        let mut memory = MasterMemory::new(Arc::new(program.compute_keys().clone()), true);
        program.setup(&mut memory)?;
        Ok(memory
            .get(ACTIVE_TRAVERSERS)?
            .and_then(ComputeValue::as_traversers)
            .cloned()
            .unwrap_or_default())
    }

    #[test]
    fn test_setup_splits_vertex_counts() {
        let seed = Traverser::new(counts(&[(3, 3), (5, 1)]), StepId::resumable(), SideEffectsId(0));
        let active = setup_with(seed).unwrap();

        assert_eq!(active.len(), 2);
        assert_eq!(active.bulk(), 4);
        let lop = Value::Vertex(VertexId(3));
        let ripple = Value::Vertex(VertexId(5));
        assert_eq!(active.with_value(&lop).map(Traverser::bulk).sum::<u64>(), 3);
        assert_eq!(active.with_value(&ripple).map(Traverser::bulk).sum::<u64>(), 1);
        assert!(active.iter().all(|t| t.step_id() == &StepId::new("0")));
    }

    #[test]
    fn test_seed_bulk_scales_vertex_counts() {
        let seed = Traverser::new(counts(&[(3, 3), (5, 1)]), StepId::resumable(), SideEffectsId(0))
            .with_bulk(2)
            .unwrap();
        assert_eq!(setup_with(seed).unwrap().bulk(), 8);
    }

    #[test]
    fn test_setup_rejects_bad_vertex_counts() {
        let zero = Traverser::new(counts(&[(3, 0)]), StepId::resumable(), SideEffectsId(0));
        assert!(matches!(setup_with(zero), Err(BspError::InvalidBulk(0))));

        let negative = Traverser::new(counts(&[(3, -2)]), StepId::resumable(), SideEffectsId(0));
        assert!(matches!(setup_with(negative), Err(BspError::InvalidBulk(_))));

        let mut by_name = std::collections::BTreeMap::new();
        by_name.insert(Value::from("lop"), Value::Int(3));
        let named = Traverser::new(Value::Map(by_name), StepId::resumable(), SideEffectsId(0));
        assert!(matches!(setup_with(named), Err(BspError::Configuration(_))));
    }

    #[test]
    fn test_initial_iteration_never_terminates() {
        let (_, pipeline) = catalog();
        let mut program = TraversalProgram::new(pipeline, Seed::AllVertices).unwrap();
        let mut memory = MasterMemory::new(Arc::new(program.compute_keys().clone()), true);
        program.setup(&mut memory).unwrap();

        assert!(!program.terminate(&mut memory).unwrap());
        memory.increment_iteration();
        assert!(program.terminate(&mut memory).unwrap());
    }

    #[test]
    fn test_seed_mode_strings() {
        assert_eq!("traversers".parse::<Seed>().unwrap(), Seed::Traversers);
        assert_eq!(Seed::AllVertices.to_string(), "all_vertices");
        assert!("sometimes".parse::<Seed>().is_err());
    }
}
