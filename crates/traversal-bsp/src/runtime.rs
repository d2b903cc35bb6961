//! GraphComputer: the superstep driver
//!
//! Per superstep the driver partitions the vertices over worker tasks, runs
//! every vertex once against a shared memory snapshot, then waits for all
//! workers before merging memory and routing messages. Nothing a worker
//! does becomes visible to another worker before that barrier.

use futures::future::try_join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::{ComputerConfig, ProgramConfiguration};
use crate::error::BspError;
use crate::graph::{partition, ComputeVertex, Graph, Topology, VertexData};
use crate::keys::ComputeKeys;
use crate::memory::{MasterMemory, Memory, MemoryContributions, MemorySnapshot, WorkerMemory};
use crate::message::{Outbox, WorkerMessenger};
use crate::pipeline::PipelineCatalog;
use crate::program::{ProgramLifecycle, VertexProgram};
use crate::value::VertexId;

type Inboxes<M> = HashMap<VertexId, Vec<M>>;

/// Output of a finished run
#[derive(Debug)]
pub struct ComputerResult<P> {
    /// Graph with final vertex compute keys; transient keys removed
    pub graph: Graph,
    /// Final memory; transient keys removed
    pub memory: MemorySnapshot,
    /// Number of supersteps executed
    pub supersteps: usize,
    pub run_id: Uuid,
    /// The master program instance after `terminate` returned true
    pub program: P,
}

/// Runs vertex programs over in-memory graphs
pub struct GraphComputer {
    config: ComputerConfig,
    catalog: Arc<PipelineCatalog>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl GraphComputer {
    pub fn new(config: ComputerConfig) -> Result<Self, BspError> {
        config.validate()?;
        Ok(Self {
            config,
            catalog: Arc::new(PipelineCatalog::new()),
            checkpointer: None,
        })
    }

    /// Pipelines that programs resolve while loading their state
    pub fn with_catalog(mut self, catalog: PipelineCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn config(&self) -> &ComputerConfig {
        &self.config
    }

    /// Run `program` over `graph` until it terminates
    ///
    /// The program is stored and loaded into a fresh instance first, so a
    /// program that does not round-trip its state fails here rather than
    /// in a resumed run.
    pub async fn submit<P>(&self, graph: Graph, program: P) -> Result<ComputerResult<P>, BspError>
    where
        P: VertexProgram + Default,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("bsp_run", %run_id, program = program.name());
        let mut lifecycle = ProgramLifecycle::new();

        let result = self
            .run(run_id, graph, program, &mut lifecycle)
            .instrument(span.clone())
            .await;

        if let Err(e) = &result {
            lifecycle.failed();
            span.in_scope(|| {
                tracing::error!(
                    error = %e,
                    superstep = ?e.superstep(),
                    vertex = ?e.vertex_id(),
                    "run aborted"
                )
            });
        }
        result
    }

    async fn run<P>(
        &self,
        run_id: Uuid,
        graph: Graph,
        program: P,
        lifecycle: &mut ProgramLifecycle,
    ) -> Result<ComputerResult<P>, BspError>
    where
        P: VertexProgram + Default,
    {
        let mut configuration = ProgramConfiguration::new();
        program.store_state(&mut configuration)?;
        let mut master = P::default();
        master.load_state(&configuration, &self.catalog)?;
        lifecycle.loaded()?;

        let keys = Arc::new(master.compute_keys().clone());
        let mut memory = MasterMemory::new(keys.clone(), self.config.verify_merges);
        master.setup(&mut memory)?;
        lifecycle.setup_done()?;

        let (topology, mut vertices) = graph.into_parts();
        let mut inboxes: Inboxes<P::Message> = HashMap::new();
        tracing::info!(vertices = vertices.len(), workers = self.config.parallelism, "run started");

        loop {
            let superstep = memory.iteration();
            if superstep >= self.config.max_supersteps {
                return Err(BspError::MaxSuperstepsExceeded {
                    limit: self.config.max_supersteps,
                });
            }
            lifecycle.begin_iteration()?;
            let started = Instant::now();
            let vertex_count = vertices.len();

            let outputs = self
                .superstep(
                    superstep,
                    &master,
                    std::mem::take(&mut vertices),
                    &keys,
                    &topology,
                    memory.snapshot(),
                    std::mem::take(&mut inboxes),
                )
                .await?;

            let mut outbox = Outbox::new();
            let mut contributions = Vec::with_capacity(outputs.len());
            for output in outputs {
                vertices.extend(output.vertices);
                contributions.push(output.contributions);
                outbox.merge(output.outbox);
            }

            let merged = memory.barrier(&contributions)?;
            let (sent, dropped) = (outbox.sent(), outbox.dropped());
            inboxes = outbox.deliver();

            let wants_stop = master.terminate(&mut memory)?;
            let done = wants_stop && !memory.is_initial_iteration();

            let elapsed = started.elapsed();
            tracing::debug!(
                superstep,
                vertices = vertex_count,
                messages_sent = sent,
                messages_dropped = dropped,
                keys_merged = merged,
                elapsed_ms = elapsed.as_millis() as u64,
                "superstep complete"
            );
            if elapsed > self.config.slow_superstep_threshold {
                tracing::warn!(
                    superstep,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = self.config.slow_superstep_threshold.as_millis() as u64,
                    "slow superstep"
                );
            }

            self.checkpoint(run_id, superstep, &memory, &vertices, &inboxes)
                .await?;

            if done {
                lifecycle.terminated()?;
                break;
            }
            memory.increment_iteration();
        }

        let supersteps = memory.iteration() + 1;
        let mut graph = Graph::from_parts(topology, vertices);
        graph.strip_transient(&keys);
        tracing::info!(supersteps, "run terminated");

        Ok(ComputerResult {
            graph,
            memory: memory.into_result(),
            supersteps,
            run_id,
            program: master,
        })
    }

    /// Execute every vertex once; returns when all workers finished
    #[allow(clippy::too_many_arguments)]
    async fn superstep<P: VertexProgram>(
        &self,
        superstep: usize,
        master: &P,
        vertices: Vec<VertexData>,
        keys: &Arc<ComputeKeys>,
        topology: &Arc<Topology>,
        snapshot: Arc<MemorySnapshot>,
        inboxes: Inboxes<P::Message>,
    ) -> Result<Vec<WorkerOutput<P::Message>>, BspError> {
        let inboxes = Arc::new(inboxes);
        let workers = partition(vertices, self.config.parallelism)
            .into_iter()
            .enumerate()
            .map(|(worker, part)| {
                let task = WorkerTask {
                    superstep,
                    program: master.clone(),
                    vertices: part,
                    keys: keys.clone(),
                    topology: topology.clone(),
                    snapshot: snapshot.clone(),
                    inboxes: inboxes.clone(),
                };
                tokio::task::spawn_blocking(move || task.run()).map(move |joined| match joined {
                    Ok(output) => output,
                    Err(e) => Err(BspError::WorkerPanicked {
                        superstep,
                        worker,
                        message: e.to_string(),
                    }),
                })
            });

        try_join_all(workers).await
    }

    async fn checkpoint<M: serde::Serialize>(
        &self,
        run_id: Uuid,
        superstep: usize,
        memory: &MasterMemory,
        vertices: &[VertexData],
        inboxes: &Inboxes<M>,
    ) -> Result<(), BspError> {
        let (Some(checkpointer), Some(every)) =
            (self.checkpointer.as_ref(), self.config.checkpoint_interval)
        else {
            return Ok(());
        };
        if (superstep + 1) % every != 0 {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            run_id,
            superstep,
            memory: (*memory.snapshot()).clone(),
            vertices: vertices.to_vec(),
            inboxes: Checkpoint::encode_inboxes(inboxes)?,
            created_at: Utc::now(),
        };
        checkpointer.save(&checkpoint).await?;
        tracing::debug!(superstep, in_flight = inboxes.len(), "checkpoint saved");
        Ok(())
    }
}

struct WorkerOutput<M> {
    vertices: Vec<VertexData>,
    contributions: MemoryContributions,
    outbox: Outbox<M>,
}

/// Everything one worker owns for one superstep
struct WorkerTask<P: VertexProgram> {
    superstep: usize,
    program: P,
    vertices: Vec<VertexData>,
    keys: Arc<ComputeKeys>,
    topology: Arc<Topology>,
    snapshot: Arc<MemorySnapshot>,
    inboxes: Arc<Inboxes<P::Message>>,
}

impl<P: VertexProgram> WorkerTask<P> {
    fn run(mut self) -> Result<WorkerOutput<P::Message>, BspError> {
        let mut memory = WorkerMemory::new(self.keys.clone(), self.snapshot.clone());
        let mut outbox = Outbox::new();

        self.program.worker_iteration_start(&mut memory)?;
        for data in self.vertices.iter_mut() {
            let id = data.id();
            let inbox = self.inboxes.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let mut vertex = ComputeVertex::new(data, &self.keys, &self.topology);
            let mut messenger = WorkerMessenger::new(id, &self.topology, inbox, &mut outbox);
            self.program
                .execute(&mut vertex, &mut messenger, &mut memory)
                .map_err(|e| BspError::vertex_error(self.superstep, id, e))?;
        }
        self.program.worker_iteration_end(&mut memory)?;

        Ok(WorkerOutput {
            vertices: self.vertices,
            contributions: memory.into_contributions(),
            outbox,
        })
    }
}
