//! Bulk-synchronous-parallel vertex programs
//!
//! A [`GraphComputer`] runs a [`VertexProgram`] over a [`Graph`] one superstep
//! at a time. Vertices talk through messages that arrive a superstep later and
//! through [`Memory`] keys merged by their [`Operator`] at the barrier.
//! [`TraversalProgram`] builds on this to evaluate a [`Pipeline`]: its
//! [`Traverser`]s carry a bulk count and hop between vertices as messages,
//! halting on the vertex where they finish.
//!
//! # Superstep
//!
//! ```text
//!  MasterMemory ── snapshot ──┬────────────┬────────────┐
//!                             ▼            ▼            ▼
//!  inboxes ──────────────▶ worker 0     worker 1 ... worker n   execute()
//!                             │            │            │
//!                  contributions + outbox per worker
//!                             └──────┬─────┴────────────┘
//!                                    ▼
//!                 barrier: fold memory adds, deliver outbox
//!                                    │
//!                  terminate()? ── no ──▶ next superstep
//!                                    │ yes
//!                                    ▼
//!                             ComputerResult
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graph;
pub mod keys;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod position;
pub mod program;
pub mod runtime;
pub mod side_effects;
pub mod traverser;
pub mod value;

// Re-exports
pub use checkpoint::{
    Checkpoint, Checkpointer, EncodedInboxes, FileCheckpointer, MemoryCheckpointer,
};
pub use config::{ComputerConfig, ProgramConfiguration};
pub use error::BspError;
pub use graph::{ComputeVertex, Direction, Graph, GraphBuilder, Topology, VertexData};
pub use keys::{
    ComputeKeys, MemoryComputeKey, Operator, VertexComputeKey, ACTIVE_TRAVERSERS,
    HALTED_TRAVERSERS,
};
pub use memory::{MasterMemory, Memory, MemorySnapshot, WorkerMemory};
pub use message::{MessageScope, Messenger};
pub use pipeline::{
    Emission, Pipeline, PipelineBuilder, PipelineCatalog, PipelineStep, StepContext, StepId,
    StepLogic,
};
pub use position::PositionIndex;
pub use program::{
    ProgramLifecycle, ProgramPhase, Seed, TraversalProgram, VertexProgram, VOTE_TO_HALT,
};
pub use runtime::{ComputerResult, GraphComputer};
pub use side_effects::{MemorySideEffects, SideEffectArena, SideEffects, SideEffectsId};
pub use traverser::{Path, Traverser, TraverserSet};
pub use value::{BulkSet, ComputeValue, Value, VertexId};
