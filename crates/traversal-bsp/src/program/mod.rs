//! Vertex programs
//!
//! A [`VertexProgram`] is the capability the runtime drives through the
//! superstep loop. The runtime keeps one master instance for `setup` and
//! `terminate` and hands every worker its own clone for `execute`, so a
//! program never shares mutable state between vertices except through
//! [`Memory`] and the [`Messenger`].
//!
//! - [`lifecycle::ProgramLifecycle`]: the legal order of hook calls
//! - [`traversal::TraversalProgram`]: runs a pipeline across the graph

pub mod lifecycle;
pub mod traversal;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::config::ProgramConfiguration;
use crate::error::BspError;
use crate::graph::ComputeVertex;
use crate::keys::ComputeKeys;
use crate::memory::Memory;
use crate::message::Messenger;
use crate::pipeline::PipelineCatalog;

pub use lifecycle::{ProgramLifecycle, ProgramPhase};
pub use traversal::{Seed, TraversalProgram, VOTE_TO_HALT};

/// A vertex-centric computation run in supersteps
pub trait VertexProgram: Clone + Send + Sync + 'static {
    /// Payload carried between vertices
    ///
    /// Serializable so messages in flight can be checkpointed.
    type Message: Clone + Send + Sync + Debug + Serialize + DeserializeOwned + 'static;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Populate this instance from a stored configuration
    ///
    /// Declares the compute keys for the whole run.
    fn load_state(
        &mut self,
        configuration: &ProgramConfiguration,
        catalog: &PipelineCatalog,
    ) -> Result<(), BspError>;

    /// Write everything `load_state` needs to rebuild an equivalent program
    fn store_state(&self, configuration: &mut ProgramConfiguration) -> Result<(), BspError>;

    fn compute_keys(&self) -> &ComputeKeys;

    /// Seed memory before the first superstep; called once on the master
    fn setup(&mut self, memory: &mut dyn Memory) -> Result<(), BspError>;

    /// Called on each worker before it executes its vertices
    fn worker_iteration_start(&mut self, _memory: &mut dyn Memory) -> Result<(), BspError> {
        Ok(())
    }

    /// Run one vertex for the current superstep
    fn execute(
        &mut self,
        vertex: &mut ComputeVertex<'_>,
        messenger: &mut dyn Messenger<Self::Message>,
        memory: &mut dyn Memory,
    ) -> Result<(), BspError>;

    /// Called on each worker after it executed its vertices
    fn worker_iteration_end(&mut self, _memory: &mut dyn Memory) -> Result<(), BspError> {
        Ok(())
    }

    /// Decide on the master, after the barrier, whether the run is done
    ///
    /// Memory already holds the merged contributions of the superstep that
    /// just finished. Returning true in the initial iteration has no effect.
    fn terminate(&mut self, memory: &mut dyn Memory) -> Result<bool, BspError>;
}
