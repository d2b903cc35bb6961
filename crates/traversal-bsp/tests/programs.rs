//! Custom vertex programs driven by the GraphComputer

mod common;

use common::*;
use traversal_bsp::{
    BspError, ComputeKeys, ComputeValue, ComputeVertex, Memory, MemoryComputeKey, MessageScope,
    Messenger, Operator, PipelineCatalog, ProgramConfiguration, VertexProgram,
};

/// Sends into an empty scope every superstep and counts what arrives
#[derive(Debug, Clone)]
struct Silent {
    keys: ComputeKeys,
    eager: bool,
}

impl Default for Silent {
    fn default() -> Self {
        let keys = ComputeKeys::new()
            .with_memory_key(MemoryComputeKey::new("received", Operator::Sum, true, false).unwrap())
            .unwrap()
            .with_memory_key(MemoryComputeKey::new("pings", Operator::Sum, true, true).unwrap())
            .unwrap()
            .with_memory_key(
                MemoryComputeKey::new("observed", Operator::Max, false, false).unwrap(),
            )
            .unwrap();
        Self { keys, eager: false }
    }
}

impl VertexProgram for Silent {
    type Message = ();

    fn load_state(
        &mut self,
        configuration: &ProgramConfiguration,
        _catalog: &PipelineCatalog,
    ) -> Result<(), BspError> {
        self.eager = configuration.parse::<bool>("eager")?.unwrap_or(false);
        Ok(())
    }

    fn store_state(&self, configuration: &mut ProgramConfiguration) -> Result<(), BspError> {
        configuration.set("eager", self.eager.to_string());
        Ok(())
    }

    fn compute_keys(&self) -> &ComputeKeys {
        &self.keys
    }

    fn setup(&mut self, memory: &mut dyn Memory) -> Result<(), BspError> {
        memory.set("received", 0i64.into())
    }

    fn execute(
        &mut self,
        _vertex: &mut ComputeVertex<'_>,
        messenger: &mut dyn Messenger<()>,
        memory: &mut dyn Memory,
    ) -> Result<(), BspError> {
        let received = messenger.receive_messages().len() as i64;
        memory.add("received", received.into())?;
        // Two contributions to a transient key in one superstep
        memory.add("pings", 1i64.into())?;
        memory.add("pings", 1i64.into())?;
        messenger.send_message(&MessageScope::none(), ());
        Ok(())
    }

    fn terminate(&mut self, memory: &mut dyn Memory) -> Result<bool, BspError> {
        let pings = memory.get("pings")?.cloned();
        if let Some(pings) = pings {
            memory.set("observed", pings)?;
        }
        Ok(self.eager || memory.iteration() >= 1)
    }
}

#[tokio::test]
async fn test_empty_scope_delivers_nothing_and_run_terminates() {
    let result = computer(PipelineCatalog::new())
        .submit(modern(), Silent::default())
        .await
        .unwrap();

    assert_eq!(result.supersteps, 2);
    assert_eq!(result.memory.get("received"), Some(&ComputeValue::from(0i64)));
}

#[tokio::test]
async fn test_transient_contributions_fold_with_operator() {
    let result = computer(PipelineCatalog::new())
        .submit(modern(), Silent::default())
        .await
        .unwrap();

    assert_eq!(result.memory.get("observed"), Some(&ComputeValue::from(12i64)));
    assert!(result.memory.get("pings").is_none());
}

#[tokio::test]
async fn test_initial_iteration_cannot_terminate() {
    let program = Silent {
        eager: true,
        ..Silent::default()
    };
    let result = computer(PipelineCatalog::new())
        .submit(modern(), program)
        .await
        .unwrap();

    assert_eq!(result.supersteps, 2);
}

#[tokio::test]
async fn test_workers_cannot_read_master_only_keys() {
    #[derive(Debug, Clone, Default)]
    struct Peek(Silent);

    impl VertexProgram for Peek {
        type Message = ();

        fn load_state(
            &mut self,
            configuration: &ProgramConfiguration,
            catalog: &PipelineCatalog,
        ) -> Result<(), BspError> {
            self.0.load_state(configuration, catalog)
        }

        fn store_state(&self, configuration: &mut ProgramConfiguration) -> Result<(), BspError> {
            self.0.store_state(configuration)
        }

        fn compute_keys(&self) -> &ComputeKeys {
            self.0.compute_keys()
        }

        fn setup(&mut self, memory: &mut dyn Memory) -> Result<(), BspError> {
            self.0.setup(memory)
        }

        fn execute(
            &mut self,
            _vertex: &mut ComputeVertex<'_>,
            _messenger: &mut dyn Messenger<()>,
            memory: &mut dyn Memory,
        ) -> Result<(), BspError> {
            memory.get("observed").map(|_| ())
        }

        fn terminate(&mut self, memory: &mut dyn Memory) -> Result<bool, BspError> {
            self.0.terminate(memory)
        }
    }

    let err = computer(PipelineCatalog::new())
        .submit(modern(), Peek::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BspError::VertexExecution { superstep: 0, .. }));
    assert!(err.to_string().contains("not broadcast"));
}
