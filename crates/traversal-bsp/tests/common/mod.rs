//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Once;

use traversal_bsp::{ComputerConfig, Graph, GraphComputer, PipelineCatalog, VertexId};

pub const MARKO: VertexId = VertexId(1);
pub const VADAS: VertexId = VertexId(2);
pub const LOP: VertexId = VertexId(3);
pub const JOSH: VertexId = VertexId(4);
pub const RIPPLE: VertexId = VertexId(5);
pub const PETER: VertexId = VertexId(6);

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls the output
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The six-vertex "modern" graph
pub fn modern() -> Graph {
    Graph::builder()
        .vertex(MARKO, "person")
        .property(MARKO, "name", "marko")
        .property(MARKO, "age", 29i64)
        .vertex(VADAS, "person")
        .property(VADAS, "name", "vadas")
        .property(VADAS, "age", 27i64)
        .vertex(LOP, "software")
        .property(LOP, "name", "lop")
        .property(LOP, "lang", "java")
        .vertex(JOSH, "person")
        .property(JOSH, "name", "josh")
        .property(JOSH, "age", 32i64)
        .vertex(RIPPLE, "software")
        .property(RIPPLE, "name", "ripple")
        .property(RIPPLE, "lang", "java")
        .vertex(PETER, "person")
        .property(PETER, "name", "peter")
        .property(PETER, "age", 35i64)
        .edge(MARKO, "knows", VADAS)
        .edge(MARKO, "knows", JOSH)
        .edge(MARKO, "created", LOP)
        .edge(JOSH, "created", RIPPLE)
        .edge(JOSH, "created", LOP)
        .edge(PETER, "created", LOP)
        .build()
        .expect("modern graph")
}

pub fn computer(catalog: PipelineCatalog) -> GraphComputer {
    init_tracing();
    GraphComputer::new(ComputerConfig::default().with_parallelism(3))
        .expect("valid config")
        .with_catalog(catalog)
}
