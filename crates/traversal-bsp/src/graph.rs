//! In-memory graph used by the runtime
//!
//! The topology (labels and edges) is immutable for a run and shared by
//! every worker. Vertex properties are owned per vertex and move into the
//! worker that executes the vertex.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::BspError;
use crate::keys::ComputeKeys;
use crate::value::{ComputeValue, Value, VertexId};

/// Edge direction relative to a vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Out,
    In,
    Both,
}

#[derive(Debug, Clone)]
struct Edge {
    label: String,
    other: VertexId,
}

/// Vertex labels and labelled edges
#[derive(Debug, Default)]
pub struct Topology {
    labels: BTreeMap<VertexId, String>,
    out_edges: HashMap<VertexId, Vec<Edge>>,
    in_edges: HashMap<VertexId, Vec<Edge>>,
}

impl Topology {
    pub fn contains(&self, id: VertexId) -> bool {
        self.labels.contains_key(&id)
    }

    pub fn label(&self, id: VertexId) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.labels.keys().copied()
    }

    /// Vertices adjacent to `id` in `direction`
    ///
    /// An empty `labels` slice matches every edge. A vertex reachable over
    /// several edges appears once per edge.
    pub fn adjacent(&self, id: VertexId, direction: Direction, labels: &[String]) -> Vec<VertexId> {
        let matches = |e: &Edge| labels.is_empty() || labels.iter().any(|l| *l == e.label);
        let side = |edges: &HashMap<VertexId, Vec<Edge>>| -> Vec<VertexId> {
            edges
                .get(&id)
                .map(|es| es.iter().filter(|e| matches(e)).map(|e| e.other).collect())
                .unwrap_or_default()
        };
        match direction {
            Direction::Out => side(&self.out_edges),
            Direction::In => side(&self.in_edges),
            Direction::Both => {
                let mut both = side(&self.out_edges);
                both.extend(side(&self.in_edges));
                both
            }
        }
    }
}

/// Per-vertex state owned by whichever worker runs the vertex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexData {
    id: VertexId,
    label: String,
    properties: BTreeMap<String, ComputeValue>,
}

impl VertexData {
    pub fn new(id: VertexId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn property(&self, name: &str) -> Option<&ComputeValue> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &ComputeValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A graph ready to be handed to a computer
#[derive(Debug, Clone)]
pub struct Graph {
    topology: Arc<Topology>,
    vertices: BTreeMap<VertexId, VertexData>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn vertex(&self, id: VertexId) -> Option<&VertexData> {
        self.vertices.get(&id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &VertexData> {
        self.vertices.values()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Remove every transient vertex key from every vertex
    pub fn strip_transient(&mut self, keys: &ComputeKeys) {
        let transient: Vec<&str> = keys
            .vertex_keys()
            .filter(|k| k.is_transient())
            .map(|k| k.name())
            .collect();
        if transient.is_empty() {
            return;
        }
        for vertex in self.vertices.values_mut() {
            for name in &transient {
                vertex.properties.remove(*name);
            }
        }
    }

    pub(crate) fn into_parts(self) -> (Arc<Topology>, Vec<VertexData>) {
        (self.topology, self.vertices.into_values().collect())
    }

    pub(crate) fn from_parts(topology: Arc<Topology>, vertices: Vec<VertexData>) -> Self {
        Self {
            topology,
            vertices: vertices.into_iter().map(|v| (v.id, v)).collect(),
        }
    }
}

/// Split `vertices` into at most `workers` contiguous, nearly equal chunks
pub(crate) fn partition(vertices: Vec<VertexData>, workers: usize) -> Vec<Vec<VertexData>> {
    let workers = workers.max(1).min(vertices.len().max(1));
    let chunk = vertices.len().div_ceil(workers).max(1);
    let mut parts = Vec::with_capacity(workers);
    let mut rest = vertices.into_iter().peekable();
    while rest.peek().is_some() {
        parts.push(rest.by_ref().take(chunk).collect());
    }
    parts
}

/// Collects vertices, properties and edges, validating on [`build`](Self::build)
#[derive(Debug, Default)]
pub struct GraphBuilder {
    vertices: BTreeMap<VertexId, VertexData>,
    edges: Vec<(VertexId, String, VertexId)>,
    error: Option<String>,
}

impl GraphBuilder {
    pub fn vertex(mut self, id: impl Into<VertexId>, label: impl Into<String>) -> Self {
        let id = id.into();
        if self.vertices.contains_key(&id) {
            self.fail(format!("vertex {id} added twice"));
        } else {
            self.vertices.insert(id, VertexData::new(id, label));
        }
        self
    }

    pub fn property(
        mut self,
        id: impl Into<VertexId>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let id = id.into();
        match self.vertices.get_mut(&id) {
            Some(vertex) => {
                vertex
                    .properties
                    .insert(name.into(), ComputeValue::Value(value.into()));
            }
            None => self.fail(format!("property on unknown vertex {id}")),
        }
        self
    }

    pub fn edge(
        mut self,
        from: impl Into<VertexId>,
        label: impl Into<String>,
        to: impl Into<VertexId>,
    ) -> Self {
        self.edges.push((from.into(), label.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<Graph, BspError> {
        if let Some(message) = self.error {
            return Err(BspError::config(message));
        }

        let mut topology = Topology {
            labels: self
                .vertices
                .values()
                .map(|v| (v.id, v.label.clone()))
                .collect(),
            ..Topology::default()
        };
        for (from, label, to) in self.edges {
            if !topology.contains(from) || !topology.contains(to) {
                return Err(BspError::config(format!(
                    "edge {from}-{label}->{to} references an unknown vertex"
                )));
            }
            topology.out_edges.entry(from).or_default().push(Edge {
                label: label.clone(),
                other: to,
            });
            topology
                .in_edges
                .entry(to)
                .or_default()
                .push(Edge { label, other: from });
        }

        Ok(Graph {
            topology: Arc::new(topology),
            vertices: self.vertices,
        })
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

/// The vertex handed to `execute`
///
/// Any property can be read. Only declared vertex compute keys can be
/// written, so a program cannot clobber the graph's own data.
pub struct ComputeVertex<'a> {
    data: &'a mut VertexData,
    keys: &'a ComputeKeys,
    topology: &'a Topology,
}

impl<'a> ComputeVertex<'a> {
    pub fn new(data: &'a mut VertexData, keys: &'a ComputeKeys, topology: &'a Topology) -> Self {
        Self {
            data,
            keys,
            topology,
        }
    }

    pub fn id(&self) -> VertexId {
        self.data.id
    }

    pub fn label(&self) -> &str {
        &self.data.label
    }

    pub fn property(&self, name: &str) -> Option<&ComputeValue> {
        self.data.properties.get(name)
    }

    /// Plain value of a property, if it holds one
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.property(name).and_then(ComputeValue::as_value)
    }

    pub fn out_vertices(&self, labels: &[String]) -> Vec<VertexId> {
        self.topology.adjacent(self.data.id, Direction::Out, labels)
    }

    pub fn in_vertices(&self, labels: &[String]) -> Vec<VertexId> {
        self.topology.adjacent(self.data.id, Direction::In, labels)
    }

    pub fn topology(&self) -> &Topology {
        self.topology
    }

    pub fn set_property(
        &mut self,
        name: &str,
        value: impl Into<ComputeValue>,
    ) -> Result<(), BspError> {
        self.keys.vertex_key(name)?;
        self.data.properties.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn remove_property(&mut self, name: &str) -> Result<Option<ComputeValue>, BspError> {
        self.keys.vertex_key(name)?;
        Ok(self.data.properties.remove(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::VertexComputeKey;

    fn graph() -> Graph {
        Graph::builder()
            .vertex(1, "person")
            .property(1, "name", "marko")
            .vertex(2, "person")
            .vertex(3, "software")
            .edge(1, "knows", 2)
            .edge(1, "created", 3)
            .edge(2, "created", 3)
            .build()
            .unwrap()
    }

    #[test]
    fn test_adjacency_by_direction_and_label() {
        let graph = graph();
        let topology = graph.topology();

        assert_eq!(topology.adjacent(VertexId(1), Direction::Out, &[]).len(), 2);
        assert_eq!(
            topology.adjacent(VertexId(1), Direction::Out, &["knows".to_string()]),
            vec![VertexId(2)]
        );
        assert_eq!(
            topology.adjacent(VertexId(3), Direction::In, &[]),
            vec![VertexId(1), VertexId(2)]
        );
        assert_eq!(topology.adjacent(VertexId(2), Direction::Both, &[]).len(), 2);
    }

    #[test]
    fn test_builder_rejects_dangling_edges() {
        let err = Graph::builder()
            .vertex(1, "person")
            .edge(1, "knows", 9)
            .build()
            .unwrap_err();
        assert!(matches!(err, BspError::Configuration(_)));

        let err = Graph::builder().vertex(1, "a").vertex(1, "b").build().unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_compute_vertex_writes_only_declared_keys() {
        let mut graph = graph();
        let keys = ComputeKeys::new()
            .with_vertex_key(VertexComputeKey::new("rank", true))
            .unwrap();
        let topology = graph.topology.clone();
        let data = graph.vertices.get_mut(&VertexId(1)).unwrap();
        let mut vertex = ComputeVertex::new(data, &keys, &topology);

        assert_eq!(vertex.value("name"), Some(&Value::from("marko")));
        vertex.set_property("rank", 7i64).unwrap();
        assert!(matches!(
            vertex.set_property("name", "other"),
            Err(BspError::UnknownKey { .. })
        ));

        graph.strip_transient(&keys);
        let v1 = graph.vertex(VertexId(1)).unwrap();
        assert!(v1.property("rank").is_none());
        assert!(v1.property("name").is_some());
    }

    #[test]
    fn test_partition_covers_every_vertex() {
        let (_, vertices) = graph().into_parts();
        let parts = partition(vertices.clone(), 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 3);

        assert_eq!(partition(vertices.clone(), 16).len(), 3);
        assert_eq!(partition(Vec::new(), 4).len(), 0);
    }
}
