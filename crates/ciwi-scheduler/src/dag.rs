//! Dependency graphs over named nodes.
//!
//! The same graph shape describes three relations: `needs` between the jobs
//! of a pipeline, `depends_on` between the pipelines of a project, and the
//! derived dependencies between the members of a chain.

use ciwi_core::Error;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("dependency cycle detected involving {0:?}")]
    CycleDetected(String),
    #[error("{node:?} depends on unknown {dependency:?}")]
    UnknownDependency { node: String, dependency: String },
    #[error("duplicate node {0:?}")]
    DuplicateNode(String),
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        Error::invalid(err.to_string())
    }
}

/// Directed acyclic graph; an edge `a -> b` means `b` waits for `a`.
#[derive(Debug)]
pub struct DependencyDag {
    graph: DiGraph<String, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl DependencyDag {
    /// Nodes without dependencies, in insertion order.
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect()
    }

    /// Nodes that directly wait for `name`.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Nodes `name` directly waits for.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.name_to_index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<(NodeIndex, &str)> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| (n, self.graph[n].as_str()))
            .collect();
        out.sort_by_key(|(n, _)| n.index());
        out.dedup_by_key(|(n, _)| *n);
        out.into_iter().map(|(_, name)| name).collect()
    }

    pub fn topological_order(&self) -> Result<Vec<&str>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| indices.iter().map(|&idx| self.graph[idx].as_str()).collect())
            .map_err(|cycle| DagError::CycleDetected(self.graph[cycle.node_id()].clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// True once every predecessor of `name` is in `completed`.
    pub fn is_ready(&self, name: &str, completed: &[String]) -> bool {
        self.predecessors(name)
            .iter()
            .all(|pred| completed.iter().any(|c| c == pred))
    }
}

/// Builder for dependency graphs.
#[derive(Debug, Default)]
pub struct DagBuilder {
    nodes: Vec<(String, Vec<String>)>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the names it depends on.
    pub fn node<I, S>(mut self, name: impl Into<String>, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes
            .push((name.into(), depends_on.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> Result<DependencyDag, DagError> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for (name, _) in &self.nodes {
            if name_to_index.contains_key(name) {
                return Err(DagError::DuplicateNode(name.clone()));
            }
            let idx = graph.add_node(name.clone());
            name_to_index.insert(name.clone(), idx);
        }

        for (name, deps) in &self.nodes {
            let node_idx = name_to_index[name];
            for dep in deps {
                let dep_idx =
                    name_to_index
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            node: name.clone(),
                            dependency: dep.clone(),
                        })?;
                graph.update_edge(*dep_idx, node_idx, ());
            }
        }

        let dag = DependencyDag {
            graph,
            name_to_index,
        };
        dag.topological_order()?;
        Ok(dag)
    }
}
