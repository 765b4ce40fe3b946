// Pipeline Graph
// Index-based adjacency over the nodes and edges of a pipeline document

use crate::parser::models::{Node, Pipeline};

use std::collections::{HashMap, HashSet};

/// Which end of an edge could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEnd {
    Source,
    Target,
}

impl EdgeEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeEnd::Source => "source",
            EdgeEnd::Target => "target",
        }
    }
}

/// An edge endpoint naming a node that does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingEdge {
    /// Position of the edge in the document
    pub position: usize,
    pub end: EdgeEnd,
    pub missing: String,
}

/// A node id declared more than once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateNode {
    pub id: String,
    /// Position of the repeated declaration in the document
    pub position: usize,
}

/// Immutable dependency graph of a pipeline.
///
/// Only the first declaration of a node id takes part in the graph; repeats
/// and edges with unknown endpoints are recorded for the validator.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<Node>,
    indices: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    edge_count: usize,
    dangling: Vec<DanglingEdge>,
    duplicates: Vec<DuplicateNode>,
}

impl PipelineGraph {
    pub fn new(pipeline: &Pipeline) -> Self {
        let mut nodes = Vec::with_capacity(pipeline.nodes.len());
        let mut indices = HashMap::new();
        let mut duplicates = Vec::new();

        for (position, node) in pipeline.nodes.iter().enumerate() {
            if indices.contains_key(&node.id) {
                duplicates.push(DuplicateNode {
                    id: node.id.clone(),
                    position,
                });
                continue;
            }
            indices.insert(node.id.clone(), nodes.len());
            nodes.push(node.clone());
        }

        let mut successors = vec![Vec::new(); nodes.len()];
        let mut predecessors = vec![Vec::new(); nodes.len()];
        let mut dangling = Vec::new();
        let mut seen = HashSet::new();

        for (position, edge) in pipeline.edges.iter().enumerate() {
            let source = indices.get(&edge.source).copied();
            let target = indices.get(&edge.target).copied();

            if source.is_none() {
                dangling.push(DanglingEdge {
                    position,
                    end: EdgeEnd::Source,
                    missing: edge.source.clone(),
                });
            }
            if target.is_none() {
                dangling.push(DanglingEdge {
                    position,
                    end: EdgeEnd::Target,
                    missing: edge.target.clone(),
                });
            }

            if let (Some(s), Some(t)) = (source, target) {
                if seen.insert((s, t)) {
                    successors[s].push(t);
                    predecessors[t].push(s);
                }
            }
        }

        for list in successors.iter_mut().chain(predecessors.iter_mut()) {
            list.sort_by(|a, b| nodes[*a].id.cmp(&nodes[*b].id));
        }

        Self {
            edge_count: seen.len(),
            nodes,
            indices,
            successors,
            predecessors,
            dangling,
            duplicates,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct resolvable edges
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    pub fn node_at(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.indices.get(id).copied()
    }

    pub fn id_of(&self, index: usize) -> &str {
        &self.nodes[index].id
    }

    /// Node indices ordered by id
    pub fn sorted_indices(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| self.nodes[*a].id.cmp(&self.nodes[*b].id));
        order
    }

    /// Direct dependents, ordered by id
    pub fn successors(&self, index: usize) -> &[usize] {
        &self.successors[index]
    }

    /// Direct dependencies, ordered by id
    pub fn predecessors(&self, index: usize) -> &[usize] {
        &self.predecessors[index]
    }

    /// Ids of the direct dependencies of a node
    pub fn upstream_ids(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|idx| {
                self.predecessors[idx]
                    .iter()
                    .map(|p| self.id_of(*p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes without incoming edges
    pub fn roots(&self) -> Vec<usize> {
        self.sorted_indices()
            .into_iter()
            .filter(|idx| self.predecessors[*idx].is_empty())
            .collect()
    }

    /// Nodes without outgoing edges
    pub fn leaves(&self) -> Vec<usize> {
        self.sorted_indices()
            .into_iter()
            .filter(|idx| self.successors[*idx].is_empty())
            .collect()
    }

    /// Nodes with no edges at all
    pub fn isolated(&self) -> Vec<usize> {
        self.sorted_indices()
            .into_iter()
            .filter(|idx| self.predecessors[*idx].is_empty() && self.successors[*idx].is_empty())
            .collect()
    }

    /// Transitive dependencies of a node, ordered by id
    pub fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.predecessors[index].clone();

        while let Some(current) = stack.pop() {
            if visited[current] {
                continue;
            }
            visited[current] = true;
            stack.extend(self.predecessors[current].iter().copied());
        }

        let mut ancestors: Vec<usize> = (0..self.nodes.len()).filter(|i| visited[*i]).collect();
        ancestors.sort_by(|a, b| self.nodes[*a].id.cmp(&self.nodes[*b].id));
        ancestors
    }

    pub fn is_ancestor(&self, candidate: usize, of: usize) -> bool {
        self.ancestors(of).contains(&candidate)
    }

    pub fn dangling_edges(&self) -> &[DanglingEdge] {
        &self.dangling
    }

    pub fn duplicate_nodes(&self) -> &[DuplicateNode] {
        &self.duplicates
    }
}
