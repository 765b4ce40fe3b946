// Execution Plan
// Kahn-style ordering of a validated graph into parallel groups

use crate::error::{EngineError, EngineResult};
use crate::graph::PipelineGraph;

use std::collections::HashMap;

/// Topological order split into waves of mutually independent nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    groups: Vec<Vec<String>>,
    group_index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Order the graph into the fewest possible waves.
    ///
    /// Each wave holds every node whose dependencies all sit in earlier
    /// waves, sorted by id. A graph that still has nodes left when no wave
    /// can be extracted contains a cycle the validator should have rejected.
    pub fn order(graph: &PipelineGraph) -> EngineResult<Self> {
        let mut in_degree: Vec<usize> = (0..graph.len())
            .map(|idx| graph.predecessors(idx).len())
            .collect();

        let mut current: Vec<usize> = graph
            .sorted_indices()
            .into_iter()
            .filter(|idx| in_degree[*idx] == 0)
            .collect();

        let mut groups = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &idx in &current {
                for &succ in graph.successors(idx) {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }

            placed += current.len();
            let mut ids: Vec<String> = current.iter().map(|i| graph.id_of(*i).to_string()).collect();
            ids.sort();
            groups.push(ids);

            next.sort_by(|a, b| graph.id_of(*a).cmp(graph.id_of(*b)));
            current = next;
        }

        if placed != graph.len() {
            let mut stuck: Vec<&str> = (0..graph.len())
                .filter(|idx| in_degree[*idx] > 0)
                .map(|idx| graph.id_of(idx))
                .collect();
            stuck.sort();
            return Err(EngineError::Internal(format!(
                "no schedulable nodes remain among: {}",
                stuck.join(", ")
            )));
        }

        let group_index = groups
            .iter()
            .enumerate()
            .flat_map(|(g, ids)| ids.iter().map(move |id| (id.clone(), g)))
            .collect();

        tracing::debug!(groups = groups.len(), nodes = placed, "computed execution plan");

        Ok(Self {
            groups,
            group_index,
        })
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Wave a node belongs to
    pub fn group_of(&self, id: &str) -> Option<usize> {
        self.group_index.get(id).copied()
    }

    /// Number of waves
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.group_index.len()
    }

    /// Flattened topological order
    pub fn topological(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.iter().map(String::as_str))
            .collect()
    }
}
