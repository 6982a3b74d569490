use crate::{EdgeConfig, FlowError, NodeConfig};
use std::collections::{BTreeMap, VecDeque};

/// Nodes and edges with forward and reverse adjacency.
///
/// Node iteration follows declaration order; scheduling ties are broken by it.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowGraph {
    nodes: Vec<NodeConfig>,
    index: BTreeMap<String, usize>,
    edges: Vec<EdgeConfig>,
    forward: Vec<Vec<EdgeConfig>>,
    reverse: Vec<Vec<EdgeConfig>>,
}

impl FlowGraph {
    pub fn new(nodes: Vec<NodeConfig>, edges: Vec<EdgeConfig>) -> Result<Self, FlowError> {
        let mut index = BTreeMap::new();
        let mut problems = Vec::new();
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), position).is_some() {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
        }

        let mut forward = vec![Vec::new(); nodes.len()];
        let mut reverse = vec![Vec::new(); nodes.len()];
        for edge in &edges {
            match (index.get(&edge.source), index.get(&edge.target)) {
                (Some(&source), Some(&target)) => {
                    forward[source].push(edge.clone());
                    reverse[target].push(edge.clone());
                }
                (None, _) => problems.push(format!("edge source '{}' not found in nodes", edge.source)),
                (_, None) => problems.push(format!("edge target '{}' not found in nodes", edge.target)),
            }
        }

        if !problems.is_empty() {
            return Err(FlowError::configuration("invalid graph", problems));
        }

        Ok(Self {
            nodes,
            index,
            edges,
            forward,
            reverse,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.index.get(node_id).map(|&position| &self.nodes[position])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.id.as_str())
    }

    pub fn edges(&self) -> &[EdgeConfig] {
        &self.edges
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[EdgeConfig] {
        self.index
            .get(node_id)
            .map(|&position| self.forward[position].as_slice())
            .unwrap_or_default()
    }

    pub fn incoming_edges(&self, node_id: &str) -> &[EdgeConfig] {
        self.index
            .get(node_id)
            .map(|&position| self.reverse[position].as_slice())
            .unwrap_or_default()
    }

    /// Nodes without incoming edges.
    pub fn roots(&self) -> Vec<&str> {
        self.node_ids()
            .filter(|node_id| self.incoming_edges(node_id).is_empty())
            .collect()
    }

    /// Kahn's algorithm. Fails when some nodes never reach in-degree zero.
    pub fn topological_order(&self) -> Result<Vec<&str>, FlowError> {
        let mut in_degree: Vec<usize> = self.reverse.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| position)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(position) = queue.pop_front() {
            order.push(self.nodes[position].id.as_str());
            for edge in &self.forward[position] {
                let target = self.index[&edge.target];
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    queue.push_back(target);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(FlowError::configuration(
                "Cycle detected in graph flow",
                vec![format!(
                    "Processed {} of {} nodes. Remaining nodes are part of a cycle.",
                    order.len(),
                    self.nodes.len()
                )],
            ));
        }
        Ok(order)
    }
}
