use crate::FlowGraph;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Result of the one-time cycle analysis performed when a scheduler is built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleAnalysis {
    back_edges: BTreeSet<(String, String)>,
    back_edge_targets: BTreeSet<String>,
    cycle_nodes: BTreeSet<String>,
}

impl CycleAnalysis {
    pub fn analyze(graph: &FlowGraph) -> Self {
        let back_edges = detect_back_edges(graph);
        let back_edge_targets = back_edges
            .iter()
            .map(|(_, target)| target.clone())
            .collect();
        let cycle_nodes = collect_cycle_nodes(graph, &back_edges);
        Self {
            back_edges,
            back_edge_targets,
            cycle_nodes,
        }
    }

    pub fn has_cycles(&self) -> bool {
        !self.back_edges.is_empty()
    }

    pub fn back_edges(&self) -> &BTreeSet<(String, String)> {
        &self.back_edges
    }

    pub fn is_back_edge(&self, source: &str, target: &str) -> bool {
        self.back_edges
            .contains(&(source.to_string(), target.to_string()))
    }

    /// Cycle-entry nodes: targets of back-edges.
    pub fn is_back_edge_target(&self, node_id: &str) -> bool {
        self.back_edge_targets.contains(node_id)
    }

    pub fn back_edge_targets(&self) -> &BTreeSet<String> {
        &self.back_edge_targets
    }

    pub fn is_cycle_node(&self, node_id: &str) -> bool {
        self.cycle_nodes.contains(node_id)
    }

    pub fn cycle_nodes(&self) -> &BTreeSet<String> {
        &self.cycle_nodes
    }

    /// Entry points of a cyclic graph: nodes whose incoming edges are all back-edges.
    pub fn roots<'g>(&self, graph: &'g FlowGraph) -> Vec<&'g str> {
        graph
            .node_ids()
            .filter(|node_id| {
                graph
                    .incoming_edges(node_id)
                    .iter()
                    .all(|edge| self.is_back_edge(&edge.source, &edge.target))
            })
            .collect()
    }
}

/// Three-color depth-first search over forward adjacency using an explicit stack.
/// An edge into a gray node closes a cycle and is recorded as a back-edge.
fn detect_back_edges(graph: &FlowGraph) -> BTreeSet<(String, String)> {
    let mut color: BTreeMap<&str, Color> = graph.node_ids().map(|id| (id, Color::White)).collect();
    let mut back_edges = BTreeSet::new();

    for start in graph.node_ids() {
        if color.get(start) != Some(&Color::White) {
            continue;
        }
        color.insert(start, Color::Gray);
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let node_id = frame.0;
            let Some(edge) = graph.outgoing_edges(node_id).get(frame.1) else {
                color.insert(node_id, Color::Black);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let target = edge.target.as_str();
            match color.get(target).copied().unwrap_or(Color::Black) {
                Color::Gray => {
                    back_edges.insert((node_id.to_string(), target.to_string()));
                }
                Color::White => {
                    color.insert(target, Color::Gray);
                    stack.push((target, 0));
                }
                Color::Black => {}
            }
        }
    }

    back_edges
}

/// For each back-edge `(source, target)`, walks forward from `target` without crossing
/// back-edges and marks the path that reaches `source`.
fn collect_cycle_nodes(
    graph: &FlowGraph,
    back_edges: &BTreeSet<(String, String)>,
) -> BTreeSet<String> {
    let mut cycle_nodes = BTreeSet::new();

    for (source, target) in back_edges {
        let mut parent: BTreeMap<&str, Option<&str>> = BTreeMap::from([(target.as_str(), None)]);
        let mut queue = VecDeque::from([target.as_str()]);

        while let Some(current) = queue.pop_front() {
            if current == source {
                let mut cursor = Some(current);
                while let Some(node_id) = cursor {
                    cycle_nodes.insert(node_id.to_string());
                    cursor = parent.get(node_id).copied().flatten();
                }
                break;
            }

            for edge in graph.outgoing_edges(current) {
                if back_edges.contains(&(edge.source.clone(), edge.target.clone())) {
                    continue;
                }
                let next = edge.target.as_str();
                if !parent.contains_key(next) {
                    parent.insert(next, Some(current));
                    queue.push_back(next);
                }
            }
        }
    }

    cycle_nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EdgeConfig, NodeConfig};

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> FlowGraph {
        FlowGraph::new(
            nodes.iter().map(|id| NodeConfig::new(*id, *id)).collect(),
            edges
                .iter()
                .map(|(source, target)| EdgeConfig::always(*source, *target))
                .collect(),
        )
        .expect("graph should build")
    }

    fn pair(source: &str, target: &str) -> (String, String) {
        (source.to_string(), target.to_string())
    }

    #[test]
    fn analyze_dag_expected_no_back_edges() {
        let analysis = CycleAnalysis::analyze(&graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        ));
        assert!(!analysis.has_cycles());
        assert!(analysis.back_edges().is_empty());
        assert!(analysis.cycle_nodes().is_empty());
    }

    #[test]
    fn analyze_two_node_cycle_expected_closing_edge_is_back_edge() {
        let graph = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let analysis = CycleAnalysis::analyze(&graph);
        assert!(analysis.has_cycles());
        assert_eq!(analysis.back_edges(), &BTreeSet::from([pair("b", "a")]));
        assert!(analysis.is_back_edge_target("a"));
        assert_eq!(
            analysis.cycle_nodes(),
            &BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(analysis.roots(&graph), vec!["a"]);
    }

    #[test]
    fn analyze_self_loop_expected_node_is_root_and_cycle_member() {
        let graph = graph(&["a"], &[("a", "a")]);
        let analysis = CycleAnalysis::analyze(&graph);
        assert_eq!(analysis.back_edges(), &BTreeSet::from([pair("a", "a")]));
        assert!(analysis.is_cycle_node("a"));
        assert_eq!(analysis.roots(&graph), vec!["a"]);
    }

    #[test]
    fn analyze_agent_loop_expected_exit_node_outside_cycle() {
        let graph = graph(
            &["plan", "act", "observe", "decide", "deliver"],
            &[
                ("plan", "act"),
                ("act", "observe"),
                ("observe", "decide"),
                ("decide", "plan"),
                ("decide", "deliver"),
            ],
        );
        let analysis = CycleAnalysis::analyze(&graph);
        assert_eq!(analysis.back_edges(), &BTreeSet::from([pair("decide", "plan")]));
        for node in ["plan", "act", "observe", "decide"] {
            assert!(analysis.is_cycle_node(node), "{node} should be in the cycle");
        }
        assert!(!analysis.is_cycle_node("deliver"));
        assert_eq!(analysis.roots(&graph), vec!["plan"]);
    }

    #[test]
    fn analyze_prefix_before_cycle_expected_prefix_not_cycle_node() {
        let graph = graph(
            &["start", "loop", "body"],
            &[("start", "loop"), ("loop", "body"), ("body", "loop")],
        );
        let analysis = CycleAnalysis::analyze(&graph);
        assert_eq!(analysis.back_edges(), &BTreeSet::from([pair("body", "loop")]));
        assert!(!analysis.is_cycle_node("start"));
        assert_eq!(analysis.roots(&graph), vec!["start"]);
    }

    #[test]
    fn analyze_deep_chain_expected_no_stack_overflow() {
        let ids: Vec<String> = (0..20_000).map(|i| format!("n{i}")).collect();
        let nodes = ids.iter().map(|id| NodeConfig::new(id, id)).collect();
        let mut edges: Vec<EdgeConfig> = ids
            .windows(2)
            .map(|pair| EdgeConfig::always(&pair[0], &pair[1]))
            .collect();
        edges.push(EdgeConfig::always("n19999", "n0"));
        let graph = FlowGraph::new(nodes, edges).expect("graph should build");

        let analysis = CycleAnalysis::analyze(&graph);
        assert_eq!(analysis.back_edges(), &BTreeSet::from([pair("n19999", "n0")]));
        assert_eq!(analysis.cycle_nodes().len(), 20_000);
    }

    #[test]
    fn analyze_disconnected_components_expected_deterministic() {
        let graph = graph(
            &["x", "y", "a", "b"],
            &[("x", "y"), ("y", "x"), ("a", "b"), ("b", "a")],
        );
        let first = CycleAnalysis::analyze(&graph);
        let second = CycleAnalysis::analyze(&graph);
        assert_eq!(first, second);
        assert_eq!(
            first.back_edges(),
            &BTreeSet::from([pair("b", "a"), pair("y", "x")])
        );
    }
}
