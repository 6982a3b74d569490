use crate::FlowGraph;

/// Targets activated by a node's outgoing edges given the port it selected.
///
/// Unconditional edges always fire. Labeled edges fire only on an exact port match, so a
/// node that set no port activates its unconditional edges alone, and a node without labeled
/// edges activates everything.
pub fn reachable_targets<'g>(
    graph: &'g FlowGraph,
    node_id: &str,
    active_port: Option<&str>,
) -> Vec<&'g str> {
    graph
        .outgoing_edges(node_id)
        .iter()
        .filter(|edge| edge.port.is_none() || edge.port.as_deref() == active_port)
        .map(|edge| edge.target.as_str())
        .collect()
}
