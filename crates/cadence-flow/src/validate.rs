use std::collections::{HashMap, HashSet};

use cadence_core::error::{FlowError, Result};
use cadence_core::types::Flow;

use crate::node::NodeAction;

/// Validate a flow definition at save time.
///
/// The engine tolerates some of these defects at run time (first-edge
/// fallback, node-level parse failures), but a definition should never
/// reach it with any of them: ambiguous fan-out in particular is a silent
/// wrong-turn waiting to happen. Returns the first-error wrapped form of
/// [`flow_issues`].
pub fn validate_flow(flow: &Flow) -> Result<()> {
    let issues = flow_issues(flow);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(FlowError::Validation(issues.join("; ")))
    }
}

/// All structural problems in a flow definition, in a stable order.
pub fn flow_issues(flow: &Flow) -> Vec<String> {
    let mut issues = Vec::new();

    let mut ids = HashSet::new();
    for node in &flow.nodes {
        if !ids.insert(node.id.as_str()) {
            issues.push(format!("duplicate node id '{}'", node.id));
        }
    }

    let trigger_count = flow
        .nodes
        .iter()
        .filter(|n| n.kind == cadence_core::types::NodeKind::Trigger)
        .count();
    if trigger_count != 1 {
        issues.push(format!(
            "flow must contain exactly one trigger node, found {}",
            trigger_count
        ));
    }

    for edge in &flow.edges {
        if !ids.contains(edge.source.as_str()) {
            issues.push(format!(
                "edge {} references missing source node '{}'",
                edge.id, edge.source
            ));
        }
        if !ids.contains(edge.target.as_str()) {
            issues.push(format!(
                "edge {} references missing target node '{}'",
                edge.id, edge.target
            ));
        }
    }

    for node in &flow.nodes {
        let outgoing: Vec<_> = flow.outgoing(&node.id).collect();

        if node.kind.is_branching() {
            let known = node.kind.handles();
            let mut seen: HashMap<&str, usize> = HashMap::new();
            for edge in &outgoing {
                match edge.source_handle.as_deref() {
                    Some(handle) if known.contains(&handle) => {
                        *seen.entry(handle).or_default() += 1;
                    }
                    Some(handle) => issues.push(format!(
                        "edge {} uses unknown handle '{}' on {} node '{}'",
                        edge.id, handle, node.kind, node.id
                    )),
                    None => issues.push(format!(
                        "edge {} leaving {} node '{}' has no source handle",
                        edge.id, node.kind, node.id
                    )),
                }
            }
            for (handle, count) in seen {
                if count > 1 {
                    issues.push(format!(
                        "node '{}' has {} outgoing edges for handle '{}'",
                        node.id, count, handle
                    ));
                }
            }
        } else if outgoing.len() > 1 {
            issues.push(format!(
                "non-branching node '{}' has {} outgoing edges",
                node.id,
                outgoing.len()
            ));
        }

        if let Err(e) = NodeAction::parse(node) {
            issues.push(e.to_string());
        }
    }

    issues
}
