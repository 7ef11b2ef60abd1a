use std::collections::{HashSet, VecDeque};

use crate::graph::{EventGraph, GraphError};

/// Decides whether `event_id` is a genuine forward extremity: true iff no
/// non-soft-failed event is reachable from it by following child edges.
///
/// A soft-failed event is kept for DAG completeness but never counts as real
/// history. If some real event has built on `event_id` -- even through a detour
/// of soft-failed intermediaries -- the head is causally superseded. If every
/// forward path dead-ends inside soft-failed events, real history has not moved
/// past it and the head is still current. An event with no children at all is
/// genuine regardless of its own soft-fail flag.
///
/// Breadth-first over `children()`, short-circuiting on the first real
/// descendant. The visited set keeps diamonds linear; the DAG is acyclic by
/// protocol construction, but an edge leading back to the starting event is
/// reported as `Invariant` so a malformed graph cannot hang a caller.
pub fn is_genuine_extremity<G: EventGraph>(graph: &G, event_id: &str) -> Result<bool, GraphError> {
    let mut queue: VecDeque<String> = graph.children(event_id)?.into();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(descendant) = queue.pop_front() {
        if descendant == event_id {
            return Err(GraphError::Invariant(format!(
                "forward traversal from `{event_id}` reached itself"
            )));
        }
        if !visited.insert(descendant.clone()) {
            continue;
        }
        if !graph.is_soft_failed(&descendant)? {
            return Ok(false);
        }
        for child in graph.children(&descendant)? {
            if !visited.contains(&child) {
                queue.push_back(child);
            }
        }
    }

    Ok(true)
}
