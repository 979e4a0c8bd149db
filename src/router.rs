use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordError, ChordResult, Identifier};
use crate::endpoints;

/// Answer of one node to "who is next for this key".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStep {
    /// the key belongs to this (live) node
    Found(Identifier),
    /// ask this node next
    Forward(Identifier),
}

// Routes iteratively from self_node. Every hop is a call through the endpoints
// so that dead hops are noticed and recorded by the failure detector.
pub fn find_successor(self_node: &ChordNode, key: Identifier) -> ChordResult<Identifier> {
    let mut visited = HashSet::new();
    find_successor_with_visited(self_node, key, &mut visited)
}

/// Same as `find_successor`, continuing a walk that already went through
/// `visited`. Each pre-visited node counts as a hop already spent.
pub fn find_successor_with_visited(
    self_node: &ChordNode,
    key: Identifier,
    visited: &mut HashSet<Identifier>,
) -> ChordResult<Identifier> {
    self_node.ensure_alive()?;
    let space = self_node.space();
    let budget = self_node.config().hop_budget();

    let mut hops = visited.len() as u32;
    if hops > budget {
        return Err(ChordError::LookupExhausted { key, hops });
    }
    visited.insert(self_node.node_id);

    debug!(
        "find_successor_1,{},{}",
        chord_util::gen_debug_str_of_node(self_node.node_id, &space),
        chord_util::gen_debug_str_of_data(key, &space)
    );

    // nodes asked so far, the last one is asked next
    let mut path = vec![self_node.node_id];
    while let Some(&current) = path.last() {
        match endpoints::call_route_step(self_node, current, key) {
            Ok(RouteStep::Found(owner)) => {
                debug!(
                    "find_successor_2,{},{},{},hops={}",
                    chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                    chord_util::gen_debug_str_of_data(key, &space),
                    chord_util::gen_debug_str_of_node(owner, &space),
                    hops
                );
                return Ok(owner);
            }
            Ok(RouteStep::Forward(next)) => {
                if next == current || visited.contains(&next) {
                    debug!(
                        "find_successor_3,{},routing cycle at,{}",
                        chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                        chord_util::gen_debug_str_of_node(next, &space)
                    );
                    return Err(ChordError::LookupExhausted { key, hops });
                }
                hops += 1;
                if hops > budget {
                    return Err(ChordError::LookupExhausted { key, hops });
                }
                visited.insert(next);
                path.push(next);
            }
            Err(err) if err.is_unreachable() && path.len() > 1 => {
                // the hop died under us: ask the node that pointed at it again
                debug!(
                    "find_successor_4,{},{},{}",
                    chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                    chord_util::gen_debug_str_of_node(current, &space),
                    err
                );
                path.pop();
                hops += 1;
                if hops > budget {
                    return Err(ChordError::LookupExhausted { key, hops });
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(ChordError::LookupExhausted { key, hops })
}

/// One routing decision taken with this node's own state.
pub fn route_step(self_node: &ChordNode, key: Identifier) -> ChordResult<RouteStep> {
    self_node.ensure_alive()?;
    let successors = self_node.lock_state().info.successor_info_list.clone();
    let succ = first_live_successor(self_node, &successors);

    if chord_util::between_right_inclusive(key, self_node.node_id, succ) {
        return Ok(RouteStep::Found(succ));
    }
    Ok(RouteStep::Forward(closest_preceding_finger(self_node, key)))
}

//  Scans the finger table from the widest entry down and returns the farthest
//  live node that still precedes `key`. Falls back to the successor list, and
//  to self when nothing qualifies.
pub fn closest_preceding_finger(self_node: &ChordNode, key: Identifier) -> Identifier {
    let (finger_table, successors) = {
        let state = self_node.lock_state();
        (
            state.info.finger_table.clone(),
            state.info.successor_info_list.clone(),
        )
    };
    let self_id = self_node.node_id;

    let mut tried = HashSet::new();
    for entry in finger_table.iter().rev() {
        if *entry == self_id || !chord_util::between_exclusive(*entry, self_id, key) {
            continue;
        }
        if !tried.insert(*entry) {
            continue;
        }
        trace!(
            "closest_preceding_finger_1,{},{}",
            chord_util::gen_debug_str_of_node(self_id, &self_node.space()),
            chord_util::gen_debug_str_of_node(*entry, &self_node.space())
        );
        if endpoints::call_ping(self_node, *entry).is_ok() {
            return *entry;
        }
    }

    for entry in successors {
        if entry == self_id || !chord_util::between_exclusive(entry, self_id, key) {
            continue;
        }
        if tried.contains(&entry) {
            continue;
        }
        if endpoints::call_ping(self_node, entry).is_ok() {
            return entry;
        }
    }
    self_id
}

/// The nearest entry of `successors` that answers a ping, self when none do.
pub fn first_live_successor(self_node: &ChordNode, successors: &[Identifier]) -> Identifier {
    for succ in successors {
        if *succ == self_node.node_id {
            continue;
        }
        match endpoints::call_ping(self_node, *succ) {
            Ok(()) => return *succ,
            Err(err) => debug!(
                "first_live_successor_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &self_node.space()),
                chord_util::gen_debug_str_of_node(*succ, &self_node.space()),
                err
            ),
        }
    }
    self_node.node_id
}
