use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chord_util::{self, IdSpace, Identifier};

/// Routing state of one node. Every peer is referenced by identifier only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: Identifier,
    // nearest first, never empty. Holds node_id itself only while the
    // node knows of no other peer.
    pub successor_info_list: Vec<Identifier>,
    // None right after join and after the old predecessor was found dead
    pub predecessor_info: Option<Identifier>,
    // finger_table[i] ~ successor(node_id + 2^i), length m
    pub finger_table: Vec<Identifier>,
}

impl NodeInfo {
    /// A ring of one: successor, predecessor and every finger point at self.
    pub fn new(node_id: Identifier, space: &IdSpace) -> NodeInfo {
        NodeInfo {
            node_id,
            successor_info_list: vec![node_id],
            predecessor_info: Some(node_id),
            finger_table: vec![node_id; space.bits() as usize],
        }
    }

    pub fn successor(&self) -> Identifier {
        self.successor_info_list
            .first()
            .copied()
            .unwrap_or(self.node_id)
    }

    pub fn set_pred_info(&mut self, pred: Option<Identifier>) {
        self.predecessor_info = pred;
    }

    /// Every distinct peer this node currently points at, self excluded.
    pub fn known_peers(&self) -> Vec<Identifier> {
        let mut peers: Vec<Identifier> = self
            .successor_info_list
            .iter()
            .chain(self.finger_table.iter())
            .chain(self.predecessor_info.iter())
            .copied()
            .filter(|id| *id != self.node_id)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    /// Called once `target_id` has been declared dead. Evicts it from every
    /// slot and returns the finger indices that pointed at it, which now
    /// point at the (possibly new) successor and want a fresh lookup.
    pub fn handle_downed_node_info(&mut self, target_id: Identifier, space: &IdSpace) -> Vec<usize> {
        let old_successor = self.successor();
        self.successor_info_list.retain(|id| *id != target_id);

        if self.successor_info_list.is_empty() {
            // walk the finger table from the front for something usable
            let replacement = self
                .finger_table
                .iter()
                .copied()
                .find(|id| *id != self.node_id && *id != target_id)
                .unwrap_or(self.node_id);
            self.successor_info_list.push(replacement);
        }
        if old_successor != self.successor() {
            info!(
                "handle_downed_node_info_1,{},assign new successor,{},{}",
                chord_util::gen_debug_str_of_node(self.node_id, space),
                chord_util::gen_debug_str_of_node(old_successor, space),
                chord_util::gen_debug_str_of_node(self.successor(), space)
            );
        }

        if self.predecessor_info == Some(target_id) {
            self.predecessor_info = None;
        }

        let successor = self.successor();
        let mut freed = Vec::new();
        for (idx, entry) in self.finger_table.iter_mut().enumerate() {
            if *entry == target_id {
                *entry = successor;
                freed.push(idx);
            }
        }
        freed
    }
}

/// Dedups `candidates`, drops `self_id`, orders the rest by clockwise
/// distance from `self_id` and keeps at most `limit`. An empty result
/// falls back to `[self_id]`.
pub fn normalize_successor_list(
    self_id: Identifier,
    candidates: &[Identifier],
    limit: usize,
    space: &IdSpace,
) -> Vec<Identifier> {
    let mut list: Vec<Identifier> = candidates
        .iter()
        .copied()
        .filter(|id| *id != self_id)
        .collect();
    list.sort_by_key(|id| space.distance(self_id, *id));
    list.dedup();
    list.truncate(limit);
    if list.is_empty() {
        list.push(self_id);
    }
    list
}
