use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordResult, Identifier};
use crate::data_store::DataIdAndValue;
use crate::endpoints;
use crate::router;
use crate::stabilizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLiveness {
    pub last_contact: Instant,
    pub consecutive_failures: u32,
}

/// What one node believes about the responsiveness of its peers.
/// Only a hint for the failure check; routing never trusts it alone.
#[derive(Debug, Clone, Default)]
pub struct LivenessTable {
    peers: HashMap<Identifier, PeerLiveness>,
}

impl LivenessTable {
    pub fn new() -> LivenessTable {
        LivenessTable {
            peers: HashMap::new(),
        }
    }

    /// Starts tracking `peer` as if it had just answered.
    pub fn track(&mut self, peer: Identifier, now: Instant) {
        self.peers.entry(peer).or_insert(PeerLiveness {
            last_contact: now,
            consecutive_failures: 0,
        });
    }

    pub fn record_contact(&mut self, peer: Identifier, now: Instant) {
        let entry = self.peers.entry(peer).or_insert(PeerLiveness {
            last_contact: now,
            consecutive_failures: 0,
        });
        entry.last_contact = now;
        entry.consecutive_failures = 0;
    }

    pub fn record_miss(&mut self, peer: Identifier, now: Instant) -> u32 {
        let entry = self.peers.entry(peer).or_insert(PeerLiveness {
            last_contact: now,
            consecutive_failures: 0,
        });
        entry.consecutive_failures += 1;
        entry.consecutive_failures
    }

    pub fn failures(&self, peer: Identifier) -> u32 {
        self.peers
            .get(&peer)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn contains(&self, peer: Identifier) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Peers that have not been heard from for at least `timeout`.
    pub fn silent_peers(&self, now: Instant, timeout: Duration) -> Vec<Identifier> {
        let mut silent: Vec<Identifier> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_contact) >= timeout)
            .map(|(peer, _)| *peer)
            .collect();
        silent.sort_unstable();
        silent
    }

    pub fn suspects(&self, threshold: u32) -> Vec<Identifier> {
        let mut dead: Vec<Identifier> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.consecutive_failures >= threshold)
            .map(|(peer, _)| *peer)
            .collect();
        dead.sort_unstable();
        dead
    }

    pub fn forget(&mut self, peer: Identifier) {
        self.peers.remove(&peer);
    }

    /// Drops healthy records of peers outside `keep`. Records with misses
    /// stay until their peer is either confirmed or declared dead.
    pub fn retain_relevant(&mut self, keep: &HashSet<Identifier>) {
        self.peers
            .retain(|peer, entry| keep.contains(peer) || entry.consecutive_failures > 0);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// One failure-check round: predecessor check, probe of silent peers,
/// then a death declaration for every peer past the miss threshold.
pub fn check_failures(self_node: &ChordNode) -> ChordResult<()> {
    self_node.ensure_alive()?;
    check_predecessor(self_node)?;

    let config = self_node.config();
    let now = Instant::now();
    let silent = {
        let mut state = self_node.lock_state();
        let known: HashSet<Identifier> = state.info.known_peers().into_iter().collect();
        state.liveness.retain_relevant(&known);
        for peer in &known {
            state.liveness.track(*peer, now);
        }
        state.liveness.silent_peers(now, config.failure_timeout())
    };

    for peer in silent {
        // the call boundary updates the record either way
        if let Err(err) = endpoints::call_ping(self_node, peer) {
            debug!(
                "check_failures_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &self_node.space()),
                chord_util::gen_debug_str_of_node(peer, &self_node.space()),
                err
            );
        }
    }

    let suspects = self_node.lock_state().liveness.suspects(config.failure_threshold);
    for peer in suspects {
        declare_dead(self_node, peer)?;
    }
    Ok(())
}

/// Clears the predecessor when it no longer answers.
pub fn check_predecessor(self_node: &ChordNode) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let pred = match self_node.lock_state().info.predecessor_info {
        Some(pred) if pred != self_node.node_id => pred,
        _ => return Ok(()),
    };

    if endpoints::call_ping(self_node, pred).is_err() {
        let mut state = self_node.lock_state();
        if state.info.predecessor_info == Some(pred) {
            state.info.set_pred_info(None);
            info!(
                "check_predecessor_1,{},predecessor cleared,{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &self_node.space()),
                chord_util::gen_debug_str_of_node(pred, &self_node.space())
            );
        }
    }
    Ok(())
}

/// Evicts `dead_id` from this node's routing state, repairs the finger
/// slots it occupied and re-homes the keys it was responsible for.
pub fn declare_dead(self_node: &ChordNode, dead_id: Identifier) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let space = self_node.space();

    let (freed_slots, lower) = {
        let mut state = self_node.lock_state();
        let lower = state
            .info
            .known_peers()
            .into_iter()
            .chain(std::iter::once(self_node.node_id))
            .filter(|id| *id != dead_id)
            .min_by_key(|id| space.distance(*id, dead_id))
            .unwrap_or(self_node.node_id);
        let freed_slots = state.info.handle_downed_node_info(dead_id, &space);
        state.liveness.forget(dead_id);
        (freed_slots, lower)
    };

    warn!(
        "declare_dead_1,{},{},freed finger slots {:?}",
        chord_util::gen_debug_str_of_node(self_node.node_id, &space),
        chord_util::gen_debug_str_of_node(dead_id, &space),
        freed_slots
    );

    for idx in freed_slots {
        stabilizer::stabilize_finger_table(self_node, idx)?;
    }
    recover_data(self_node, dead_id, lower)
}

/// Pushes every local key in `(lower, dead_id]` to its current owner as a
/// handoff. The receiving owner keeps an existing value and replicates.
pub fn recover_data(self_node: &ChordNode, dead_id: Identifier, lower: Identifier) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let space = self_node.space();
    let orphaned = self_node.lock_state().data_store.get_iv_in_range(lower, dead_id);
    if orphaned.is_empty() {
        return Ok(());
    }

    let mut by_owner: BTreeMap<Identifier, Vec<DataIdAndValue>> = BTreeMap::new();
    for iv in orphaned {
        match router::find_successor(self_node, iv.data_id) {
            Ok(owner) => by_owner.entry(owner).or_default().push(iv),
            Err(err) => warn!(
                "recover_data_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                chord_util::gen_debug_str_of_data(iv.data_id, &space),
                err
            ),
        }
    }

    for (owner, items) in by_owner {
        info!(
            "recover_data_2,{},{},{} keys",
            chord_util::gen_debug_str_of_node(self_node.node_id, &space),
            chord_util::gen_debug_str_of_node(owner, &space),
            items.len()
        );
        if let Err(err) = endpoints::call_handoff(self_node, owner, items) {
            warn!(
                "recover_data_3,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                chord_util::gen_debug_str_of_node(owner, &space),
                err
            );
        }
    }
    Ok(())
}
