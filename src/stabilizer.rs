use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordError, ChordResult, IdSpace, Identifier};
use crate::data_store::DataIdAndValue;
use crate::endpoints;
use crate::node_info::{self, NodeInfo};
use crate::router;

/// Integrates `new_node` into the ring known to `bootstrap`.
/// With no bootstrap (or itself as bootstrap) the node becomes a ring of one.
pub fn join(new_node: &ChordNode, bootstrap: Option<Identifier>) -> ChordResult<()> {
    new_node.ensure_alive()?;
    let space = new_node.space();
    let self_id = new_node.node_id;

    let bootstrap = match bootstrap {
        Some(bootstrap) if bootstrap != self_id => bootstrap,
        _ => {
            new_node.lock_state().info = NodeInfo::new(self_id, &space);
            info!("join_1,{},first node", chord_util::gen_debug_str_of_node(self_id, &space));
            return Ok(());
        }
    };

    let join_failed = |reason: String| ChordError::JoinFailed { bootstrap, reason };

    let successor = endpoints::call_find_successor(new_node, bootstrap, self_id)
        .map_err(|err| join_failed(err.to_string()))?;
    if successor == self_id {
        return Err(join_failed("bootstrap resolved the joining node to itself".to_string()));
    }
    let succ_list = endpoints::call_get_successor_list(new_node, successor)
        .map_err(|err| join_failed(err.to_string()))?;

    {
        let limit = new_node.config().successor_list_len();
        let mut candidates = vec![successor];
        candidates.extend(succ_list.into_iter().take(limit.saturating_sub(1)));

        let mut state = new_node.lock_state();
        state.info.set_pred_info(None);
        state.info.successor_info_list =
            node_info::normalize_successor_list(self_id, &candidates, limit, &space);
        state.info.finger_table = vec![successor; space.bits() as usize];
        info!(
            "join_2,{},successor,{},list {:?}",
            chord_util::gen_debug_str_of_node(self_id, &space),
            chord_util::gen_debug_str_of_node(successor, &space),
            state.info.successor_info_list
        );
    }

    // the node is in the ring from here on, a failed round is repaired later
    if let Err(err) = stabilize(new_node) {
        warn!("join_3,{},{}", chord_util::gen_debug_str_of_node(self_id, &space), err);
    }
    if let Err(err) = fix_finger_table(new_node) {
        warn!("join_4,{},{}", chord_util::gen_debug_str_of_node(self_id, &space), err);
    }
    Ok(())
}

// Repairs the forward pointers of self_node: adopts a closer successor when
// the current one already knows of it, refreshes the successor list, tells
// the successor about us and re-balances the local data.
pub fn stabilize(self_node: &ChordNode) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let space = self_node.space();
    let self_id = self_node.node_id;
    let limit = self_node.config().successor_list_len();

    let (successors, own_pred) = {
        let state = self_node.lock_state();
        (
            state.info.successor_info_list.clone(),
            state.info.predecessor_info,
        )
    };
    let successor = router::first_live_successor(self_node, &successors);

    debug!(
        "stabilize_successor_1,{},{}",
        chord_util::gen_debug_str_of_node(self_id, &space),
        chord_util::gen_debug_str_of_node(successor, &space)
    );

    let pred_of_successor = if successor == self_id {
        own_pred
    } else {
        endpoints::call_get_predecessor(self_node, successor)?
    };

    let mut new_successor = successor;
    if let Some(x) = pred_of_successor {
        if x != self_id
            && chord_util::between_exclusive(x, self_id, successor)
            && endpoints::call_ping(self_node, x).is_ok()
        {
            new_successor = x;
        }
    }

    let mut candidates = vec![new_successor];
    if new_successor != self_id {
        match endpoints::call_get_successor_list(self_node, new_successor) {
            Ok(list) => candidates.extend(list),
            Err(err) => {
                debug!(
                    "stabilize_successor_2,{},{}",
                    chord_util::gen_debug_str_of_node(self_id, &space),
                    err
                );
                candidates.extend(entries_past(self_id, new_successor, &successors, &space));
            }
        }
    }
    let new_list = node_info::normalize_successor_list(self_id, &candidates, limit, &space);

    {
        let mut state = self_node.lock_state();
        if state.info.successor() != new_list[0] {
            info!(
                "stabilize_successor_3,{},successor changed,{},{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                chord_util::gen_debug_str_of_node(state.info.successor(), &space),
                chord_util::gen_debug_str_of_node(new_list[0], &space)
            );
        }
        state.info.successor_info_list = new_list;
    }

    if new_successor != self_id {
        if let Err(err) = endpoints::call_notify(self_node, new_successor, self_id) {
            debug!(
                "stabilize_successor_4,{},{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                err
            );
        }
    }

    transfer_data(self_node)
}

// Entries of `known` lying farther from `self_id` than `anchor`, in ring order.
fn entries_past(
    self_id: Identifier,
    anchor: Identifier,
    known: &[Identifier],
    space: &IdSpace,
) -> Vec<Identifier> {
    let reach = space.distance(self_id, anchor);
    known
        .iter()
        .copied()
        .filter(|id| space.distance(self_id, *id) > reach)
        .collect()
}

/// `candidate` believes it might be the predecessor of `self_node`.
pub fn notify(self_node: &ChordNode, candidate: Identifier) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let self_id = self_node.node_id;
    if candidate == self_id {
        return Ok(());
    }
    let space = self_node.space();
    let limit = self_node.config().successor_list_len();

    // everything remote happens before the lock is taken
    let candidate_alive = endpoints::call_ping(self_node, candidate).is_ok();
    let mut learned = Vec::new();
    if candidate_alive {
        learned.push(candidate);
        if let Ok(list) = endpoints::call_get_successor_list(self_node, candidate) {
            for entry in list {
                if entry == self_id || learned.contains(&entry) {
                    continue;
                }
                if endpoints::call_ping(self_node, entry).is_ok() {
                    learned.push(entry);
                }
            }
        }
    }

    let pred_changed = {
        let mut state = self_node.lock_state();
        let adopt = match state.info.predecessor_info {
            None => true,
            Some(pred) if pred == self_id => true,
            Some(pred) => candidate_alive && chord_util::between_exclusive(candidate, pred, self_id),
        };
        if adopt && state.info.predecessor_info != Some(candidate) {
            info!(
                "check_predecessor_1,{},predecessor changed,{:?},{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                state.info.predecessor_info,
                chord_util::gen_debug_str_of_node(candidate, &space)
            );
            state.info.set_pred_info(Some(candidate));
        }

        let mut merged = state.info.successor_info_list.clone();
        merged.extend(learned);
        state.info.successor_info_list =
            node_info::normalize_successor_list(self_id, &merged, limit, &space);
        adopt
    };

    if pred_changed {
        fix_finger_table(self_node)?;
    }
    Ok(())
}

/// Refreshes finger `idx`. A failed lookup keeps the old entry while it
/// answers and otherwise falls back to the nearest live successor.
pub fn stabilize_finger_table(self_node: &ChordNode, idx: usize) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let space = self_node.space();
    let start = space.add_pow2(self_node.node_id, idx as u32);

    let entry = match router::find_successor(self_node, start) {
        Ok(found) => found,
        Err(ChordError::NodeDead(id)) if id == self_node.node_id => {
            return Err(ChordError::NodeDead(id));
        }
        Err(err) => {
            let (old, successors) = {
                let state = self_node.lock_state();
                (
                    state.info.finger_table.get(idx).copied(),
                    state.info.successor_info_list.clone(),
                )
            };
            debug!(
                "stabilize_finger_table_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &space),
                idx,
                err
            );
            match old {
                Some(old) if old == self_node.node_id || endpoints::call_ping(self_node, old).is_ok() => old,
                _ => router::first_live_successor(self_node, &successors),
            }
        }
    };

    let mut state = self_node.lock_state();
    if let Some(slot) = state.info.finger_table.get_mut(idx) {
        *slot = entry;
    }
    Ok(())
}

pub fn fix_finger_table(self_node: &ChordNode) -> ChordResult<()> {
    self_node.ensure_alive()?;
    for idx in 0..self_node.space().bits() as usize {
        stabilize_finger_table(self_node, idx)?;
    }
    Ok(())
}

/// Pushes `items` as replicas to the first live successors of `self_node`,
/// as many as the configured replica count. Returns how many accepted.
pub fn distribute_replica(self_node: &ChordNode, items: &[DataIdAndValue]) -> usize {
    let wanted = self_node.config().replica_count();
    if items.is_empty() || wanted == 0 {
        return 0;
    }
    let successors = self_node.lock_state().info.successor_info_list.clone();

    let mut placed = 0;
    for succ in successors {
        if placed >= wanted {
            break;
        }
        if succ == self_node.node_id {
            continue;
        }
        match endpoints::call_store_replicas(self_node, succ, items.to_vec()) {
            Ok(()) => placed += 1,
            Err(err) => debug!(
                "distribute_replica_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_node.node_id, &self_node.space()),
                chord_util::gen_debug_str_of_node(succ, &self_node.space()),
                err
            ),
        }
    }
    placed
}

// After a stabilize round: re-replicate what this node owns and hand what it
// does not own to the current owner. A foreign key is dropped locally once the
// owner took it and this node is not one of the owner's replica holders.
pub fn transfer_data(self_node: &ChordNode) -> ChordResult<()> {
    self_node.ensure_alive()?;
    let space = self_node.space();
    let self_id = self_node.node_id;

    let (owned, foreign) = {
        let state = self_node.lock_state();
        let pred = match state.info.predecessor_info {
            None => return Ok(()),
            Some(pred) => pred,
        };
        if pred == self_id {
            // a ring of one owns every key and has no one to replicate to
            return Ok(());
        }
        (
            state.data_store.get_iv_with_pred_self_id(pred, self_id),
            state.data_store.get_iv_out_of_charge(pred, self_id),
        )
    };

    distribute_replica(self_node, &owned);

    let mut by_owner: BTreeMap<Identifier, Vec<DataIdAndValue>> = BTreeMap::new();
    for iv in foreign {
        match router::find_successor(self_node, iv.data_id) {
            Ok(owner) if owner != self_id => by_owner.entry(owner).or_default().push(iv),
            Ok(_) => {}
            Err(err) => debug!(
                "transfer_data_1,{},{},{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                chord_util::gen_debug_str_of_data(iv.data_id, &space),
                err
            ),
        }
    }

    let replica_count = self_node.config().replica_count();
    for (owner, items) in by_owner {
        let keys: Vec<Identifier> = items.iter().map(|iv| iv.data_id).collect();
        if let Err(err) = endpoints::call_handoff(self_node, owner, items) {
            debug!(
                "transfer_data_2,{},{},{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                chord_util::gen_debug_str_of_node(owner, &space),
                err
            );
            continue;
        }
        let owner_successors = match endpoints::call_get_successor_list(self_node, owner) {
            Ok(list) => list,
            Err(_) => continue,
        };
        let is_replica_holder = owner_successors
            .iter()
            .take(replica_count)
            .any(|id| *id == self_id);
        if !is_replica_holder {
            self_node.lock_state().data_store.remove_keys(&keys);
            info!(
                "transfer_data_3,{},moved {} keys to,{}",
                chord_util::gen_debug_str_of_node(self_id, &space),
                keys.len(),
                chord_util::gen_debug_str_of_node(owner, &space)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::gval::ChordConfig;
    use crate::network::ChordNetwork;

    fn network(bits: u32, tolerance: usize) -> Arc<ChordNetwork> {
        ChordNetwork::new(ChordConfig {
            tolerance,
            ..ChordConfig::with_bits(bits)
        })
        .unwrap()
    }

    #[test]
    fn test_join_without_bootstrap_resets_to_singleton() {
        let network = network(4, 1);
        let node = network.create_node(3).unwrap();
        node.lock_state().info.predecessor_info = None;
        join(&node, None).unwrap();
        assert_eq!(node.routing_snapshot(), NodeInfo::new(3, &network.space()));
        join(&node, Some(3)).unwrap();
        assert_eq!(node.routing_snapshot().predecessor_info, Some(3));
    }

    #[test]
    fn test_join_sets_successor_and_clears_predecessor() {
        let network = network(4, 1);
        let first = network.create_node(2).unwrap();
        join(&first, None).unwrap();
        let second = network.create_node(9).unwrap();
        join(&second, Some(2)).unwrap();

        let snapshot = second.routing_snapshot();
        assert_eq!(snapshot.successor_info_list, vec![2]);
        assert_eq!(snapshot.predecessor_info, None);
        // the notify sent during join made 9 the predecessor of 2
        assert_eq!(first.routing_snapshot().predecessor_info, Some(9));
        assert_eq!(first.routing_snapshot().successor_info_list, vec![9]);
    }

    #[test]
    fn test_join_via_unknown_bootstrap_fails() {
        let network = network(4, 1);
        let node = network.create_node(3).unwrap();
        assert!(matches!(
            join(&node, Some(11)),
            Err(ChordError::JoinFailed { bootstrap: 11, .. })
        ));
    }

    #[test]
    fn test_notify_prefers_closer_candidate() {
        let network = network(4, 1);
        let node = network.create_node(8).unwrap();
        join(&node, None).unwrap();
        let far = network.create_node(1).unwrap();
        let near = network.create_node(6).unwrap();

        node.lock_state().info.predecessor_info = None;
        notify(&node, far.node_id).unwrap();
        assert_eq!(node.routing_snapshot().predecessor_info, Some(1));
        notify(&node, near.node_id).unwrap();
        assert_eq!(node.routing_snapshot().predecessor_info, Some(6));
        // 1 is not between 6 and 8 any more
        notify(&node, far.node_id).unwrap();
        assert_eq!(node.routing_snapshot().predecessor_info, Some(6));
    }

    #[test]
    fn test_notify_ignores_dead_candidate() {
        let network = network(4, 1);
        let node = network.create_node(8).unwrap();
        join(&node, None).unwrap();
        let near = network.create_node(6).unwrap();
        let nearer = network.create_node(7).unwrap();
        notify(&node, near.node_id).unwrap();
        nearer.crash();
        notify(&node, nearer.node_id).unwrap();
        assert_eq!(node.routing_snapshot().predecessor_info, Some(6));
        assert!(!node.routing_snapshot().successor_info_list.contains(&7));
    }

    #[test]
    fn test_transfer_moves_keys_to_new_owner() {
        let network = network(4, 0);
        let a = network.create_node(2).unwrap();
        join(&a, None).unwrap();
        a.store(5, b"five".to_vec()).unwrap();
        a.store(12, b"twelve".to_vec()).unwrap();
        assert_eq!(a.stored_keys(), vec![5, 12]);

        let b = network.create_node(8).unwrap();
        join(&b, Some(2)).unwrap();
        for _ in 0..3 {
            network.stabilize_all_once();
        }
        // 8 owns (2, 8]
        assert_eq!(b.stored_keys(), vec![5]);
        assert_eq!(a.stored_keys(), vec![12]);
    }

    #[test]
    fn test_transfer_keeps_legitimate_replicas() {
        let network = network(4, 1);
        let a = network.create_node(2).unwrap();
        join(&a, None).unwrap();
        let b = network.create_node(8).unwrap();
        join(&b, Some(2)).unwrap();
        for _ in 0..3 {
            network.stabilize_all_once();
        }
        b.store(5, b"five".to_vec()).unwrap();
        for _ in 0..2 {
            network.stabilize_all_once();
        }
        // owner 8 plus its single replica on 2
        assert_eq!(b.local_value(5), Some(b"five".to_vec()));
        assert_eq!(a.local_value(5), Some(b"five".to_vec()));
    }

    #[test]
    fn test_backups_past_new_successor_survive() {
        let space = IdSpace::new(8).unwrap();
        // 30 was the old successor, 20 the closer node adopted in its place
        assert_eq!(entries_past(10, 20, &[30, 60, 5], &space), vec![30, 60, 5]);
        // the dead successor 30 itself and anything before 60 are dropped
        assert_eq!(entries_past(10, 60, &[30, 60, 90], &space), vec![90]);
        // wrap around zero
        assert_eq!(entries_past(250, 3, &[1, 3, 7, 249], &space), vec![7, 249]);
        assert!(entries_past(10, 10, &[], &space).is_empty());
    }

    #[test]
    fn test_distribute_replica_respects_count() {
        let network = network(4, 1);
        let ids = [1, 5, 9, 13];
        let first = network.create_node(ids[0]).unwrap();
        join(&first, None).unwrap();
        for id in &ids[1..] {
            let node = network.create_node(*id).unwrap();
            join(&node, Some(ids[0])).unwrap();
            for _ in 0..3 {
                network.stabilize_all_once();
            }
        }
        let node = network.node(5).unwrap();
        let items = vec![DataIdAndValue::new(4, b"x".to_vec())];
        assert_eq!(distribute_replica(&node, &items), 1);
        assert_eq!(network.node(9).unwrap().local_value(4), Some(b"x".to_vec()));
        assert_eq!(network.node(13).unwrap().local_value(4), None);
    }
}
