//! Every request one node makes of another passes through here.
//!
//! Nodes live in the same process, so a "call" is a lookup of the target in
//! the network arena followed by a direct method call on it. The boundary
//! still behaves like a remote one: an unknown or dead target answers with
//! `Unreachable` / `NodeDead`, and both sides update their liveness records.
//! Callers must not hold their own state lock while calling.

use tracing::trace;

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordError, ChordResult, Identifier};
use crate::data_store::{DataIdAndValue, Value};
use crate::router::RouteStep;

fn rrpc_call<T, F>(caller: &ChordNode, target_id: Identifier, f: F) -> ChordResult<T>
where
    F: FnOnce(&ChordNode) -> ChordResult<T>,
{
    if target_id == caller.node_id {
        return f(caller);
    }

    let target = match caller.network().and_then(|network| network.node(target_id)) {
        Some(node) => node,
        None => {
            caller.note_unreachable(target_id);
            return Err(ChordError::Unreachable(target_id));
        }
    };

    let result = if target.is_alive() {
        target.record_contact(caller.node_id);
        f(&target)
    } else {
        Err(ChordError::NodeDead(target_id))
    };

    match &result {
        Ok(_) => caller.record_contact(target_id),
        // errors about third parties are the target's business
        Err(err) if err.unreachable_id() == Some(target_id) => {
            trace!(
                "rrpc_call_1,{},{},{}",
                chord_util::gen_debug_str_of_node(caller.node_id, &caller.space()),
                chord_util::gen_debug_str_of_node(target_id, &caller.space()),
                err
            );
            caller.note_unreachable(target_id);
        }
        Err(_) => {}
    }
    result
}

pub fn call_ping(caller: &ChordNode, target_id: Identifier) -> ChordResult<()> {
    rrpc_call(caller, target_id, |node| node.handle_ping())
}

pub fn call_route_step(caller: &ChordNode, target_id: Identifier, key: Identifier) -> ChordResult<RouteStep> {
    rrpc_call(caller, target_id, |node| node.handle_route_step(key))
}

pub fn call_find_successor(caller: &ChordNode, target_id: Identifier, key: Identifier) -> ChordResult<Identifier> {
    rrpc_call(caller, target_id, |node| node.find_successor(key))
}

pub fn call_get_predecessor(caller: &ChordNode, target_id: Identifier) -> ChordResult<Option<Identifier>> {
    rrpc_call(caller, target_id, |node| node.get_predecessor())
}

pub fn call_get_successor_list(caller: &ChordNode, target_id: Identifier) -> ChordResult<Vec<Identifier>> {
    rrpc_call(caller, target_id, |node| node.get_successor_list())
}

pub fn call_notify(caller: &ChordNode, target_id: Identifier, candidate: Identifier) -> ChordResult<()> {
    rrpc_call(caller, target_id, |node| node.notify(candidate))
}

pub fn call_store(caller: &ChordNode, target_id: Identifier, key: Identifier, value: Value) -> ChordResult<()> {
    rrpc_call(caller, target_id, |node| node.handle_store(key, value))
}

pub fn call_store_replicas(caller: &ChordNode, target_id: Identifier, items: Vec<DataIdAndValue>) -> ChordResult<()> {
    rrpc_call(caller, target_id, |node| node.store_replicas(items))
}

pub fn call_handoff(caller: &ChordNode, target_id: Identifier, items: Vec<DataIdAndValue>) -> ChordResult<()> {
    rrpc_call(caller, target_id, |node| node.accept_handoff(items))
}

pub fn call_get(caller: &ChordNode, target_id: Identifier, key: Identifier) -> ChordResult<Option<DataIdAndValue>> {
    rrpc_call(caller, target_id, |node| node.handle_get(key))
}

pub fn call_delete(caller: &ChordNode, target_id: Identifier, key: Identifier) -> ChordResult<Option<Value>> {
    rrpc_call(caller, target_id, |node| node.handle_delete(key))
}

pub fn call_delete_replica(caller: &ChordNode, target_id: Identifier, key: Identifier) -> ChordResult<Option<Value>> {
    rrpc_call(caller, target_id, |node| node.delete_replica(key))
}
