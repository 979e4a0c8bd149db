use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::chord_util::{self, ChordError, ChordResult, IdSpace, Identifier};
use crate::data_store::{DataIdAndValue, DataStore, Value};
use crate::endpoints;
use crate::failure_detector::{self, LivenessTable};
use crate::gval::ChordConfig;
use crate::network::ChordNetwork;
use crate::node_info::NodeInfo;
use crate::router::{self, RouteStep};
use crate::stabilizer;

/// Everything of a node that changes after creation. Guarded by one lock.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) info: NodeInfo,
    pub(crate) data_store: DataStore,
    pub(crate) liveness: LivenessTable,
}

struct StopSignal {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    fn new() -> StopSignal {
        StopSignal {
            stopped: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cvar.notify_all();
    }

    /// Sleeps up to `timeout`. Returns true once stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

struct Maintenance {
    signal: Arc<StopSignal>,
    workers: Vec<JoinHandle<()>>,
}

pub struct ChordNode {
    pub node_id: Identifier,
    config: Arc<ChordConfig>,
    space: IdSpace,
    alive: AtomicBool,
    state: Mutex<NodeState>,
    network: Weak<ChordNetwork>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl ChordNode {
    // nodes are created through ChordNetwork::create_node
    pub(crate) fn new(
        node_id: Identifier,
        config: Arc<ChordConfig>,
        space: IdSpace,
        network: Weak<ChordNetwork>,
    ) -> ChordNode {
        ChordNode {
            node_id,
            config,
            space,
            alive: AtomicBool::new(true),
            state: Mutex::new(NodeState {
                info: NodeInfo::new(node_id, &space),
                data_store: DataStore::new(),
                liveness: LivenessTable::new(),
            }),
            network,
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChordConfig {
        &self.config
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    pub fn network(&self) -> Option<Arc<ChordNetwork>> {
        self.network.upgrade()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_alive(&self) -> ChordResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ChordError::NodeDead(self.node_id))
        }
    }

    fn debug_str(&self) -> String {
        chord_util::gen_debug_str_of_node(self.node_id, &self.space)
    }

    pub fn join(&self, bootstrap: Option<Identifier>) -> ChordResult<()> {
        stabilizer::join(self, bootstrap)
    }

    pub fn find_successor(&self, key: Identifier) -> ChordResult<Identifier> {
        self.space.check(key)?;
        router::find_successor(self, key)
    }

    /// Routes `key` to its owner, which keeps it and replicates it.
    pub fn store(&self, key: Identifier, value: Value) -> ChordResult<()> {
        self.ensure_alive()?;
        self.space.check(key)?;
        debug!(
            "global_put_1,{},{}",
            self.debug_str(),
            chord_util::gen_debug_str_of_data(key, &self.space)
        );
        self.with_owner_retry(key, |owner| {
            endpoints::call_store(self, owner, key, value.clone())
        })
    }

    /// The value stored under `key`, from its owner or failing that from
    /// one of the replicas. `Ok(None)` when nobody has it.
    pub fn retrieve(&self, key: Identifier) -> ChordResult<Option<Value>> {
        self.ensure_alive()?;
        self.space.check(key)?;
        let owner = router::find_successor(self, key)?;

        let replica_holders = match endpoints::call_get(self, owner, key) {
            Ok(Some(entry)) => return Ok(entry.value_data),
            Ok(None) => endpoints::call_get_successor_list(self, owner).unwrap_or_default(),
            Err(err) if err.is_unreachable() => self.nodes_after(owner),
            Err(err) => return Err(err),
        };

        for holder in replica_holders
            .into_iter()
            .filter(|id| *id != owner)
            .take(self.config.replica_count())
        {
            if let Ok(Some(entry)) = endpoints::call_get(self, holder, key) {
                info!(
                    "global_get_2,{},{},answered by replica,{},deleted={}",
                    self.debug_str(),
                    chord_util::gen_debug_str_of_data(key, &self.space),
                    chord_util::gen_debug_str_of_node(holder, &self.space),
                    entry.is_deleted()
                );
                return Ok(entry.value_data);
            }
        }
        debug!(
            "global_get_3,{},{},not found",
            self.debug_str(),
            chord_util::gen_debug_str_of_data(key, &self.space)
        );
        Ok(None)
    }

    /// Deletes `key` on its owner and the owner's replicas. The key is left
    /// as a tombstone so handoffs of older copies do not revive it.
    pub fn delete(&self, key: Identifier) -> ChordResult<Option<Value>> {
        self.ensure_alive()?;
        self.space.check(key)?;
        self.with_owner_retry(key, |owner| endpoints::call_delete(self, owner, key))
    }

    // Runs `op` against the owner of `key`. An owner that does not answer is
    // skipped in favour of the node after it, up to r attempts in total. A
    // lookup that runs out of hops is retried, and counts as unreachable when
    // no attempt resolves an owner.
    fn with_owner_retry<T, F>(&self, key: Identifier, mut op: F) -> ChordResult<T>
    where
        F: FnMut(Identifier) -> ChordResult<T>,
    {
        let mut target = key;
        let mut last_owner = key;
        for _ in 0..self.config.successor_list_len() {
            let owner = match router::find_successor(self, target) {
                Ok(owner) => owner,
                Err(err @ ChordError::LookupExhausted { .. }) => {
                    warn!(
                        "with_owner_retry_2,{},{},{}",
                        self.debug_str(),
                        chord_util::gen_debug_str_of_data(key, &self.space),
                        err
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            match op(owner) {
                Err(err) if err.is_unreachable() => {
                    warn!(
                        "with_owner_retry_1,{},{},{}",
                        self.debug_str(),
                        chord_util::gen_debug_str_of_data(key, &self.space),
                        err
                    );
                    last_owner = owner;
                    target = self.space.add(owner, 1);
                }
                other => return other,
            }
        }
        Err(ChordError::Unreachable(last_owner))
    }

    // up to r-1 distinct owners found by walking the ring past `node_id`
    fn nodes_after(&self, node_id: Identifier) -> Vec<Identifier> {
        let mut found: Vec<Identifier> = Vec::new();
        let mut cursor = node_id;
        for _ in 0..self.config.replica_count() {
            match router::find_successor(self, self.space.add(cursor, 1)) {
                Ok(next) if next != node_id && !found.contains(&next) => {
                    found.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        found
    }

    pub fn notify(&self, candidate: Identifier) -> ChordResult<()> {
        stabilizer::notify(self, candidate)
    }

    pub fn stabilize(&self) -> ChordResult<()> {
        stabilizer::stabilize(self)
    }

    pub fn fix_finger_table(&self) -> ChordResult<()> {
        stabilizer::fix_finger_table(self)
    }

    pub fn check_predecessor(&self) -> ChordResult<()> {
        failure_detector::check_predecessor(self)
    }

    pub fn check_failures(&self) -> ChordResult<()> {
        failure_detector::check_failures(self)
    }

    /// Announced departure: stops the workers and hands the owned keys to
    /// the first successor that still answers.
    pub fn kill(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_maintenance();

        let (owned, successors) = {
            let state = self.lock_state();
            let owned = match state.info.predecessor_info {
                Some(pred) => state.data_store.get_iv_with_pred_self_id(pred, self.node_id),
                None => state.data_store.all_iv(),
            };
            (owned, state.info.successor_info_list.clone())
        };
        info!("kill_1,{},handing off {} keys", self.debug_str(), owned.len());
        if owned.is_empty() {
            return;
        }

        for succ in successors.into_iter().filter(|id| *id != self.node_id) {
            match endpoints::call_handoff(self, succ, owned.clone()) {
                Ok(()) => return,
                Err(err) => debug!(
                    "kill_2,{},{},{}",
                    self.debug_str(),
                    chord_util::gen_debug_str_of_node(succ, &self.space),
                    err
                ),
            }
        }
        warn!("kill_3,{},no successor took the handoff", self.debug_str());
    }

    /// Unannounced failure: the node stops answering and keeps its data.
    pub fn crash(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!("crash_1,{}", self.debug_str());
        }
        self.stop_maintenance();
    }

    pub fn routing_snapshot(&self) -> NodeInfo {
        self.lock_state().info.clone()
    }

    pub fn local_value(&self, key: Identifier) -> Option<Value> {
        self.lock_state().data_store.get(key)
    }

    pub fn stored_keys(&self) -> Vec<Identifier> {
        self.lock_state().data_store.keys()
    }

    /// Spawns the stabilize, fix-fingers and failure-check workers.
    /// Does nothing when they are already running.
    pub fn start_maintenance(self: &Arc<Self>) -> ChordResult<()> {
        self.ensure_alive()?;
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return Ok(());
        }

        let signal = Arc::new(StopSignal::new());
        let tasks: [(&'static str, Duration, fn(&ChordNode) -> ChordResult<()>); 3] = [
            ("stabilize", self.config.stabilize_interval(), stabilizer::stabilize),
            ("fix_fingers", self.config.fix_fingers_interval(), stabilizer::fix_finger_table),
            ("check_failures", self.config.failure_check_interval(), failure_detector::check_failures),
        ];

        let mut workers = Vec::with_capacity(tasks.len());
        for (name, interval, task) in tasks {
            let node = Arc::downgrade(self);
            let worker_signal = Arc::clone(&signal);
            let spawned = thread::Builder::new()
                .name(format!("{}-{:x}", name, self.node_id))
                .spawn(move || maintenance_loop(node, worker_signal, name, interval, task));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    signal.stop();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(ChordError::WorkerSpawn(err.to_string()));
                }
            }
        }
        *maintenance = Some(Maintenance { signal, workers });
        info!("start_maintenance_1,{}", self.debug_str());
        Ok(())
    }

    /// Signals the workers and waits for them to finish their current round.
    pub fn stop_maintenance(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.signal.stop();
            let current = thread::current().id();
            for handle in maintenance.workers {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }

    pub(crate) fn record_contact(&self, peer: Identifier) {
        self.lock_state().liveness.record_contact(peer, Instant::now());
    }

    pub(crate) fn note_unreachable(&self, peer: Identifier) {
        let misses = self.lock_state().liveness.record_miss(peer, Instant::now());
        debug!(
            "note_unreachable_1,{},{},misses={}",
            self.debug_str(),
            chord_util::gen_debug_str_of_node(peer, &self.space),
            misses
        );
    }

    // handlers invoked through the endpoints

    pub(crate) fn handle_ping(&self) -> ChordResult<()> {
        self.ensure_alive()
    }

    pub(crate) fn handle_route_step(&self, key: Identifier) -> ChordResult<RouteStep> {
        router::route_step(self, key)
    }

    pub(crate) fn get_predecessor(&self) -> ChordResult<Option<Identifier>> {
        self.ensure_alive()?;
        Ok(self.lock_state().info.predecessor_info)
    }

    pub(crate) fn get_successor_list(&self) -> ChordResult<Vec<Identifier>> {
        self.ensure_alive()?;
        Ok(self.lock_state().info.successor_info_list.clone())
    }

    pub(crate) fn handle_store(&self, key: Identifier, value: Value) -> ChordResult<()> {
        self.ensure_alive()?;
        self.lock_state().data_store.store_one_iv(key, value.clone());
        debug!(
            "put_4,{},{}",
            self.debug_str(),
            chord_util::gen_debug_str_of_data(key, &self.space)
        );
        stabilizer::distribute_replica(self, &[DataIdAndValue::new(key, value)]);
        Ok(())
    }

    pub(crate) fn store_replicas(&self, items: Vec<DataIdAndValue>) -> ChordResult<()> {
        self.ensure_alive()?;
        self.lock_state().data_store.store_iv_with_vec(items);
        Ok(())
    }

    // keys that arrive here as the new owner keep any entry already present,
    // tombstones included
    pub(crate) fn accept_handoff(&self, items: Vec<DataIdAndValue>) -> ChordResult<()> {
        self.ensure_alive()?;
        let mut current = Vec::with_capacity(items.len());
        {
            let mut state = self.lock_state();
            for iv in items {
                let data_id = iv.data_id;
                state.data_store.store_if_absent(iv);
                current.extend(state.data_store.get_iv(data_id));
            }
        }
        stabilizer::distribute_replica(self, &current);
        Ok(())
    }

    // `Some` with an empty value when the key was deleted here
    pub(crate) fn handle_get(&self, key: Identifier) -> ChordResult<Option<DataIdAndValue>> {
        self.ensure_alive()?;
        Ok(self.lock_state().data_store.get_iv(key))
    }

    pub(crate) fn handle_delete(&self, key: Identifier) -> ChordResult<Option<Value>> {
        self.ensure_alive()?;
        let (previous, successors) = {
            let mut state = self.lock_state();
            (
                state.data_store.mark_deleted(key),
                state.info.successor_info_list.clone(),
            )
        };

        let mut replica_previous = None;
        let mut removed = 0;
        for succ in successors.into_iter().filter(|id| *id != self.node_id) {
            if removed >= self.config.replica_count() {
                break;
            }
            if let Ok(value) = endpoints::call_delete_replica(self, succ, key) {
                removed += 1;
                if replica_previous.is_none() {
                    replica_previous = value;
                }
            }
        }
        Ok(previous.or(replica_previous))
    }

    pub(crate) fn delete_replica(&self, key: Identifier) -> ChordResult<Option<Value>> {
        self.ensure_alive()?;
        Ok(self.lock_state().data_store.mark_deleted(key))
    }

    #[cfg(test)]
    pub(crate) fn liveness_failures(&self, peer: Identifier) -> u32 {
        self.lock_state().liveness.failures(peer)
    }

    #[cfg(test)]
    pub(crate) fn tracks_peer(&self, peer: Identifier) -> bool {
        self.lock_state().liveness.contains(peer)
    }
}

fn maintenance_loop(
    node: Weak<ChordNode>,
    signal: Arc<StopSignal>,
    name: &'static str,
    interval: Duration,
    task: fn(&ChordNode) -> ChordResult<()>,
) {
    // random first delay so the workers of different nodes drift apart
    let offset_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64);
    if signal.wait(Duration::from_millis(offset_ms)) {
        return;
    }
    loop {
        let node = match node.upgrade() {
            Some(node) if node.is_alive() => node,
            _ => return,
        };
        if let Err(err) = task(&node) {
            warn!("{}_worker,{},{}", name, node.debug_str(), err);
        }
        drop(node);
        if signal.wait(interval) {
            return;
        }
    }
}
