use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordError, ChordResult, IdSpace, Identifier};
use crate::gval::ChordConfig;

/// All nodes of one ring, addressed by identifier. Nodes refer to each
/// other only through this table.
pub struct ChordNetwork {
    config: Arc<ChordConfig>,
    space: IdSpace,
    nodes: RwLock<HashMap<Identifier, Arc<ChordNode>>>,
}

impl ChordNetwork {
    pub fn new(config: ChordConfig) -> ChordResult<Arc<ChordNetwork>> {
        config.validate()?;
        let space = config.id_space()?;
        Ok(Arc::new(ChordNetwork {
            config: Arc::new(config),
            space,
            nodes: RwLock::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &ChordConfig {
        &self.config
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    /// Creates a singleton node. It takes part in the ring once it joins.
    pub fn create_node(self: &Arc<Self>, node_id: Identifier) -> ChordResult<Arc<ChordNode>> {
        self.space.check(node_id)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node_id) {
            return Err(ChordError::DuplicateNode(node_id));
        }
        let node = Arc::new(ChordNode::new(
            node_id,
            Arc::clone(&self.config),
            self.space,
            Arc::downgrade(self),
        ));
        nodes.insert(node_id, Arc::clone(&node));
        info!(
            "create_node_1,{}",
            chord_util::gen_debug_str_of_node(node_id, &self.space)
        );
        Ok(node)
    }

    pub fn node(&self, node_id: Identifier) -> Option<Arc<ChordNode>> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn node_ids(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Live nodes in identifier order.
    pub fn alive_nodes(&self) -> Vec<Arc<ChordNode>> {
        let mut alive: Vec<Arc<ChordNode>> = self
            .nodes
            .read()
            .values()
            .filter(|node| node.is_alive())
            .cloned()
            .collect();
        alive.sort_unstable_by_key(|node| node.node_id);
        alive
    }

    /// One maintenance pass over every live node: failure check, stabilize,
    /// then finger refresh. Errors are logged and the pass goes on.
    pub fn stabilize_all_once(&self) {
        let nodes = self.alive_nodes();
        for node in &nodes {
            if let Err(err) = node.check_failures() {
                warn!("do_stabilize_once_at_all_node_1,{},{}", self.debug_str(node), err);
            }
        }
        for node in &nodes {
            if let Err(err) = node.stabilize() {
                warn!("do_stabilize_once_at_all_node_2,{},{}", self.debug_str(node), err);
            }
        }
        for node in &nodes {
            if let Err(err) = node.fix_finger_table() {
                warn!("do_stabilize_once_at_all_node_3,{},{}", self.debug_str(node), err);
            }
        }
    }

    /// True when following successor pointers from the lowest live node
    /// visits every live node exactly once before coming back.
    pub fn check_ring_connectivity(&self) -> bool {
        let alive = self.alive_nodes();
        let start = match alive.first() {
            Some(node) => node.node_id,
            None => return true,
        };
        let alive_ids: HashSet<Identifier> = alive.iter().map(|node| node.node_id).collect();

        let mut visited = HashSet::new();
        let mut current = start;
        loop {
            if !visited.insert(current) {
                break;
            }
            current = match self.node(current) {
                Some(node) => node.routing_snapshot().successor(),
                None => break,
            };
        }

        let connected = current == start && visited == alive_ids;
        if connected {
            info!(
                "check_nodes_connectivity_succ_success,chain includes all node. all_node_num = {}",
                alive_ids.len()
            );
        } else {
            warn!(
                "check_nodes_connectivity_succ_err,chain does not include all node. all_node_num = {}, reached = {}",
                alive_ids.len(),
                visited.len()
            );
        }
        connected
    }

    /// Stops the maintenance workers of every node.
    pub fn shutdown(&self) {
        let nodes: Vec<Arc<ChordNode>> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            node.stop_maintenance();
        }
        info!("shutdown_1,{} nodes stopped", self.nodes.read().len());
    }

    fn debug_str(&self, node: &ChordNode) -> String {
        chord_util::gen_debug_str_of_node(node.node_id, &self.space)
    }
}
