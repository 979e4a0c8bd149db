//! A Chord distributed hash table run as a set of in-process nodes.
//!
//! Nodes live in a [`network::ChordNetwork`] and talk to each other only
//! through [`endpoints`], addressing peers by [`chord_util::Identifier`].

pub mod chord_node;
pub mod chord_util;
pub mod data_store;
pub mod endpoints;
pub mod failure_detector;
pub mod gval;
pub mod network;
pub mod node_info;
pub mod router;
pub mod stabilizer;

pub use chord_node::ChordNode;
pub use chord_util::{ChordError, ChordResult, Identifier};
pub use gval::ChordConfig;
pub use network::ChordNetwork;
