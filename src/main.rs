use std::env;
use std::thread;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chord_dht::chord_util::{self, ChordError, ChordResult, Identifier};
use chord_dht::{ChordConfig, ChordNetwork};

// usage: chord_dht [config.json] <node id> <node id> ...
// ids are decimal or 0x-prefixed hex. The first id bootstraps the ring.
fn parse_args(args: &[String]) -> ChordResult<(ChordConfig, Vec<Identifier>)> {
    let mut rest = args;
    let config = match rest.first() {
        Some(path) if path.ends_with(".json") => {
            rest = &rest[1..];
            ChordConfig::from_file(path)?
        }
        _ => ChordConfig::default(),
    };

    let mut ids = Vec::new();
    for arg in rest {
        let parsed = match arg.strip_prefix("0x") {
            Some(hex) => Identifier::from_str_radix(hex, 16),
            None => arg.parse::<Identifier>(),
        };
        ids.push(parsed.map_err(|err| ChordError::InvalidConfig(format!("bad node id {}: {}", arg, err)))?);
    }
    if ids.is_empty() {
        return Err(ChordError::InvalidConfig(
            "usage: chord_dht [config.json] <node id>...".to_string(),
        ));
    }
    Ok((config, ids))
}

fn main() -> ChordResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config, ids) = parse_args(&args)?;
    let network = ChordNetwork::new(config)?;
    let space = network.space();

    let bootstrap = ids[0];
    network.create_node(bootstrap)?.join(None)?;
    for id in &ids[1..] {
        let node = network.create_node(*id)?;
        if let Err(err) = node.join(Some(bootstrap)) {
            warn!("main_1,{},{}", chord_util::gen_debug_str_of_node(*id, &space), err);
        }
    }
    for node in network.alive_nodes() {
        node.start_maintenance()?;
    }

    // let the workers run for a while before looking at the result
    thread::sleep(network.config().stabilize_interval() * 30);

    for node in network.alive_nodes() {
        match serde_json::to_string(&node.routing_snapshot()) {
            Ok(json) => info!("main_2,{},{}", chord_util::gen_debug_str_of_node(node.node_id, &space), json),
            Err(err) => warn!("main_3,{}", err),
        }
    }
    info!("main_4,ring connected = {}", network.check_ring_connectivity());

    network.shutdown();
    Ok(())
}
