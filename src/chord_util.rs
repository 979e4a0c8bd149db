use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use thiserror::Error;

/// A point on the ring. Only the low `IdSpace::bits` bits are ever used.
pub type Identifier = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChordError {
    /// routing made no progress within the hop budget
    #[error("lookup of {key:#x} exhausted after {hops} hops")]
    LookupExhausted { key: Identifier, hops: u32 },
    #[error("node {0:#x} is unreachable")]
    Unreachable(Identifier),
    #[error("node {0:#x} is dead")]
    NodeDead(Identifier),
    #[error("join via bootstrap node {bootstrap:#x} failed: {reason}")]
    JoinFailed { bootstrap: Identifier, reason: String },
    #[error("identifier {id:#x} does not fit in a {bits}-bit ring")]
    IdOutOfRange { id: Identifier, bits: u32 },
    #[error("node {0:#x} already exists")]
    DuplicateNode(Identifier),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn maintenance worker: {0}")]
    WorkerSpawn(String),
}

impl ChordError {
    /// Both flavours of "the peer did not answer". The failure detector
    /// treats them the same way.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ChordError::Unreachable(_) | ChordError::NodeDead(_))
    }

    pub fn unreachable_id(&self) -> Option<Identifier> {
        match self {
            ChordError::Unreachable(id) | ChordError::NodeDead(id) => Some(*id),
            _ => None,
        }
    }
}

pub type ChordResult<T> = Result<T, ChordError>;

/// Modular arithmetic over a `bits`-bit identifier ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpace {
    bits: u32,
}

impl IdSpace {
    pub fn new(bits: u32) -> ChordResult<IdSpace> {
        if bits == 0 || bits > 64 {
            return Err(ChordError::InvalidConfig(format!(
                "id_space_bits must be within 1..=64, got {}",
                bits
            )));
        }
        Ok(IdSpace { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of identifiers on the ring (2^m).
    pub fn size(&self) -> u128 {
        1u128 << self.bits
    }

    pub fn max_id(&self) -> Identifier {
        (self.size() - 1) as Identifier
    }

    pub fn contains(&self, id: Identifier) -> bool {
        (id as u128) < self.size()
    }

    pub fn check(&self, id: Identifier) -> ChordResult<Identifier> {
        if self.contains(id) {
            Ok(id)
        } else {
            Err(ChordError::IdOutOfRange { id, bits: self.bits })
        }
    }

    pub fn add(&self, id: Identifier, delta: u128) -> Identifier {
        ((id as u128 + delta) % self.size()) as Identifier
    }

    /// `(id + 2^i) mod 2^m`, the start of finger interval `i`.
    pub fn add_pow2(&self, id: Identifier, i: u32) -> Identifier {
        self.add(id, 1u128 << i)
    }

    /// Clockwise distance walking from `from` to `to`. Zero when they match.
    pub fn distance(&self, from: Identifier, to: Identifier) -> u128 {
        let size = self.size();
        (to as u128 + size - from as u128) % size
    }
}

/// `x` lies strictly inside the clockwise arc from `a` to `b`.
/// With `a == b` the arc is the whole ring minus `a`.
pub fn between_exclusive(x: Identifier, a: Identifier, b: Identifier) -> bool {
    if a < b {
        a < x && x < b
    } else {
        x > a || x < b
    }
}

/// Same arc as `between_exclusive` but `b` itself is included.
/// With `a == b` every identifier qualifies.
pub fn between_right_inclusive(x: Identifier, a: Identifier, b: Identifier) -> bool {
    if a < b {
        a < x && x <= b
    } else {
        x > a || x <= b
    }
}

// Maps an arbitrary string onto the ring: low m bits of a DefaultHasher digest.
// Not used by the ring itself, which only ever sees identifiers.
pub fn hash_str_to_id(input_str: &str, space: &IdSpace) -> Identifier {
    let mut hasher = DefaultHasher::new();
    for elem in input_str.as_bytes() {
        hasher.write_u8(*elem);
    }
    let hash_val = hasher.finish();
    if space.bits() == 64 {
        hash_val
    } else {
        hash_val & space.max_id()
    }
}

pub fn conv_id_to_ratio_str(id: Identifier, space: &IdSpace) -> String {
    let ratio = (id as f64 / space.max_id().max(1) as f64) * 100.0;
    format!("{:.4}", ratio)
}

pub fn gen_debug_str_of_node(node_id: Identifier, space: &IdSpace) -> String {
    format!("{:X},{}", node_id, conv_id_to_ratio_str(node_id, space))
}

pub fn gen_debug_str_of_data(data_id: Identifier, space: &IdSpace) -> String {
    format!("{:X},{}", data_id, conv_id_to_ratio_str(data_id, space))
}
