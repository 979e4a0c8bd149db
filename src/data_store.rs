use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chord_util::{self, Identifier};

pub type Value = Vec<u8>;

/// One store entry as it travels between nodes. `value_data` is `None` for
/// a deleted key, so the deletion replicates like any other write.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataIdAndValue {
    pub data_id: Identifier,
    pub value_data: Option<Value>,
}

impl DataIdAndValue {
    pub fn new(data_id: Identifier, value_data: Value) -> DataIdAndValue {
        DataIdAndValue {
            data_id,
            value_data: Some(value_data),
        }
    }

    pub fn deleted(data_id: Identifier) -> DataIdAndValue {
        DataIdAndValue {
            data_id,
            value_data: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.value_data.is_none()
    }
}

/// Local key/value map of one node. Owned keys and replicas live side by side;
/// which is which only follows from the node's current predecessor.
/// Deleted keys stay behind as tombstones so a stale copy handed back later
/// cannot bring them back.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    stored_data: BTreeMap<Identifier, Option<Value>>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore {
            stored_data: BTreeMap::new(),
        }
    }

    /// Returns true when an older entry was overwritten.
    pub fn store_one_iv(&mut self, data_id: Identifier, value_data: Value) -> bool {
        self.stored_data.insert(data_id, Some(value_data)).is_some()
    }

    /// Returns true when the entry was inserted. A tombstone counts as present.
    pub fn store_if_absent(&mut self, iv: DataIdAndValue) -> bool {
        if self.stored_data.contains_key(&iv.data_id) {
            return false;
        }
        self.stored_data.insert(iv.data_id, iv.value_data);
        true
    }

    pub fn store_iv_with_vec(&mut self, iv_vec: Vec<DataIdAndValue>) {
        for each_iv in iv_vec {
            self.stored_data.insert(each_iv.data_id, each_iv.value_data);
        }
    }

    /// Replaces the entry with a tombstone and returns the live value it held.
    pub fn mark_deleted(&mut self, data_id: Identifier) -> Option<Value> {
        self.stored_data.insert(data_id, None).flatten()
    }

    pub fn get(&self, data_id: Identifier) -> Option<Value> {
        self.stored_data.get(&data_id).cloned().flatten()
    }

    /// The raw entry, tombstone included.
    pub fn get_iv(&self, data_id: Identifier) -> Option<DataIdAndValue> {
        self.stored_data.get(&data_id).map(|value| DataIdAndValue {
            data_id,
            value_data: value.clone(),
        })
    }

    pub fn remove_keys(&mut self, data_ids: &[Identifier]) {
        for data_id in data_ids {
            self.stored_data.remove(data_id);
        }
    }

    fn collect_iv<P>(&self, pred: P) -> Vec<DataIdAndValue>
    where
        P: Fn(Identifier) -> bool,
    {
        self.stored_data
            .iter()
            .filter(|(data_id, _)| pred(**data_id))
            .map(|(data_id, value)| DataIdAndValue {
                data_id: *data_id,
                value_data: value.clone(),
            })
            .collect()
    }

    /// Entries in `(lower, upper]` walking clockwise. `lower == upper` means
    /// the whole ring.
    pub fn get_iv_in_range(&self, lower: Identifier, upper: Identifier) -> Vec<DataIdAndValue> {
        self.collect_iv(|data_id| chord_util::between_right_inclusive(data_id, lower, upper))
    }

    /// Entries a node with predecessor `pred_id` is responsible for.
    pub fn get_iv_with_pred_self_id(&self, pred_id: Identifier, self_id: Identifier) -> Vec<DataIdAndValue> {
        self.get_iv_in_range(pred_id, self_id)
    }

    /// Entries outside `(pred_id, self_id]`.
    pub fn get_iv_out_of_charge(&self, pred_id: Identifier, self_id: Identifier) -> Vec<DataIdAndValue> {
        self.collect_iv(|data_id| !chord_util::between_right_inclusive(data_id, pred_id, self_id))
    }

    pub fn all_iv(&self) -> Vec<DataIdAndValue> {
        self.collect_iv(|_| true)
    }

    /// Keys holding a live value.
    pub fn keys(&self) -> Vec<Identifier> {
        self.stored_data
            .iter()
            .filter(|(_, value)| value.is_some())
            .map(|(data_id, _)| *data_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stored_data.values().filter(|value| value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
