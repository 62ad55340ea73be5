//! Compatibility relation between initialization data
//!
//! Two initialization data are considered compatible (i.e. handled by the
//! same session) when they share at least one system id and every system id
//! they share carries the same data. This is deliberately looser than strict
//! equality: a manifest may announce the PSSH of two key systems where the
//! media only carries one of them.

use crate::eme::types::{InitDataValue, InitializationData, KeyId};
use crate::utils::hash_buffer;
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Ordering;

/// Init data value with its hash, ready for fast comparisons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedValue {
    pub system_id: Option<String>,
    pub hash: i32,
    pub data: Bytes,
}

impl HashedValue {
    pub fn new(value: &InitDataValue) -> Self {
        Self {
            system_id: value.system_id.clone(),
            hash: hash_buffer(&value.data),
            data: value.data.clone(),
        }
    }

    fn same_data(&self, other: &HashedValue) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

/// Known system ids first, in lexicographic order, unknown ones last
fn compare_system_ids(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sort values by system id and hash them
pub fn format_values(values: &[InitDataValue]) -> Vec<HashedValue> {
    let mut formatted: Vec<HashedValue> = values.iter().map(HashedValue::new).collect();
    formatted.sort_by(|a, b| compare_system_ids(&a.system_id, &b.system_id));
    formatted
}

/// Compatibility of two sorted value lists.
///
/// Unknown system ids never conflict: they match another unknown-system
/// value only through identical data.
pub fn are_values_compatible(a: &[HashedValue], b: &[HashedValue]) -> bool {
    let mut overlap = false;

    for value in a.iter().filter(|v| v.system_id.is_none()) {
        if b.iter().any(|other| other.system_id.is_none() && other.same_data(value)) {
            overlap = true;
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (left, right) = (&a[i], &b[j]);
        if left.system_id.is_none() || right.system_id.is_none() {
            break;
        }
        match compare_system_ids(&left.system_id, &right.system_id) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                if !left.same_data(right) {
                    // Multiple values per system id: look for any equal one
                    let system_id = &left.system_id;
                    let found = b[j..]
                        .iter()
                        .take_while(|v| &v.system_id == system_id)
                        .any(|v| v.same_data(left));
                    if !found {
                        return false;
                    }
                }
                overlap = true;
                i += 1;
            }
        }
    }
    overlap
}

/// Returns true if all key ids in `wanted` are present in `key_ids`
pub fn are_all_key_ids_contained_in(wanted: &[KeyId], key_ids: &[KeyId]) -> bool {
    wanted.iter().all(|w| key_ids.contains(w))
}

/// Returns true if at least one key id in `wanted` is present in `key_ids`
pub fn are_some_key_ids_contained_in(wanted: &[KeyId], key_ids: &[KeyId]) -> bool {
    wanted.iter().any(|w| key_ids.contains(w))
}

/// Initialization data pre-formatted for repeated compatibility checks
#[derive(Debug, Clone)]
pub struct FormattedInitData {
    pub init_data_type: Option<String>,
    pub values: Vec<HashedValue>,
}

impl FormattedInitData {
    pub fn new(init_data: &InitializationData) -> Self {
        Self {
            init_data_type: init_data.init_data_type.clone(),
            values: format_values(&init_data.values),
        }
    }

    pub fn is_compatible_with(&self, other: &FormattedInitData) -> bool {
        self.init_data_type == other.init_data_type && are_values_compatible(&self.values, &other.values)
    }
}

/// Key-related information linked to a loaded session.
///
/// Besides the initialization data the session was created for, key ids
/// later found in its license can be associated to the record, making any
/// future initialization data announcing those key ids compatible with it.
#[derive(Debug)]
pub struct KeySessionRecord {
    init_data: InitializationData,
    formatted: FormattedInitData,
    key_ids: RwLock<Option<Vec<KeyId>>>,
}

impl KeySessionRecord {
    pub fn new(init_data: InitializationData) -> Self {
        let formatted = FormattedInitData::new(&init_data);
        Self {
            init_data,
            formatted,
            key_ids: RwLock::new(None),
        }
    }

    pub fn init_data(&self) -> &InitializationData {
        &self.init_data
    }

    /// Associate key ids, replacing the previous association
    pub fn associate_key_ids(&self, key_ids: &[KeyId]) {
        let mut deduped: Vec<KeyId> = Vec::with_capacity(key_ids.len());
        for key_id in key_ids {
            if !deduped.contains(key_id) {
                deduped.push(key_id.clone());
            }
        }
        *self.key_ids.write() = Some(deduped);
    }

    pub fn is_compatible_with(&self, init_data: &InitializationData) -> bool {
        if let Some(wanted) = &init_data.key_ids {
            if let Some(associated) = self.key_ids.read().as_ref() {
                if are_all_key_ids_contained_in(wanted, associated) {
                    return true;
                }
            }
            if let Some(own) = &self.init_data.key_ids {
                return are_all_key_ids_contained_in(wanted, own);
            }
        }
        self.formatted.is_compatible_with(&FormattedInitData::new(init_data))
    }
}
