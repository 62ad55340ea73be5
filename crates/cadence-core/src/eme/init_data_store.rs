//! Store associating initialization data to arbitrary values
//!
//! Lookups use the initialization data compatibility relation, not strict
//! equality. Entries are kept in insertion order, the most recently reused
//! ones last.

use crate::eme::key_session_record::FormattedInitData;
use crate::eme::types::InitializationData;

struct Entry<T> {
    formatted: FormattedInitData,
    init_data: InitializationData,
    value: T,
}

pub struct InitDataStore<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for InitDataStore<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> InitDataStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_index(&self, formatted: &FormattedInitData) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.formatted.is_compatible_with(formatted))
    }

    pub fn get(&self, init_data: &InitializationData) -> Option<&T> {
        let formatted = FormattedInitData::new(init_data);
        self.find_index(&formatted).map(|idx| &self.entries[idx].value)
    }

    /// Like [`InitDataStore::get`], also moving the entry to the end
    pub fn get_and_reuse(&mut self, init_data: &InitializationData) -> Option<&T> {
        let formatted = FormattedInitData::new(init_data);
        let idx = self.find_index(&formatted)?;
        let entry = self.entries.remove(idx);
        self.entries.push(entry);
        self.entries.last().map(|entry| &entry.value)
    }

    /// Add a value, replacing the one of a compatible entry
    pub fn store(&mut self, init_data: &InitializationData, value: T) {
        let formatted = FormattedInitData::new(init_data);
        if let Some(idx) = self.find_index(&formatted) {
            self.entries.remove(idx);
        }
        self.entries.push(Entry {
            formatted,
            init_data: init_data.clone(),
            value,
        });
    }

    /// Add a value only if no compatible entry exists.
    ///
    /// Returns `false` if one did, in which case nothing changed.
    pub fn store_if_none(&mut self, init_data: &InitializationData, value: T) -> bool {
        let formatted = FormattedInitData::new(init_data);
        if self.find_index(&formatted).is_some() {
            return false;
        }
        self.entries.push(Entry {
            formatted,
            init_data: init_data.clone(),
            value,
        });
        true
    }

    pub fn remove(&mut self, init_data: &InitializationData) -> Option<T> {
        let formatted = FormattedInitData::new(init_data);
        let idx = self.find_index(&formatted)?;
        Some(self.entries.remove(idx).value)
    }

    pub fn get_all(&self) -> impl Iterator<Item = (&InitializationData, &T)> {
        self.entries.iter().map(|entry| (&entry.init_data, &entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eme::types::InitDataValue;

    fn init_data(system_id: &str, data: &'static [u8]) -> InitializationData {
        InitializationData::new(Some("cenc"), vec![InitDataValue::new(Some(system_id), data)])
    }

    #[test]
    fn test_store_if_none() {
        let mut store = InitDataStore::new();
        assert!(store.store_if_none(&init_data("aa", b"1"), true));
        assert!(!store.store_if_none(&init_data("aa", b"1"), false));
        assert_eq!(store.get(&init_data("aa", b"1")), Some(&true));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_and_reuse_moves_to_end() {
        let mut store = InitDataStore::new();
        store.store(&init_data("aa", b"1"), 1);
        store.store(&init_data("bb", b"2"), 2);
        assert_eq!(store.get_and_reuse(&init_data("aa", b"1")), Some(&1));

        let order: Vec<i32> = store.get_all().map(|(_, v)| *v).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_store_replaces_and_remove() {
        let mut store = InitDataStore::new();
        store.store(&init_data("aa", b"1"), "first");
        store.store(&init_data("aa", b"1"), "second");
        assert_eq!(store.len(), 1);
        assert_eq!(store.remove(&init_data("aa", b"1")), Some("second"));
        assert!(store.is_empty());
        assert_eq!(store.remove(&init_data("aa", b"1")), None);
    }
}
