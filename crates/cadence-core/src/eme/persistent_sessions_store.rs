//! Persisted license sessions
//!
//! Keeps track of the session ids of persistent-license sessions so they can
//! be loaded again in a later playback. Records go through a user-provided
//! [`LicenseStorage`] with a synchronous `save`/`load` interface.
//!
//! Four record versions exist. All of them are read back, but only the
//! latest is written and matched against new initialization data: older
//! ones identified content through a hash of the whole init data, which is
//! not reliable enough to load a license with.

use crate::eme::key_session_record::HashedValue;
use crate::eme::types::InitializationData;
use crate::error::{Error, Result};
use crate::utils::hash_buffer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Storage collaborator persisting session records
pub trait LicenseStorage: Send + Sync {
    fn save(&self, records: &[PersistedSessionRecord]) -> Result<()>;

    fn load(&self) -> Result<Vec<PersistedSessionRecord>>;
}

/// Base64 encoded init data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Data(pub Vec<u8>);

impl Serialize for Base64Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Base64Data)
            .map_err(serde::de::Error::custom)
    }
}

/// Record version marker, only deserializes from its own number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version<const N: u8>;

impl<const N: u8> Serialize for Version<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(N)
    }
}

impl<'de, const N: u8> Deserialize<'de> for Version<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let version = u8::deserialize(deserializer)?;
        if version == N {
            Ok(Version)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {N}, got {version}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    pub init_data: Base64Data,
    pub init_data_hash: i32,
}

/// Current format: one entry per key system value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordV3 {
    pub version: Version<3>,
    pub session_id: String,
    pub values: Vec<PersistedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_data_type: Option<String>,
}

/// Whole init data, base64 encoded, with its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordV2 {
    pub version: Version<2>,
    pub session_id: String,
    pub init_data: Base64Data,
    pub init_data_hash: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_data_type: Option<String>,
}

/// Hash of the whole init data only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordV1 {
    pub version: Version<1>,
    pub session_id: String,
    pub init_data: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_data_type: Option<String>,
}

/// Unversioned records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordV0 {
    pub session_id: String,
    pub init_data: i32,
}

/// A persisted session, in any of the known formats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistedSessionRecord {
    V3(RecordV3),
    V2(RecordV2),
    V1(RecordV1),
    V0(RecordV0),
}

impl PersistedSessionRecord {
    pub fn session_id(&self) -> &str {
        match self {
            PersistedSessionRecord::V3(r) => &r.session_id,
            PersistedSessionRecord::V2(r) => &r.session_id,
            PersistedSessionRecord::V1(r) => &r.session_id,
            PersistedSessionRecord::V0(r) => &r.session_id,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            PersistedSessionRecord::V3(_) => 3,
            PersistedSessionRecord::V2(_) => 2,
            PersistedSessionRecord::V1(_) => 1,
            PersistedSessionRecord::V0(_) => 0,
        }
    }

    fn init_data_type(&self) -> Option<&str> {
        match self {
            PersistedSessionRecord::V3(r) => r.init_data_type.as_deref(),
            PersistedSessionRecord::V2(r) => r.init_data_type.as_deref(),
            PersistedSessionRecord::V1(r) => r.init_data_type.as_deref(),
            PersistedSessionRecord::V0(_) => None,
        }
    }

    fn new_v3(session_id: &str, init_data: &InitializationData) -> Self {
        PersistedSessionRecord::V3(RecordV3 {
            version: Version,
            session_id: session_id.to_string(),
            values: init_data
                .values
                .iter()
                .map(|v| PersistedValue {
                    system_id: v.system_id.clone(),
                    init_data: Base64Data(v.data.to_vec()),
                    init_data_hash: hash_buffer(&v.data),
                })
                .collect(),
            init_data_type: init_data.init_data_type.clone(),
        })
    }

    /// Whether every value of `hashed` is found in this record
    fn contains(&self, hashed: &[HashedValue]) -> bool {
        let PersistedSessionRecord::V3(record) = self else {
            return false;
        };
        hashed.iter().all(|value| {
            record.values.iter().any(|stored| {
                stored.system_id == value.system_id
                    && stored.init_data_hash == value.hash
                    && stored.init_data.0 == value.data.as_ref()
            })
        })
    }
}

/// Durable index of persistent-license session ids
pub struct PersistentSessionsStore {
    storage: std::sync::Arc<dyn LicenseStorage>,
    entries: Mutex<Vec<PersistedSessionRecord>>,
}

impl PersistentSessionsStore {
    /// Create a store, reading back what the storage holds.
    ///
    /// An unreadable storage is reset.
    pub fn new(storage: std::sync::Arc<dyn LicenseStorage>) -> Self {
        let store = Self {
            storage,
            entries: Mutex::new(Vec::new()),
        };
        match store.storage.load() {
            Ok(entries) => *store.entries.lock() = entries,
            Err(err) => {
                warn!(error = %err, "EME-PSS: Could not get entries from license storage");
                store.dispose();
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records in the order the sessions were persisted
    pub fn get_all(&self) -> Vec<PersistedSessionRecord> {
        self.entries.lock().clone()
    }

    pub fn get(&self, init_data: &InitializationData) -> Option<PersistedSessionRecord> {
        let entries = self.entries.lock();
        find_index(&entries, init_data).map(|idx| entries[idx].clone())
    }

    /// Like [`PersistentSessionsStore::get`], also moving the record last
    pub fn get_and_reuse(&self, init_data: &InitializationData) -> Option<PersistedSessionRecord> {
        let mut entries = self.entries.lock();
        let idx = find_index(&entries, init_data)?;
        let record = entries.remove(idx);
        entries.push(record.clone());
        Some(record)
    }

    /// Persist a session id for this initialization data.
    ///
    /// A record with another session id for compatible data is replaced.
    pub fn add(&self, init_data: &InitializationData, session_id: &str) {
        if session_id.is_empty() {
            warn!("EME-PSS: Invalid persistent session given");
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(idx) = find_index(&entries, init_data) {
            if entries[idx].session_id() == session_id {
                return;
            }
            warn!(session_id = entries[idx].session_id(), "EME-PSS: Delete session from store");
            entries.remove(idx);
        }
        info!(session_id, "EME-PSS: Add new session");
        entries.push(PersistedSessionRecord::new_v3(session_id, init_data));
        self.save(&entries);
    }

    pub fn delete(&self, init_data: &InitializationData) {
        let mut entries = self.entries.lock();
        match find_index(&entries, init_data) {
            Some(idx) => {
                warn!(session_id = entries[idx].session_id(), "EME-PSS: Delete session from store");
                entries.remove(idx);
                self.save(&entries);
            }
            None => warn!("EME-PSS: initData to delete not found"),
        }
    }

    /// Remove the `count` oldest records
    pub fn delete_old_sessions(&self, count: usize) {
        info!(count, "EME-PSS: Deleting oldest sessions");
        if count == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if count <= entries.len() {
            entries.drain(..count);
        } else {
            warn!(
                count,
                len = entries.len(),
                "EME-PSS: Asked to remove more information than it contains"
            );
            entries.clear();
        }
        self.save(&entries);
    }

    /// Remove every record
    pub fn dispose(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.save(&entries);
    }

    fn save(&self, entries: &[PersistedSessionRecord]) {
        if let Err(err) = self.storage.save(entries) {
            warn!(error = %err, "EME-PSS: Could not save licenses in storage");
        }
    }
}

fn find_index(entries: &[PersistedSessionRecord], init_data: &InitializationData) -> Option<usize> {
    let hashed: Vec<HashedValue> = init_data.values.iter().map(HashedValue::new).collect();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.init_data_type() != init_data.init_data_type.as_deref() {
            continue;
        }
        if entry.version() < 3 {
            warn!(
                version = entry.version(),
                "EME-PSS: Session persisted with an older format version, it cannot be used anymore"
            );
            continue;
        }
        if entry.contains(&hashed) {
            return Some(idx);
        }
    }
    None
}

/// License storage kept in memory, mostly useful for tests and short-lived
/// players
#[derive(Default)]
pub struct MemoryLicenseStorage {
    records: Mutex<Vec<PersistedSessionRecord>>,
}

impl MemoryLicenseStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<PersistedSessionRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl LicenseStorage for MemoryLicenseStorage {
    fn save(&self, records: &[PersistedSessionRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<PersistedSessionRecord>> {
        Ok(self.records.lock().clone())
    }
}

/// License storage backed by a JSON file
pub struct JsonFileLicenseStorage {
    path: PathBuf,
}

impl JsonFileLicenseStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LicenseStorage for JsonFileLicenseStorage {
    fn save(&self, records: &[PersistedSessionRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| Error::Internal(format!("Could not serialize sessions: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| Error::Internal(format!("Could not write {}: {e}", self.path.display())))
    }

    fn load(&self) -> Result<Vec<PersistedSessionRecord>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Could not read {}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&data)
            .map_err(|e| Error::Internal(format!("Invalid license storage content: {e}")))
    }
}
