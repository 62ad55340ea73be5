//! Encrypted Media Extensions
//!
//! Key system negotiation, session lifecycle and license acquisition for
//! encrypted contents. The platform API is abstracted by the traits in
//! [`platform`], [`EmeManager`] drives everything for one content.

pub mod close_session;
pub mod get_session;
pub mod init_data_store;
pub mod key_session_record;
pub mod key_statuses;
pub mod loaded_sessions_store;
pub mod manager;
pub mod media_keys;
pub mod persistent_sessions_store;
pub mod platform;
pub mod server_certificate;
pub mod session_events_listener;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use init_data_store::InitDataStore;
pub use loaded_sessions_store::{LoadedSessionsStore, StoredSessionEntry};
pub use manager::{dispose_eme, EmeManager};
pub use media_keys::{MediaKeysInfos, MediaKeysInfosStore, MediaKeysState};
pub use persistent_sessions_store::{
    JsonFileLicenseStorage, LicenseStorage, MemoryLicenseStorage, PersistedSessionRecord,
    PersistentSessionsStore,
};
pub use platform::{
    EncryptedEvent, KeySystemAccessProvider, MediaElement, MediaKeySession, MediaKeySystemAccess,
    MediaKeySystemConfiguration, MediaKeys, SessionEvent,
};
pub use types::{
    EmeEvent, InitDataValue, InitializationData, KeyStatus, KeySystem, KeySystemOption,
    KeysUpdate, SessionType,
};
