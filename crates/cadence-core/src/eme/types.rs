//! EME data model: initialization data, key system options and events

use crate::eme::persistent_sessions_store::LicenseStorage;
use crate::error::{Error, LicenseError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Key id, as found in key status maps and PSSH boxes
pub type KeyId = Bytes;

/// Hex representation of a key id, for logs and error messages
pub fn key_id_to_hex(key_id: &[u8]) -> String {
    key_id.iter().map(|b| format!("{b:02x}")).collect()
}

/// Known key systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySystem {
    Widevine,
    FairPlay,
    PlayReady,
    ClearKey,
}

impl KeySystem {
    /// Parse the short name users give in their key system options
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "widevine" => Some(KeySystem::Widevine),
            "fairplay" => Some(KeySystem::FairPlay),
            "playready" => Some(KeySystem::PlayReady),
            "clearkey" => Some(KeySystem::ClearKey),
            _ => None,
        }
    }

    /// Returns the system ID (UUID) for PSSH box
    pub fn system_id(&self) -> &'static str {
        match self {
            KeySystem::Widevine => "edef8ba979d64acea3c827dcd51d21ed",
            KeySystem::FairPlay => "94ce86fb07ff4f43adb893d2fa968ca2",
            KeySystem::PlayReady => "9a04f07998404286ab92e65be0885f95",
            KeySystem::ClearKey => "1077efecc0b24d02ace33c1e52e2fb4b",
        }
    }

    /// Key system strings to probe the platform with, most specific first
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            KeySystem::Widevine => &["com.widevine.alpha"],
            KeySystem::FairPlay => &["com.apple.fps.1_0"],
            KeySystem::PlayReady => &[
                "com.microsoft.playready",
                "com.chromecast.playready",
                "com.youtube.playready",
            ],
            KeySystem::ClearKey => &["webkit-org.w3.clearkey", "org.w3.clearkey"],
        }
    }
}

/// Initialization data for a single key system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitDataValue {
    /// Hex encoded system id, `None` if unknown (the data might then even be
    /// a concatenation of several systems' data)
    pub system_id: Option<String>,
    /// The data itself, e.g. a whole PSSH box for "cenc"
    pub data: Bytes,
}

impl InitDataValue {
    pub fn new(system_id: Option<&str>, data: impl Into<Bytes>) -> Self {
        Self {
            system_id: system_id.map(|id| id.to_lowercase().replace('-', "")),
            data: data.into(),
        }
    }
}

/// Opaque key-identifying payload, from an "encrypted" event or from the
/// manifest's content protection descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationData {
    /// Format of the data (e.g. "cenc"), `None` if not known
    pub init_data_type: Option<String>,
    pub values: Vec<InitDataValue>,
    /// Key ids linked to this data, when announced by the manifest
    pub key_ids: Option<Vec<KeyId>>,
}

impl InitializationData {
    pub fn new(init_data_type: Option<&str>, values: Vec<InitDataValue>) -> Self {
        Self {
            init_data_type: init_data_type.map(str::to_string),
            values,
            key_ids: None,
        }
    }

    pub fn with_key_ids(mut self, key_ids: Vec<KeyId>) -> Self {
        self.key_ids = Some(key_ids);
        self
    }

    /// Build initialization data from a raw "encrypted" event payload.
    ///
    /// "cenc" payloads are split into their PSSH boxes so each value carries
    /// its system id. Anything which does not parse as a sequence of PSSH
    /// boxes is kept whole, with an unknown system id.
    pub fn from_encrypted_event(init_data_type: Option<&str>, init_data: Bytes) -> Self {
        let values = match split_pssh_boxes(&init_data) {
            Some(values) if !values.is_empty() => values,
            _ => vec![InitDataValue {
                system_id: None,
                data: init_data,
            }],
        };
        Self::new(init_data_type, values)
    }

    /// Concatenation of every value, as given to `generateRequest`
    pub fn concatenated(&self) -> Bytes {
        if self.values.len() == 1 {
            return self.values[0].data.clone();
        }
        let len = self.values.iter().map(|v| v.data.len()).sum();
        let mut out = Vec::with_capacity(len);
        for value in &self.values {
            out.extend_from_slice(&value.data);
        }
        Bytes::from(out)
    }
}

const PSSH_BOX_TYPE: &[u8; 4] = b"pssh";

/// Split a buffer made of consecutive PSSH boxes, `None` if it is not one
fn split_pssh_boxes(data: &Bytes) -> Option<Vec<InitDataValue>> {
    let mut values = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() < offset + 28 || &data[offset + 4..offset + 8] != PSSH_BOX_TYPE {
            return None;
        }
        let size = u32::from_be_bytes(data[offset..offset + 4].try_into().ok()?) as usize;
        if size < 28 || offset + size > data.len() {
            return None;
        }
        let system_id = key_id_to_hex(&data[offset + 12..offset + 28]);
        values.push(InitDataValue {
            system_id: Some(system_id),
            data: data.slice(offset..offset + size),
        });
        offset += size;
    }
    Some(values)
}

/// Type of session created on a MediaKeys instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Temporary,
    PersistentLicense,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Temporary => "temporary",
            SessionType::PersistentLicense => "persistent-license",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single key in a session's key status map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

/// License request retry configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetLicenseConfig {
    /// Number of retries, the EME configuration default when `None`
    pub retry: Option<u32>,
    /// Timeout in milliseconds, `-1` disables it, the EME configuration
    /// default when `None`
    pub timeout: Option<i64>,
}

impl GetLicenseConfig {
    /// Effective timeout, `None` when disabled
    pub fn timeout_duration(&self, default: Duration) -> Option<Duration> {
        match self.timeout {
            None => Some(default),
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
        }
    }
}

/// Key statuses for which playback may continue on other keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackOn {
    pub key_internal_error: bool,
    pub key_output_restricted: bool,
}

/// Fetches a license for a license request message
#[async_trait]
pub trait LicenseFetcher: Send + Sync {
    /// Returns the license, or `None` when no update is needed
    async fn get_license(
        &self,
        message: Bytes,
        message_type: &str,
    ) -> std::result::Result<Option<Bytes>, LicenseError>;
}

#[async_trait]
impl<F, Fut> LicenseFetcher for F
where
    F: Fn(Bytes, String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Option<Bytes>, LicenseError>> + Send,
{
    async fn get_license(
        &self,
        message: Bytes,
        message_type: &str,
    ) -> std::result::Result<Option<Bytes>, LicenseError> {
        self(message, message_type.to_string()).await
    }
}

/// Optional user hook called on each key status change
#[async_trait]
pub trait KeyStatusesChangeHandler: Send + Sync {
    /// Returns a license to apply to the session, if any
    async fn on_key_statuses_change(
        &self,
        key_statuses: &[(KeyId, KeyStatus)],
        key_system: &str,
    ) -> std::result::Result<Option<Bytes>, String>;
}

/// Configuration of one key system the content may be decrypted with
#[derive(Clone)]
pub struct KeySystemOption {
    /// Short name ("widevine", "playready"...) or full key system string
    pub key_system: String,
    pub get_license: Arc<dyn LicenseFetcher>,
    pub get_license_config: GetLicenseConfig,
    pub server_certificate: Option<Bytes>,
    pub persistent_license: bool,
    pub license_storage: Option<Arc<dyn LicenseStorage>>,
    pub persistent_state_required: bool,
    pub distinctive_identifier_required: bool,
    pub fallback_on: FallbackOn,
    /// `Some(false)` keeps expired keys usable with a warning
    pub throw_on_license_expiration: Option<bool>,
    pub on_key_statuses_change: Option<Arc<dyn KeyStatusesChangeHandler>>,
    /// Overrides the maximum number of live sessions, must be at least 1
    pub max_session_cache_size: Option<usize>,
}

impl KeySystemOption {
    pub fn new(key_system: impl Into<String>, get_license: Arc<dyn LicenseFetcher>) -> Self {
        Self {
            key_system: key_system.into(),
            get_license,
            get_license_config: GetLicenseConfig::default(),
            server_certificate: None,
            persistent_license: false,
            license_storage: None,
            persistent_state_required: false,
            distinctive_identifier_required: false,
            fallback_on: FallbackOn::default(),
            throw_on_license_expiration: None,
            on_key_statuses_change: None,
            max_session_cache_size: None,
        }
    }

    /// Key system strings to probe for this option
    pub fn candidates(&self) -> Vec<String> {
        match KeySystem::from_name(&self.key_system) {
            Some(system) => system.candidates().iter().map(|s| s.to_string()).collect(),
            None => vec![self.key_system.clone()],
        }
    }
}

impl fmt::Debug for KeySystemOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemOption")
            .field("key_system", &self.key_system)
            .field("get_license_config", &self.get_license_config)
            .field("server_certificate", &self.server_certificate.as_ref().map(|c| c.len()))
            .field("persistent_license", &self.persistent_license)
            .field("has_license_storage", &self.license_storage.is_some())
            .field("fallback_on", &self.fallback_on)
            .field("throw_on_license_expiration", &self.throw_on_license_expiration)
            .field("max_session_cache_size", &self.max_session_cache_size)
            .finish()
    }
}

/// How the session handling an initialization data was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoadingType {
    Created,
    LoadedOpenSession,
    LoadedPersistentSession,
}

/// Why a session was updated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    KeyMessage,
    KeyStatusChange,
}

/// Result of a key status evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeysUpdate {
    pub whitelisted: Vec<KeyId>,
    pub blacklisted: Vec<KeyId>,
}

/// Events emitted by the EME manager
#[derive(Debug, Clone)]
pub enum EmeEvent {
    CreatedSession {
        init_data: InitializationData,
        session_type: SessionType,
    },
    LoadedOpenSession {
        init_data: InitializationData,
        session_id: String,
    },
    LoadedPersistentSession {
        init_data: InitializationData,
        session_id: String,
    },
    /// The CDM asked for a license
    SessionMessage {
        message_type: String,
        message: Bytes,
        init_data: InitializationData,
    },
    /// The license fetcher had nothing to apply
    NoUpdate {
        init_data: InitializationData,
    },
    SessionUpdated {
        session_id: String,
        license: Bytes,
        reason: UpdateReason,
    },
    /// Keys which must not be used for decoding
    BlacklistKeys(KeysUpdate),
    /// Every content linked to this initialization data is undecipherable
    BlacklistProtectionData(InitializationData),
    /// Already handled initialization data
    InitDataIgnored(InitializationData),
    Warning(Error),
}

impl EmeEvent {
    /// Short name of the event, for logs and assertions
    pub fn name(&self) -> &'static str {
        match self {
            EmeEvent::CreatedSession { .. } => "created-session",
            EmeEvent::LoadedOpenSession { .. } => "loaded-open-session",
            EmeEvent::LoadedPersistentSession { .. } => "loaded-persistent-session",
            EmeEvent::SessionMessage { .. } => "session-message",
            EmeEvent::NoUpdate { .. } => "no-update",
            EmeEvent::SessionUpdated { .. } => "session-updated",
            EmeEvent::BlacklistKeys(_) => "blacklist-keys",
            EmeEvent::BlacklistProtectionData(_) => "blacklist-protection-data",
            EmeEvent::InitDataIgnored(_) => "init-data-ignored",
            EmeEvent::Warning(_) => "warning",
        }
    }
}
