//! Platform encryption API surface
//!
//! These traits are implemented by the embedder's bindings to the CDM
//! (browser EME, a native CDM, or a test double). The player core never
//! talks to the platform in any other way.

use crate::eme::types::{KeyId, KeyStatus, SessionType};
use crate::error::PlatformError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Requirement level of an optional CDM feature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKeysRequirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// Wanted (or granted) capabilities of a key system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaKeySystemConfiguration {
    pub init_data_types: Vec<String>,
    pub session_types: Vec<SessionType>,
    pub persistent_state: MediaKeysRequirement,
    pub distinctive_identifier: MediaKeysRequirement,
}

impl MediaKeySystemConfiguration {
    pub fn supports_session_type(&self, session_type: SessionType) -> bool {
        self.session_types.contains(&session_type)
    }
}

/// Event sent by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// License request (or renewal, release...) message
    Message {
        /// `None` is treated as "license-request"
        message_type: Option<String>,
        message: Bytes,
    },
    /// The key status map changed
    KeyStatusesChange,
    /// Native key error
    KeyError(String),
}

/// Per-content-key negotiation handle
#[async_trait]
pub trait MediaKeySession: Send + Sync {
    /// Empty until the CDM initialized the session
    fn session_id(&self) -> String;

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)>;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn generate_request(
        &self,
        init_data_type: Option<&str>,
        init_data: &[u8],
    ) -> PlatformResult<()>;

    /// Load a persisted session, `false` if nothing was stored for that id
    async fn load(&self, session_id: &str) -> PlatformResult<bool>;

    async fn update(&self, license: &[u8]) -> PlatformResult<()>;

    async fn close(&self) -> PlatformResult<()>;

    /// Resolves once the session is closed, whatever closed it
    async fn closed(&self) -> PlatformResult<()>;
}

/// Set of keys bound to a key system, from which sessions are created
#[async_trait]
pub trait MediaKeys: Send + Sync {
    fn create_session(&self, session_type: SessionType) -> PlatformResult<Arc<dyn MediaKeySession>>;

    /// `Ok(false)` when the CDM does not use server certificates
    async fn set_server_certificate(&self, certificate: &[u8]) -> PlatformResult<bool>;
}

/// Granted access to a key system
#[async_trait]
pub trait MediaKeySystemAccess: Send + Sync {
    fn key_system(&self) -> String;

    fn configuration(&self) -> MediaKeySystemConfiguration;

    async fn create_media_keys(&self) -> PlatformResult<Arc<dyn MediaKeys>>;
}

/// Entry point of the platform API (`requestMediaKeySystemAccess`)
#[async_trait]
pub trait KeySystemAccessProvider: Send + Sync {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[MediaKeySystemConfiguration],
    ) -> PlatformResult<Arc<dyn MediaKeySystemAccess>>;
}

/// "encrypted" event dispatched by the media element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEvent {
    pub init_data_type: Option<String>,
    pub init_data: Option<Bytes>,
}

/// Media element MediaKeys are attached to
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn media_keys(&self) -> Option<Arc<dyn MediaKeys>>;

    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> PlatformResult<()>;

    fn subscribe_encrypted(&self) -> broadcast::Receiver<EncryptedEvent>;
}

/// Returns true if both handles point to the same platform object
pub fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
