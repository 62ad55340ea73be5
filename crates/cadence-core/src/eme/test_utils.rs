//! Scriptable in-memory implementation of the platform traits

use crate::eme::platform::{
    EncryptedEvent, KeySystemAccessProvider, MediaElement, MediaKeySession, MediaKeySystemAccess,
    MediaKeySystemConfiguration, MediaKeys, PlatformResult, SessionEvent,
};
use crate::eme::types::{KeyId, KeyStatus, SessionType};
use crate::error::PlatformError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// What a mock session does on its own
#[derive(Debug, Clone, Default)]
pub struct SessionBehavior {
    /// License request sent right after `generate_request`
    pub message_on_generate: Option<Bytes>,
    /// Key statuses set (and announced) on each successful `update`
    pub statuses_on_update: Vec<(KeyId, KeyStatus)>,
    pub generate_request_error: Option<PlatformError>,
    pub update_error: Option<PlatformError>,
    /// Result of `load`
    pub load_result: Option<bool>,
    /// Key statuses a successfully loaded session comes with
    pub statuses_on_load: Vec<(KeyId, KeyStatus)>,
}

#[derive(Default)]
struct SessionState {
    session_id: String,
    key_statuses: Vec<(KeyId, KeyStatus)>,
    close_failures: VecDeque<PlatformError>,
    close_calls: u32,
    generate_requests: Vec<(Option<String>, Bytes)>,
    updates: Vec<Bytes>,
    loads: Vec<String>,
}

pub struct MockSession {
    session_type: SessionType,
    behavior: SessionBehavior,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    closed: watch::Sender<bool>,
}

impl MockSession {
    pub fn new(session_type: SessionType) -> Arc<Self> {
        Self::with_behavior(session_type, SessionBehavior::default())
    }

    pub fn with_behavior(session_type: SessionType, behavior: SessionBehavior) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            session_type,
            behavior,
            state: Mutex::new(SessionState::default()),
            events,
            closed,
        })
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.state.lock().session_id = session_id.to_string();
    }

    pub fn set_key_statuses(&self, statuses: Vec<(KeyId, KeyStatus)>) {
        self.state.lock().key_statuses = statuses;
    }

    pub fn fail_next_closes(&self, errors: Vec<PlatformError>) {
        self.state.lock().close_failures = errors.into();
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn generate_requests(&self) -> Vec<(Option<String>, Bytes)> {
        self.state.lock().generate_requests.clone()
    }

    pub fn updates(&self) -> Vec<Bytes> {
        self.state.lock().updates.clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.state.lock().loads.clone()
    }
}

#[async_trait]
impl MediaKeySession for MockSession {
    fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.state.lock().key_statuses.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn generate_request(&self, init_data_type: Option<&str>, init_data: &[u8]) -> PlatformResult<()> {
        if let Some(err) = &self.behavior.generate_request_error {
            return Err(err.clone());
        }
        {
            let mut state = self.state.lock();
            state
                .generate_requests
                .push((init_data_type.map(str::to_string), Bytes::copy_from_slice(init_data)));
            if state.session_id.is_empty() {
                let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                state.session_id = format!("mock-session-{id}");
            }
        }
        if let Some(message) = &self.behavior.message_on_generate {
            self.emit(SessionEvent::Message {
                message_type: Some("license-request".into()),
                message: message.clone(),
            });
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> PlatformResult<bool> {
        let loaded = self.behavior.load_result.unwrap_or(false);
        let mut state = self.state.lock();
        state.loads.push(session_id.to_string());
        if loaded {
            state.session_id = session_id.to_string();
            state.key_statuses = self.behavior.statuses_on_load.clone();
        }
        Ok(loaded)
    }

    async fn update(&self, license: &[u8]) -> PlatformResult<()> {
        if let Some(err) = &self.behavior.update_error {
            return Err(err.clone());
        }
        let announce = {
            let mut state = self.state.lock();
            state.updates.push(Bytes::copy_from_slice(license));
            if self.behavior.statuses_on_update.is_empty() {
                false
            } else {
                state.key_statuses = self.behavior.statuses_on_update.clone();
                true
            }
        };
        if announce {
            self.emit(SessionEvent::KeyStatusesChange);
        }
        Ok(())
    }

    async fn close(&self) -> PlatformResult<()> {
        let failure = {
            let mut state = self.state.lock();
            state.close_calls += 1;
            state.close_failures.pop_front()
        };
        if let Some(err) = failure {
            return Err(err);
        }
        self.closed.send_replace(true);
        Ok(())
    }

    async fn closed(&self) -> PlatformResult<()> {
        let mut rx = self.closed.subscribe();
        rx.wait_for(|closed| *closed)
            .await
            .map(|_| ())
            .map_err(|_| PlatformError::new("AbortError", "session dropped"))
    }
}

/// MediaKeys creating [`MockSession`]s
pub struct MockMediaKeys {
    behavior: Mutex<SessionBehavior>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    certificates: Mutex<Vec<Bytes>>,
    certificate_error: Mutex<Option<PlatformError>>,
}

impl MockMediaKeys {
    pub fn new(behavior: SessionBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            sessions: Mutex::new(Vec::new()),
            certificates: Mutex::new(Vec::new()),
            certificate_error: Mutex::new(None),
        })
    }

    pub fn set_behavior(&self, behavior: SessionBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn fail_certificate(&self, err: Option<PlatformError>) {
        *self.certificate_error.lock() = err;
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn certificates(&self) -> Vec<Bytes> {
        self.certificates.lock().clone()
    }
}

#[async_trait]
impl MediaKeys for MockMediaKeys {
    fn create_session(&self, session_type: SessionType) -> PlatformResult<Arc<dyn MediaKeySession>> {
        let session = MockSession::with_behavior(session_type, self.behavior.lock().clone());
        self.sessions.lock().push(session.clone());
        Ok(session)
    }

    async fn set_server_certificate(&self, certificate: &[u8]) -> PlatformResult<bool> {
        if let Some(err) = self.certificate_error.lock().clone() {
            return Err(err);
        }
        self.certificates.lock().push(Bytes::copy_from_slice(certificate));
        Ok(true)
    }
}

pub struct MockAccess {
    key_system: String,
    configuration: MediaKeySystemConfiguration,
    media_keys: Arc<MockMediaKeys>,
    create_calls: AtomicU32,
}

impl MockAccess {
    pub fn media_keys(&self) -> Arc<MockMediaKeys> {
        self.media_keys.clone()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaKeySystemAccess for MockAccess {
    fn key_system(&self) -> String {
        self.key_system.clone()
    }

    fn configuration(&self) -> MediaKeySystemConfiguration {
        self.configuration.clone()
    }

    async fn create_media_keys(&self) -> PlatformResult<Arc<dyn MediaKeys>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.media_keys.clone())
    }
}

/// Platform supporting a fixed set of key systems
pub struct MockProvider {
    accesses: HashMap<String, Arc<MockAccess>>,
    requests: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            accesses: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Support `key_system` with the given session types
    pub fn support(
        mut self,
        key_system: &str,
        session_types: Vec<SessionType>,
        behavior: SessionBehavior,
    ) -> Self {
        let access = Arc::new(MockAccess {
            key_system: key_system.to_string(),
            configuration: MediaKeySystemConfiguration {
                init_data_types: vec!["cenc".into()],
                session_types,
                ..Default::default()
            },
            media_keys: MockMediaKeys::new(behavior),
            create_calls: AtomicU32::new(0),
        });
        self.accesses.insert(key_system.to_string(), access);
        self
    }

    pub fn access(&self, key_system: &str) -> Option<Arc<MockAccess>> {
        self.accesses.get(key_system).cloned()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl KeySystemAccessProvider for MockProvider {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[MediaKeySystemConfiguration],
    ) -> PlatformResult<Arc<dyn MediaKeySystemAccess>> {
        self.requests.lock().push(key_system.to_string());
        let access = self
            .accesses
            .get(key_system)
            .ok_or_else(|| PlatformError::new("NotSupportedError", key_system))?;
        let wants_persistence = configurations
            .iter()
            .all(|c| c.session_types.contains(&SessionType::PersistentLicense));
        if wants_persistence && !access.configuration.supports_session_type(SessionType::PersistentLicense) {
            return Err(PlatformError::new("NotSupportedError", "no persistent sessions"));
        }
        Ok(access.clone())
    }
}

pub struct MockMediaElement {
    media_keys: Mutex<Option<Arc<dyn MediaKeys>>>,
    set_calls: Mutex<Vec<Option<Arc<dyn MediaKeys>>>>,
    encrypted: broadcast::Sender<EncryptedEvent>,
}

impl MockMediaElement {
    pub fn new() -> Arc<Self> {
        let (encrypted, _) = broadcast::channel(16);
        Arc::new(Self {
            media_keys: Mutex::new(None),
            set_calls: Mutex::new(Vec::new()),
            encrypted,
        })
    }

    pub fn emit_encrypted(&self, init_data_type: Option<&str>, init_data: Bytes) {
        let _ = self.encrypted.send(EncryptedEvent {
            init_data_type: init_data_type.map(str::to_string),
            init_data: Some(init_data),
        });
    }

    /// Every `set_media_keys` call, `None` for detachments
    pub fn set_calls(&self) -> Vec<Option<Arc<dyn MediaKeys>>> {
        self.set_calls.lock().clone()
    }
}

#[async_trait]
impl MediaElement for MockMediaElement {
    fn media_keys(&self) -> Option<Arc<dyn MediaKeys>> {
        self.media_keys.lock().clone()
    }

    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> PlatformResult<()> {
        self.set_calls.lock().push(media_keys.clone());
        *self.media_keys.lock() = media_keys;
        Ok(())
    }

    fn subscribe_encrypted(&self) -> broadcast::Receiver<EncryptedEvent> {
        self.encrypted.subscribe()
    }
}
