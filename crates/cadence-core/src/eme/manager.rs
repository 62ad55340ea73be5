//! EME orchestration
//!
//! The manager negotiates MediaKeys for the media element, then routes every
//! initialization data it sees (from "encrypted" events or from the
//! manifest) to a session:
//!
//! ```text
//!  encrypted events ─┐                ┌─► blacklisted? ─► blacklist-protection-data
//!                    ├─► init data ───┼─► still loaded? ─► init-data-ignored
//!  protection data ──┘                └─► get_session ─► generate_request ─► listener
//! ```
//!
//! Each initialization data is handled by its own task. A session failing
//! with a blacklisted error only marks its content as undecipherable, any
//! other error stops the manager.

use crate::config::EmeConfig;
use crate::eme::get_session::{get_session, SessionInfo};
use crate::eme::init_data_store::InitDataStore;
use crate::eme::media_keys::{disable_media_keys, init_media_keys, MediaKeysInfos, MediaKeysInfosStore};
use crate::eme::platform::{KeySystemAccessProvider, MediaElement};
use crate::eme::server_certificate::try_setting_server_certificate;
use crate::eme::session_events_listener::{session_events_listener, SessionListenerEvent};
use crate::eme::types::{
    EmeEvent, InitializationData, KeySystemOption, SessionLoadingType, SessionType,
};
use crate::error::{Error, Result};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handles the decryption side of one content
pub struct EmeManager {
    element: Arc<dyn MediaElement>,
    provider: Arc<dyn KeySystemAccessProvider>,
    infos: Arc<MediaKeysInfosStore>,
    key_systems: Vec<KeySystemOption>,
    config: EmeConfig,
}

/// What every session task needs
struct SessionContext {
    media_keys: MediaKeysInfos,
    key_system: String,
    session_type: SessionType,
    config: EmeConfig,
    events: mpsc::UnboundedSender<EmeEvent>,
}

impl SessionContext {
    fn emit(&self, event: EmeEvent) {
        if self.events.send(event).is_err() {
            debug!("EME: Event receiver dropped");
        }
    }
}

impl EmeManager {
    /// Create a manager.
    ///
    /// `infos` must be the same for every manager running on `element`, it
    /// is how MediaKeys and loaded sessions are shared between contents.
    pub fn new(
        element: Arc<dyn MediaElement>,
        provider: Arc<dyn KeySystemAccessProvider>,
        infos: Arc<MediaKeysInfosStore>,
        key_systems: Vec<KeySystemOption>,
        config: EmeConfig,
    ) -> Self {
        Self {
            element,
            provider,
            infos,
            key_systems,
            config,
        }
    }

    /// Run until `cancel` fires, both init data sources end, or a fatal
    /// error happens.
    ///
    /// Non-fatal problems are reported through `events` as warnings.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut protection_data: mpsc::Receiver<InitializationData>,
        events: mpsc::UnboundedSender<EmeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Subscribe first so that nothing sent during negotiation is lost
        let mut encrypted = self.element.subscribe_encrypted();

        let media_keys = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = init_media_keys(
                self.element.as_ref(),
                self.provider.as_ref(),
                &self.infos,
                &self.key_systems,
                &self.config,
            ) => result?,
        };
        let options = media_keys.state.key_system_options.clone();
        let key_system = media_keys.state.media_key_system_access.key_system();
        info!(key_system = %key_system, "EME: MediaKeys attached");

        // The certificate has to be known before any license is requested
        if let Some(certificate) = &options.server_certificate {
            if let Some(warning) = try_setting_server_certificate(
                &media_keys.state.media_keys,
                certificate,
                self.infos.certificates(),
            )
            .await
            {
                let _ = events.send(EmeEvent::Warning(warning));
            }
        }

        let session_type = wanted_session_type(&media_keys);
        let context = Arc::new(SessionContext {
            media_keys,
            key_system,
            session_type,
            config: self.config.clone(),
            events: events.clone(),
        });

        // Set once the task of the initialization data obtained its session
        let mut handled: InitDataStore<Arc<AtomicBool>> = InitDataStore::new();
        let mut blacklisted: InitDataStore<Error> = InitDataStore::new();
        let mut tasks: JoinSet<(InitializationData, Result<()>)> = JoinSet::new();
        let mut encrypted_open = true;
        let mut protection_open = true;

        loop {
            if !encrypted_open && !protection_open && tasks.is_empty() {
                debug!("EME: No more initialization data to handle");
                return Ok(());
            }

            let init_data = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("EME: Stopping");
                    return Ok(());
                }
                event = encrypted.recv(), if encrypted_open => match event {
                    Ok(event) => match event.init_data {
                        Some(data) => {
                            debug!("EME: Encrypted event received from media element");
                            InitializationData::from_encrypted_event(event.init_data_type.as_deref(), data)
                        }
                        None => {
                            warn!("EME: Encrypted event without initialization data");
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "EME: Missed encrypted events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        encrypted_open = false;
                        continue;
                    }
                },
                init_data = protection_data.recv(), if protection_open => match init_data {
                    Some(init_data) => init_data,
                    None => {
                        protection_open = false;
                        continue;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (init_data, result) = joined
                        .map_err(|e| Error::Internal(format!("Session task failed: {e}")))?;
                    handle_session_outcome(&context, &mut blacklisted, init_data, result)?;
                    continue;
                }
            };

            if let Some(err) = blacklisted.get(&init_data) {
                if init_data.init_data_type.is_none() {
                    error!("EME: Blacklisted initialization data of unknown type");
                    return Err(err.clone());
                }
                info!("EME: Initialization data already blacklisted");
                context.emit(EmeEvent::BlacklistProtectionData(init_data));
                continue;
            }

            if let Some(has_session) = handled.get(&init_data).cloned() {
                let still_loaded = !has_session.load(Ordering::SeqCst)
                    || context
                        .media_keys
                        .state
                        .loaded_sessions_store
                        .get_and_reuse(&init_data)
                        .await
                        .is_some();
                if still_loaded {
                    debug!("EME: Initialization data already received, ignoring it");
                    context.emit(EmeEvent::InitDataIgnored(init_data));
                    continue;
                }
                info!("EME: Session not found anymore, processing the initialization data again");
                handled.remove(&init_data);
            }

            let has_session = Arc::new(AtomicBool::new(false));
            handled.store(&init_data, has_session.clone());
            let task_context = context.clone();
            let task_cancel = cancel.child_token();
            tasks.spawn(async move {
                let result = handle_init_data(&task_context, &init_data, &has_session, task_cancel).await;
                (init_data, result)
            });
        }
    }
}

/// Session type to create, persistent only when wanted and supported
fn wanted_session_type(media_keys: &MediaKeysInfos) -> SessionType {
    let state = &media_keys.state;
    if !state.key_system_options.persistent_license {
        return SessionType::Temporary;
    }
    let configuration = state.media_key_system_access.configuration();
    if configuration.supports_session_type(SessionType::PersistentLicense) {
        SessionType::PersistentLicense
    } else {
        warn!("EME: Persistent sessions are not supported, falling back to temporary ones");
        SessionType::Temporary
    }
}

fn handle_session_outcome(
    context: &SessionContext,
    blacklisted: &mut InitDataStore<Error>,
    init_data: InitializationData,
    result: Result<()>,
) -> Result<()> {
    let err = match result {
        Ok(()) => return Ok(()),
        Err(Error::Cancelled) => return Ok(()),
        Err(err) => err,
    };

    let Some(cause) = err.blacklist_cause().cloned() else {
        error!(error = %err, "EME: Session failed");
        return Err(err);
    };

    if init_data.init_data_type.is_none() {
        error!("EME: Cannot blacklist initialization data of unknown type");
        return Err(err);
    }

    warn!(error = %cause, "EME: Session blacklisted");
    blacklisted.store(&init_data, err);
    context.emit(EmeEvent::Warning(cause));
    context.emit(EmeEvent::BlacklistProtectionData(init_data));
    Ok(())
}

/// Obtain a session for the initialization data and follow it until it is
/// closed
async fn handle_init_data(
    context: &SessionContext,
    init_data: &InitializationData,
    has_session: &AtomicBool,
    cancel: CancellationToken,
) -> Result<()> {
    let state = &context.media_keys.state;
    let options = &state.key_system_options;
    let persistent_store = context.media_keys.persistent_sessions_store.as_deref();
    let max_sessions = options
        .max_session_cache_size
        .unwrap_or(context.config.max_simultaneous_sessions);

    let SessionInfo {
        entry,
        loading_type,
    } = get_session(
        init_data,
        &state.loaded_sessions_store,
        persistent_store,
        context.session_type,
        max_sessions,
    )
    .await?;
    has_session.store(true, Ordering::SeqCst);

    let session = entry.session.clone();
    context.emit(match loading_type {
        SessionLoadingType::Created => EmeEvent::CreatedSession {
            init_data: init_data.clone(),
            session_type: entry.session_type,
        },
        SessionLoadingType::LoadedOpenSession => EmeEvent::LoadedOpenSession {
            init_data: init_data.clone(),
            session_id: session.session_id(),
        },
        SessionLoadingType::LoadedPersistentSession => EmeEvent::LoadedPersistentSession {
            init_data: init_data.clone(),
            session_id: session.session_id(),
        },
    });

    let session_events = session.subscribe();

    if loading_type == SessionLoadingType::Created {
        debug!("EME: Calling generateRequest");
        session
            .generate_request(init_data.init_data_type.as_deref(), &init_data.concatenated())
            .await
            .map_err(Error::GenerateRequest)?;

        if entry.session_type == SessionType::PersistentLicense {
            if let Some(store) = persistent_store {
                let max_stored = context.config.max_stored_persistent_sessions;
                if store.len() >= max_stored {
                    store.delete_old_sessions(store.len() + 1 - max_stored);
                }
                store.add(init_data, &session.session_id());
            }
        }
    }

    let mut listener = session_events_listener(
        session.clone(),
        options.clone(),
        context.key_system.clone(),
        session_events,
        context.config.clone(),
        cancel,
    );

    while let Some(event) = listener.next().await {
        let event = match event? {
            SessionListenerEvent::Message {
                message_type,
                message,
            } => EmeEvent::SessionMessage {
                message_type,
                message,
                init_data: init_data.clone(),
            },
            SessionListenerEvent::NoUpdate => EmeEvent::NoUpdate {
                init_data: init_data.clone(),
            },
            SessionListenerEvent::Updated { license, reason } => EmeEvent::SessionUpdated {
                session_id: session.session_id(),
                license,
                reason,
            },
            SessionListenerEvent::KeysUpdate(update) => {
                let mut key_ids = update.whitelisted.clone();
                key_ids.extend(update.blacklisted.iter().cloned());
                entry.record.associate_key_ids(&key_ids);
                if update.blacklisted.is_empty() {
                    continue;
                }
                EmeEvent::BlacklistKeys(update)
            }
            SessionListenerEvent::Warning(warning) => EmeEvent::Warning(warning),
        };
        context.emit(event);
    }
    Ok(())
}

/// Close every session and detach the MediaKeys of the element
#[instrument(skip_all)]
pub async fn dispose_eme(element: &dyn MediaElement, infos: &MediaKeysInfosStore) -> Result<()> {
    if let Some(state) = infos.state() {
        state.loaded_sessions_store.close_all_sessions().await;
    }
    disable_media_keys(element, infos).await
}
