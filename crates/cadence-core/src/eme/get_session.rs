//! Obtaining a session for new initialization data

use crate::eme::loaded_sessions_store::{LoadedSessionsStore, StoredSessionEntry};
use crate::eme::persistent_sessions_store::PersistentSessionsStore;
use crate::eme::platform::MediaKeySession;
use crate::eme::types::{InitializationData, KeyStatus, SessionLoadingType, SessionType};
use crate::error::{Error, Result};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

/// A session ready to handle some initialization data
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub entry: StoredSessionEntry,
    pub loading_type: SessionLoadingType,
}

/// Whether a loaded session can still be relied on
pub fn is_session_usable(session: &dyn MediaKeySession) -> bool {
    if session.session_id().is_empty() {
        return false;
    }
    let statuses = session.key_statuses();
    if statuses.is_empty() {
        debug!("EME: Session has an empty key status map");
        return false;
    }
    if statuses
        .iter()
        .any(|(_, status)| matches!(status, KeyStatus::Expired | KeyStatus::InternalError))
    {
        debug!("EME: Session has an expired or invalid key");
        return false;
    }
    true
}

/// Close the oldest sessions until at most `limit` remain
pub async fn clean_old_loaded_sessions(store: &LoadedSessionsStore, limit: usize) {
    let entries = store.get_all().await;
    if entries.len() <= limit {
        return;
    }
    let to_delete = entries.len() - limit;
    info!(to_delete, limit, "EME: Too many stored sessions, closing the oldest");
    join_all(entries[..to_delete].iter().map(|entry| store.close_entry(entry))).await;
}

/// Reuse a compatible loaded session or create a new one.
///
/// Before creating a session, the oldest ones are closed so that at most
/// `max_session_cache_size` sessions stay loaded once it is added. A size
/// of 0 could not even keep the new session and is rejected.
#[instrument(skip_all, fields(session_type = %wanted_session_type))]
pub async fn get_session(
    init_data: &InitializationData,
    loaded_sessions_store: &LoadedSessionsStore,
    persistent_sessions_store: Option<&PersistentSessionsStore>,
    wanted_session_type: SessionType,
    max_session_cache_size: usize,
) -> Result<SessionInfo> {
    if max_session_cache_size == 0 {
        return Err(Error::InvalidConfig(
            "max_session_cache_size must allow at least one session".into(),
        ));
    }
    if let Some(entry) = loaded_sessions_store.get_and_reuse(init_data).await {
        if is_session_usable(entry.session.as_ref()) {
            info!(session_id = %entry.session.session_id(), "EME: Reuse loaded session");
            return Ok(SessionInfo {
                entry,
                loading_type: SessionLoadingType::LoadedOpenSession,
            });
        }
        if let Some(persistent) = persistent_sessions_store {
            persistent.delete(entry.record.init_data());
        }
        loaded_sessions_store.close_entry(&entry).await;
    }

    clean_old_loaded_sessions(
        loaded_sessions_store,
        max_session_cache_size.saturating_sub(1),
    )
    .await;

    create_session(
        init_data,
        loaded_sessions_store,
        persistent_sessions_store,
        wanted_session_type,
    )
    .await
}

/// Create a session, loading its persisted license when there is one
pub async fn create_session(
    init_data: &InitializationData,
    loaded_sessions_store: &LoadedSessionsStore,
    persistent_sessions_store: Option<&PersistentSessionsStore>,
    wanted_session_type: SessionType,
) -> Result<SessionInfo> {
    let persistent = match (wanted_session_type, persistent_sessions_store) {
        (SessionType::Temporary, _) => None,
        (SessionType::PersistentLicense, None) => {
            warn!("EME: Cannot create persistent session, no persistent sessions store");
            None
        }
        (SessionType::PersistentLicense, Some(store)) => Some(store),
    };

    let Some(persistent) = persistent else {
        info!("EME: Creating a new temporary session");
        let entry = loaded_sessions_store
            .create_session(init_data, SessionType::Temporary)
            .await?;
        return Ok(created(entry));
    };

    info!("EME: Creating persistent session");
    let entry = loaded_sessions_store
        .create_session(init_data, SessionType::PersistentLicense)
        .await?;
    let Some(stored) = persistent.get_and_reuse(init_data) else {
        return Ok(created(entry));
    };

    match entry.session.load(stored.session_id()).await {
        Ok(false) => {
            warn!("EME: No data stored for the loaded session");
            persistent.delete(init_data);
            Ok(created(entry))
        }
        Ok(true) if is_session_usable(entry.session.as_ref()) => {
            persistent.add(init_data, &entry.session.session_id());
            info!("EME: Succeeded to load persistent session");
            Ok(SessionInfo {
                entry,
                loading_type: SessionLoadingType::LoadedPersistentSession,
            })
        }
        Ok(true) => {
            warn!("EME: Previous persistent session not usable anymore");
            recreate_persistent_session(init_data, entry, loaded_sessions_store, persistent).await
        }
        Err(err) => {
            warn!(error = %err, "EME: Unable to load persistent session");
            recreate_persistent_session(init_data, entry, loaded_sessions_store, persistent).await
        }
    }
}

async fn recreate_persistent_session(
    init_data: &InitializationData,
    entry: StoredSessionEntry,
    loaded_sessions_store: &LoadedSessionsStore,
    persistent: &PersistentSessionsStore,
) -> Result<SessionInfo> {
    info!("EME: Removing previous persistent session");
    if persistent.get(init_data).is_some() {
        persistent.delete(init_data);
    }
    loaded_sessions_store.close_entry(&entry).await;
    let entry = loaded_sessions_store
        .create_session(init_data, SessionType::PersistentLicense)
        .await?;
    Ok(created(entry))
}

fn created(entry: StoredSessionEntry) -> SessionInfo {
    SessionInfo {
        entry,
        loading_type: SessionLoadingType::Created,
    }
}
