//! Sessions currently loaded on a MediaKeys instance

use crate::config::SessionClosingConfig;
use crate::eme::close_session::safe_close;
use crate::eme::key_session_record::KeySessionRecord;
use crate::eme::platform::{same_object, MediaKeySession, MediaKeys};
use crate::eme::types::{InitializationData, SessionType};
use crate::error::{Error, Result};
use futures::future::join_all;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A loaded session and what it was created for
#[derive(Clone)]
pub struct StoredSessionEntry {
    pub record: Arc<KeySessionRecord>,
    pub session: Arc<dyn MediaKeySession>,
    pub session_type: SessionType,
}

impl std::fmt::Debug for StoredSessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSessionEntry")
            .field("session_id", &self.session.session_id())
            .field("session_type", &self.session_type)
            .finish()
    }
}

type Entries = Arc<Mutex<Vec<StoredSessionEntry>>>;

/// Creates, reuses and closes the sessions of one MediaKeys instance.
///
/// Entries are kept in creation order, reused ones being moved last, so the
/// first entries are the best candidates for eviction. An entry disappears by
/// itself once its session is closed, whoever closed it.
pub struct LoadedSessionsStore {
    media_keys: Arc<dyn MediaKeys>,
    entries: Entries,
    closing: SessionClosingConfig,
    cancel: CancellationToken,
}

impl LoadedSessionsStore {
    pub fn new(media_keys: Arc<dyn MediaKeys>, closing: SessionClosingConfig) -> Self {
        Self {
            media_keys,
            entries: Arc::new(Mutex::new(Vec::new())),
            closing,
            cancel: CancellationToken::new(),
        }
    }

    pub fn media_keys(&self) -> &Arc<dyn MediaKeys> {
        &self.media_keys
    }

    pub async fn get(&self, init_data: &InitializationData) -> Option<StoredSessionEntry> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|entry| entry.record.is_compatible_with(init_data))
            .cloned()
    }

    /// Like [`LoadedSessionsStore::get`], also marking the entry as the most
    /// recently used
    pub async fn get_and_reuse(&self, init_data: &InitializationData) -> Option<StoredSessionEntry> {
        let mut entries = self.entries.lock().await;
        let idx = entries
            .iter()
            .position(|entry| entry.record.is_compatible_with(init_data))?;
        let entry = entries.remove(idx);
        entries.push(entry.clone());
        Some(entry)
    }

    /// Create a session for this initialization data
    pub async fn create_session(
        &self,
        init_data: &InitializationData,
        session_type: SessionType,
    ) -> Result<StoredSessionEntry> {
        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .any(|entry| entry.record.is_compatible_with(init_data))
        {
            return Err(Error::MultipleSessionsSameInitData);
        }

        let session = self
            .media_keys
            .create_session(session_type)
            .map_err(Error::CreateSession)?;
        let entry = StoredSessionEntry {
            record: Arc::new(KeySessionRecord::new(init_data.clone())),
            session,
            session_type,
        };
        debug!(%session_type, "EME-LSS: Add session");
        spawn_closed_finalizer(Arc::downgrade(&self.entries), entry.session.clone());
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Close the session linked to this initialization data.
    ///
    /// Returns `false` if there was none or if it could not be closed.
    pub async fn close_session(&self, init_data: &InitializationData) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries
                .iter()
                .position(|entry| entry.record.is_compatible_with(init_data))
            {
                Some(idx) => entries.remove(idx),
                None => {
                    warn!("EME-LSS: No session found for the given initData");
                    return false;
                }
            }
        };
        self.close(&entry).await
    }

    /// Close this precise entry
    pub async fn close_entry(&self, entry: &StoredSessionEntry) -> bool {
        remove_session(&self.entries, &entry.session).await;
        self.close(entry).await
    }

    async fn close(&self, entry: &StoredSessionEntry) -> bool {
        info!(session_id = %entry.session.session_id(), "EME-LSS: Close session");
        safe_close(&entry.session, &self.closing, &self.cancel).await
    }

    /// Entries, oldest first
    pub async fn get_all(&self) -> Vec<StoredSessionEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Close every session.
    ///
    /// The store is emptied right away, sessions created after this call
    /// are not concerned. Resolves once every close settled.
    pub async fn close_all_sessions(&self) {
        let previous = std::mem::take(&mut *self.entries.lock().await);
        debug!(count = previous.len(), "EME-LSS: Closing all current sessions");
        join_all(previous.iter().map(|entry| self.close(entry))).await;
    }
}

impl Drop for LoadedSessionsStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn remove_session(entries: &Mutex<Vec<StoredSessionEntry>>, session: &Arc<dyn MediaKeySession>) {
    entries
        .lock()
        .await
        .retain(|entry| !same_object(&entry.session, session));
}

/// Remove the entry once its session closed
fn spawn_closed_finalizer(entries: Weak<Mutex<Vec<StoredSessionEntry>>>, session: Arc<dyn MediaKeySession>) {
    tokio::spawn(async move {
        if let Err(err) = session.closed().await {
            warn!(error = %err, "EME-LSS: session.closed rejected");
        }
        if let Some(entries) = entries.upgrade() {
            debug!("EME-LSS: Session closed, removing it from the store");
            remove_session(&entries, &session).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eme::test_utils::{MockMediaKeys, SessionBehavior};
    use crate::eme::types::InitDataValue;

    fn init_data(data: &'static [u8]) -> InitializationData {
        InitializationData::new(Some("cenc"), vec![InitDataValue::new(Some("aa"), data)])
    }

    fn store() -> (Arc<MockMediaKeys>, LoadedSessionsStore) {
        let media_keys = MockMediaKeys::new(SessionBehavior::default());
        let store = LoadedSessionsStore::new(media_keys.clone(), SessionClosingConfig::default());
        (media_keys, store)
    }

    #[tokio::test]
    async fn test_create_twice_fails_without_mutation() {
        let (media_keys, store) = store();
        store.create_session(&init_data(b"1"), SessionType::Temporary).await.unwrap();

        let err = store
            .create_session(&init_data(b"1"), SessionType::Temporary)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "MULTIPLE_SESSIONS_SAME_INIT_DATA");
        assert_eq!(store.len().await, 1);
        assert_eq!(media_keys.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_get_and_reuse_order() {
        let (_, store) = store();
        store.create_session(&init_data(b"1"), SessionType::Temporary).await.unwrap();
        store.create_session(&init_data(b"2"), SessionType::Temporary).await.unwrap();

        assert!(store.get(&init_data(b"3")).await.is_none());
        store.get_and_reuse(&init_data(b"1")).await.unwrap();
        let order: Vec<InitializationData> = store
            .get_all()
            .await
            .iter()
            .map(|e| e.record.init_data().clone())
            .collect();
        assert_eq!(order, vec![init_data(b"2"), init_data(b"1")]);
    }

    #[tokio::test]
    async fn test_close_session() {
        let (media_keys, store) = store();
        store.create_session(&init_data(b"1"), SessionType::Temporary).await.unwrap();

        assert!(store.close_session(&init_data(b"1")).await);
        assert!(store.is_empty().await);
        assert!(media_keys.sessions()[0].is_closed());
        assert!(!store.close_session(&init_data(b"1")).await);
    }

    #[tokio::test]
    async fn test_externally_closed_session_is_removed() {
        let (media_keys, store) = store();
        store.create_session(&init_data(b"1"), SessionType::Temporary).await.unwrap();

        media_keys.sessions()[0].close().await.unwrap();
        for _ in 0..10 {
            if store.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all_sessions() {
        let (media_keys, store) = store();
        store.create_session(&init_data(b"1"), SessionType::Temporary).await.unwrap();
        store.create_session(&init_data(b"2"), SessionType::Temporary).await.unwrap();

        store.close_all_sessions().await;
        assert!(store.is_empty().await);
        assert!(media_keys.sessions().iter().all(|s| s.is_closed()));
    }
}
