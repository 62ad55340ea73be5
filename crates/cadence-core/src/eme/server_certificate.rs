//! Server certificate handling

use crate::eme::platform::MediaKeys;
use crate::error::Error;
use crate::utils::hash_buffer;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Hash of the certificate last set on each MediaKeys instance
#[derive(Default)]
pub struct ServerCertificateHashStore {
    entries: Mutex<Vec<(Weak<dyn MediaKeys>, i32)>>,
}

impl ServerCertificateHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(entries: &[(Weak<dyn MediaKeys>, i32)], media_keys: &Arc<dyn MediaKeys>) -> Option<usize> {
        let ptr = Arc::as_ptr(media_keys);
        entries
            .iter()
            .position(|(weak, _)| std::ptr::addr_eq(weak.as_ptr(), ptr))
    }

    pub fn get(&self, media_keys: &Arc<dyn MediaKeys>) -> Option<i32> {
        let entries = self.entries.lock();
        Self::position(&entries, media_keys).map(|idx| entries[idx].1)
    }

    pub fn add(&self, media_keys: &Arc<dyn MediaKeys>, hash: i32) {
        let mut entries = self.entries.lock();
        entries.retain(|(weak, _)| weak.strong_count() > 0);
        match Self::position(&entries, media_keys) {
            Some(idx) => entries[idx].1 = hash,
            None => entries.push((Arc::downgrade(media_keys), hash)),
        }
    }

    pub fn delete(&self, media_keys: &Arc<dyn MediaKeys>) {
        let mut entries = self.entries.lock();
        if let Some(idx) = Self::position(&entries, media_keys) {
            entries.remove(idx);
        }
    }
}

/// Set the certificate on the MediaKeys, unless it already is.
///
/// Failures are not fatal: the returned error should be reported as a
/// warning. Until a call succeeds, the certificate is considered unset.
pub async fn try_setting_server_certificate(
    media_keys: &Arc<dyn MediaKeys>,
    certificate: &[u8],
    hashes: &ServerCertificateHashStore,
) -> Option<Error> {
    let hash = hash_buffer(certificate);
    if hashes.get(media_keys) == Some(hash) {
        debug!("EME: Server certificate already set on the MediaKeys");
        return None;
    }

    debug!("EME: Setting server certificate on the MediaKeys");
    hashes.delete(media_keys);
    match media_keys.set_server_certificate(certificate).await {
        Ok(supported) => {
            if !supported {
                debug!("EME: The CDM does not use server certificates");
            }
            hashes.add(media_keys, hash);
            None
        }
        Err(err) => {
            warn!(error = %err, "EME: mediaKeys.setServerCertificate returned an error");
            Some(Error::ServerCertificate(err.to_string()))
        }
    }
}
