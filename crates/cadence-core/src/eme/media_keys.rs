//! Key system negotiation and MediaKeys attachment
//!
//! ```text
//!   options ──► find_key_system ──► get_media_keys ──► attach_media_keys
//!                 (probe / reuse)     (create / reuse)    (one per element)
//! ```

use crate::config::EmeConfig;
use crate::eme::loaded_sessions_store::LoadedSessionsStore;
use crate::eme::persistent_sessions_store::PersistentSessionsStore;
use crate::eme::platform::{
    same_object, KeySystemAccessProvider, MediaElement, MediaKeySystemAccess,
    MediaKeySystemConfiguration, MediaKeys, MediaKeysRequirement,
};
use crate::eme::server_certificate::ServerCertificateHashStore;
use crate::eme::types::{KeySystemOption, SessionType};
use crate::error::{Error, Result};
use crate::utils::hash_buffer;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Everything negotiated for the media element
#[derive(Clone)]
pub struct MediaKeysState {
    pub key_system_options: KeySystemOption,
    pub media_key_system_access: Arc<dyn MediaKeySystemAccess>,
    pub media_keys: Arc<dyn MediaKeys>,
    pub loaded_sessions_store: Arc<LoadedSessionsStore>,
}

/// Per media element record of the attached MediaKeys.
///
/// Shared by every EME manager running on the same element, so that
/// MediaKeys and their sessions can be reused from one content to the next.
#[derive(Default)]
pub struct MediaKeysInfosStore {
    state: Mutex<Option<MediaKeysState>>,
    attach_lock: tokio::sync::Mutex<()>,
    certificates: ServerCertificateHashStore,
}

impl MediaKeysInfosStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<MediaKeysState> {
        self.state.lock().clone()
    }

    fn set_state(&self, state: Option<MediaKeysState>) {
        *self.state.lock() = state;
    }

    pub fn certificates(&self) -> &ServerCertificateHashStore {
        &self.certificates
    }
}

/// A key system the platform agreed to
#[derive(Clone)]
pub struct FoundKeySystem {
    pub options: KeySystemOption,
    pub access: Arc<dyn MediaKeySystemAccess>,
    /// The access comes from the current state
    pub reused: bool,
}

/// Configurations asked to the platform for one key system option
pub fn build_key_system_configurations(option: &KeySystemOption) -> Vec<MediaKeySystemConfiguration> {
    let mut session_types = vec![SessionType::Temporary];
    let mut persistent_state = MediaKeysRequirement::Optional;
    let mut distinctive_identifier = MediaKeysRequirement::Optional;

    if option.persistent_license {
        persistent_state = MediaKeysRequirement::Required;
        session_types.push(SessionType::PersistentLicense);
    }
    if option.persistent_state_required {
        persistent_state = MediaKeysRequirement::Required;
    }
    if option.distinctive_identifier_required {
        distinctive_identifier = MediaKeysRequirement::Required;
    }

    vec![MediaKeySystemConfiguration {
        init_data_types: vec!["cenc".to_string()],
        session_types,
        persistent_state,
        distinctive_identifier,
    }]
}

/// Returns the first option the current access can still serve
fn check_cached_access(options: &[KeySystemOption], current: &MediaKeysState) -> Option<KeySystemOption> {
    let configuration = current.media_key_system_access.configuration();
    options
        .iter()
        .find(|option| {
            if option.key_system != current.key_system_options.key_system {
                return false;
            }
            if (option.persistent_license || option.persistent_state_required)
                && configuration.persistent_state != MediaKeysRequirement::Required
            {
                return false;
            }
            if option.distinctive_identifier_required
                && configuration.distinctive_identifier != MediaKeysRequirement::Required
            {
                return false;
            }
            true
        })
        .cloned()
}

/// Select the first key system supported by the platform
#[instrument(skip_all)]
pub async fn find_key_system(
    provider: &dyn KeySystemAccessProvider,
    infos: &MediaKeysInfosStore,
    options: &[KeySystemOption],
) -> Result<FoundKeySystem> {
    info!("EME: Searching for compatible MediaKeySystemAccess");

    if let Some(current) = infos.state() {
        if let Some(option) = check_cached_access(options, &current) {
            info!(key_system = %option.key_system, "EME: Found cached compatible key system");
            return Ok(FoundKeySystem {
                options: option,
                access: current.media_key_system_access.clone(),
                reused: true,
            });
        }
    }

    let candidates: Vec<(String, &KeySystemOption)> = options
        .iter()
        .flat_map(|option| option.candidates().into_iter().map(move |ks| (ks, option)))
        .collect();

    for (idx, (key_system, option)) in candidates.iter().enumerate() {
        let configurations = build_key_system_configurations(option);
        debug!(
            key_system = %key_system,
            attempt = idx + 1,
            total = candidates.len(),
            "EME: Request key system access"
        );
        match provider
            .request_media_key_system_access(key_system, &configurations)
            .await
        {
            Ok(access) => {
                info!(key_system = %key_system, "EME: Found compatible key system");
                return Ok(FoundKeySystem {
                    options: (*option).clone(),
                    access,
                    reused: false,
                });
            }
            Err(err) => {
                debug!(key_system = %key_system, error = %err, "EME: Rejected access to key system");
            }
        }
    }

    Err(Error::IncompatibleKeySystems(
        "No key system compatible with your wanted configuration has been found".into(),
    ))
}

fn create_persistent_sessions_store(option: &KeySystemOption) -> Result<Option<Arc<PersistentSessionsStore>>> {
    if !option.persistent_license {
        return Ok(None);
    }
    let storage = option.license_storage.clone().ok_or_else(|| {
        Error::InvalidKeySystem("No license storage found for persistent license".into())
    })?;
    debug!("EME: Set the given license storage");
    Ok(Some(Arc::new(PersistentSessionsStore::new(storage))))
}

/// Negotiated MediaKeys and the stores bound to them
#[derive(Clone)]
pub struct MediaKeysInfos {
    pub state: MediaKeysState,
    pub persistent_sessions_store: Option<Arc<PersistentSessionsStore>>,
}

/// Find a key system and create (or reuse) its MediaKeys
#[instrument(skip_all)]
pub async fn get_media_keys(
    provider: &dyn KeySystemAccessProvider,
    infos: &MediaKeysInfosStore,
    options: &[KeySystemOption],
    config: &EmeConfig,
) -> Result<MediaKeysInfos> {
    let found = find_key_system(provider, infos, options).await?;
    let persistent_sessions_store = create_persistent_sessions_store(&found.options)?;

    if found.reused {
        if let Some(current) = infos.state() {
            // A MediaKeys with another certificate set cannot be reused
            let set_certificate = infos.certificates().get(&current.media_keys);
            let same_certificate = match (&found.options.server_certificate, set_certificate) {
                (_, None) => true,
                (Some(certificate), Some(hash)) => hash_buffer(certificate) == hash,
                (None, Some(_)) => false,
            };
            if same_certificate {
                return Ok(MediaKeysInfos {
                    state: MediaKeysState {
                        key_system_options: found.options,
                        media_key_system_access: found.access,
                        media_keys: current.media_keys,
                        loaded_sessions_store: current.loaded_sessions_store,
                    },
                    persistent_sessions_store,
                });
            }
        }
    }

    info!("EME: Calling createMediaKeys on the MediaKeySystemAccess");
    let media_keys = found
        .access
        .create_media_keys()
        .await
        .map_err(Error::CreateMediaKeys)?;
    info!("EME: MediaKeys created with success");

    let loaded_sessions_store = Arc::new(LoadedSessionsStore::new(
        media_keys.clone(),
        config.session_closing,
    ));
    Ok(MediaKeysInfos {
        state: MediaKeysState {
            key_system_options: found.options,
            media_key_system_access: found.access,
            media_keys,
            loaded_sessions_store,
        },
        persistent_sessions_store,
    })
}

/// Detach whatever MediaKeys the element has, closing the sessions of the
/// outgoing MediaKeys first
pub async fn disable_media_keys(element: &dyn MediaElement, infos: &MediaKeysInfosStore) -> Result<()> {
    if let Some(previous) = infos.state() {
        previous.loaded_sessions_store.close_all_sessions().await;
    }
    infos.set_state(None);
    element
        .set_media_keys(None)
        .await
        .map_err(Error::MediaKeysAttachment)
}

/// Attach the MediaKeys of `state` to the element.
///
/// Sessions of the previous state are closed first when they belong to
/// another store. Attaching the MediaKeys already attached does nothing
/// more. Concurrent attachments on one element are serialized.
#[instrument(skip_all)]
pub async fn attach_media_keys(
    element: &dyn MediaElement,
    infos: &MediaKeysInfosStore,
    state: MediaKeysState,
) -> Result<()> {
    let _guard = infos.attach_lock.lock().await;

    if let Some(previous) = infos.state() {
        if !same_object(&previous.loaded_sessions_store, &state.loaded_sessions_store) {
            previous.loaded_sessions_store.close_all_sessions().await;
        }
    }

    let already_attached = element
        .media_keys()
        .is_some_and(|current| same_object(&current, &state.media_keys));
    let media_keys = state.media_keys.clone();
    infos.set_state(Some(state));

    if already_attached {
        debug!("EME: MediaKeys already attached");
        return Ok(());
    }

    info!("EME: Attaching MediaKeys to the media element");
    if let Err(err) = element.set_media_keys(Some(media_keys)).await {
        infos.set_state(None);
        return Err(Error::MediaKeysAttachment(err));
    }
    Ok(())
}

/// Negotiate MediaKeys and attach them to the element
#[instrument(skip_all)]
pub async fn init_media_keys(
    element: &dyn MediaElement,
    provider: &dyn KeySystemAccessProvider,
    infos: &MediaKeysInfosStore,
    options: &[KeySystemOption],
    config: &EmeConfig,
) -> Result<MediaKeysInfos> {
    let media_keys_infos = get_media_keys(provider, infos, options, config).await?;

    let should_disable_old = element
        .media_keys()
        .is_some_and(|current| !same_object(&current, &media_keys_infos.state.media_keys));
    if should_disable_old {
        debug!("EME: Disabling old MediaKeys");
        disable_media_keys(element, infos).await?;
    }

    attach_media_keys(element, infos, media_keys_infos.state.clone()).await?;
    Ok(media_keys_infos)
}
