//! Key status evaluation

use crate::eme::types::{key_id_to_hex, KeyId, KeyStatus, KeySystemOption, KeysUpdate};
use crate::error::{Error, Result};
use bytes::Bytes;

/// Outcome of a key status evaluation
#[derive(Debug, Clone, Default)]
pub struct KeyStatusesResult {
    pub warnings: Vec<Error>,
    pub keys: KeysUpdate,
}

/// Key ids in PlayReady key status maps are little-endian GUIDs
pub fn uuid_key_id_from_status_key_id(key_system: &str, key_id: &KeyId) -> KeyId {
    if key_system.contains("playready") && key_id.len() == 16 {
        let k = key_id;
        let swapped = [
            k[3], k[2], k[1], k[0], k[5], k[4], k[7], k[6], k[8], k[9], k[10], k[11], k[12], k[13],
            k[14], k[15],
        ];
        return Bytes::copy_from_slice(&swapped);
    }
    key_id.clone()
}

/// Classify every key of a session's key status map.
///
/// Expired keys stay usable when `throw_on_license_expiration` is
/// explicitly `false`. Keys in internal error or with a restricted output
/// are blacklisted when the matching fallback is enabled. Any other
/// situation where a key cannot be used fails the whole evaluation.
pub fn check_key_statuses(
    key_statuses: &[(KeyId, KeyStatus)],
    options: &KeySystemOption,
    key_system: &str,
) -> Result<KeyStatusesResult> {
    let mut result = KeyStatusesResult::default();

    for (status_key_id, status) in key_statuses {
        let key_id = uuid_key_id_from_status_key_id(key_system, status_key_id);
        match status {
            KeyStatus::Expired => {
                let error = Error::KeyStatusExpired {
                    key_id: key_id_to_hex(&key_id),
                };
                if options.throw_on_license_expiration != Some(false) {
                    return Err(error);
                }
                result.warnings.push(error);
                result.keys.whitelisted.push(key_id);
            }
            KeyStatus::InternalError => {
                let error = Error::KeyStatusInternalError {
                    key_id: key_id_to_hex(&key_id),
                };
                if !options.fallback_on.key_internal_error {
                    return Err(error);
                }
                result.warnings.push(error);
                result.keys.blacklisted.push(key_id);
            }
            KeyStatus::OutputRestricted => {
                let error = Error::KeyStatusOutputRestricted {
                    key_id: key_id_to_hex(&key_id),
                };
                if !options.fallback_on.key_output_restricted {
                    return Err(error);
                }
                result.warnings.push(error);
                result.keys.blacklisted.push(key_id);
            }
            _ => result.keys.whitelisted.push(key_id),
        }
    }
    Ok(result)
}
