//! Error types for Cadence Core

use std::fmt;
use thiserror::Error;

/// Result type alias for player core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error reported by the platform's encryption API (the CDM bindings).
///
/// `name` mirrors the DOMException name (e.g. `"InvalidStateError"`) and is
/// what callers match on to discriminate recoverable platform races.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformError {
    pub name: String,
    pub message: String,
}

impl PlatformError {
    pub const INVALID_STATE: &'static str = "InvalidStateError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Error raised when operating on a session the CDM has not initialized yet
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_STATE, message)
    }

    pub fn is_invalid_state(&self) -> bool {
        self.name == Self::INVALID_STATE
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for PlatformError {}

/// Error returned by a user-supplied license fetcher.
///
/// The two flags drive the retry policy of the license request flow:
/// `no_retry` stops retrying immediately, `fallback_on_last_try` turns the
/// final failure into a blacklisted session instead of a fatal error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseError {
    pub message: String,
    pub no_retry: bool,
    pub fallback_on_last_try: bool,
}

impl LicenseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    pub fn fallback_on_last_try(mut self) -> Self {
        self.fallback_on_last_try = true;
        self
    }
}

impl fmt::Display for LicenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LicenseError {}

/// Player core error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Key system negotiation errors
    #[error("No compatible key system found: {0}")]
    IncompatibleKeySystems(String),

    #[error("Invalid key system configuration: {0}")]
    InvalidKeySystem(String),

    #[error("Could not create MediaKeys: {0}")]
    CreateMediaKeys(PlatformError),

    #[error("Could not attach MediaKeys to the media element: {0}")]
    MediaKeysAttachment(PlatformError),

    #[error("Could not set the server certificate: {0}")]
    ServerCertificate(String),

    // Session management errors
    #[error("A session already exists for this initialization data")]
    MultipleSessionsSameInitData,

    #[error("Could not create session: {0}")]
    CreateSession(PlatformError),

    #[error("Could not generate key request: {0}")]
    GenerateRequest(PlatformError),

    #[error("Could not update session: {0}")]
    KeyUpdate(PlatformError),

    #[error("Key status change handler failed: {0}")]
    KeyStatusChange(String),

    #[error("Key expired ({key_id})")]
    KeyStatusExpired { key_id: String },

    #[error("Key in internal error ({key_id})")]
    KeyStatusInternalError { key_id: String },

    #[error("Key output restricted ({key_id})")]
    KeyStatusOutputRestricted { key_id: String },

    #[error("License request failed: {0}")]
    KeyLoad(LicenseError),

    #[error("License request timed out after {timeout_ms}ms")]
    KeyLoadTimeout { timeout_ms: u64 },

    #[error("Session key error: {0}")]
    KeyError(String),

    #[error("Session blacklisted: {0}")]
    BlacklistedSession(Box<Error>),

    // Segment errors
    #[error("Network error on {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} on {url}")]
    Http { url: String, status: u16 },

    #[error("Segment loading failed: {0}")]
    PipelineLoad(String),

    #[error("Segment parsing failed: {0}")]
    PipelineParse(String),

    // Generic errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a session error so the session is flagged as unusable without
    /// aborting the whole content
    pub fn blacklisted(err: Error) -> Self {
        Error::BlacklistedSession(Box::new(err))
    }

    /// Returns the error wrapped by a blacklisted session, if this is one
    pub fn blacklist_cause(&self) -> Option<&Error> {
        match self {
            Error::BlacklistedSession(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if this error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network { .. } | Error::Timeout | Error::KeyLoadTimeout { .. } => true,
            Error::Http { status, .. } => {
                *status >= 500 || *status == 404 || *status == 412 || *status == 415
            }
            Error::KeyLoad(err) => !err.no_retry,
            _ => false,
        }
    }

    /// Returns the error code for analytics and upper layers
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::IncompatibleKeySystems(_) => "INCOMPATIBLE_KEYSYSTEMS",
            Error::InvalidKeySystem(_) => "INVALID_KEY_SYSTEM",
            Error::CreateMediaKeys(_) => "CREATE_MEDIA_KEYS_ERROR",
            Error::MediaKeysAttachment(_) => "MEDIA_KEYS_ATTACHMENT_ERROR",
            Error::ServerCertificate(_) => "LICENSE_SERVER_CERTIFICATE_ERROR",
            Error::MultipleSessionsSameInitData => "MULTIPLE_SESSIONS_SAME_INIT_DATA",
            Error::CreateSession(_) => "KEY_GENERATE_REQUEST_ERROR",
            Error::GenerateRequest(_) => "KEY_GENERATE_REQUEST_ERROR",
            Error::KeyUpdate(_) => "KEY_UPDATE_ERROR",
            Error::KeyStatusChange(_) => "KEY_STATUS_CHANGE_ERROR",
            Error::KeyStatusExpired { .. } => "KEY_STATUS_EXPIRED",
            Error::KeyStatusInternalError { .. } => "KEY_STATUS_INTERNAL_ERROR",
            Error::KeyStatusOutputRestricted { .. } => "KEY_STATUS_OUTPUT_RESTRICTED",
            Error::KeyLoad(_) => "KEY_LOAD_ERROR",
            Error::KeyLoadTimeout { .. } => "KEY_LOAD_TIMEOUT",
            Error::KeyError(_) => "KEY_ERROR",
            Error::BlacklistedSession(_) => "BLACKLISTED_SESSION",
            Error::Network { .. } => "NETWORK_ERROR",
            Error::Http { .. } => "HTTP_ERROR",
            Error::PipelineLoad(_) => "PIPELINE_LOAD_ERROR",
            Error::PipelineParse(_) => "PIPELINE_PARSE_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Timeout => "TIMEOUT",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() {
            return Error::Timeout;
        }
        match err.status() {
            Some(status) => Error::Http {
                url,
                status: status.as_u16(),
            },
            None => Error::Network {
                url,
                message: err.to_string(),
            },
        }
    }
}
