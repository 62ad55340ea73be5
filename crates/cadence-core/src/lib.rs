//! Cadence Core - Streaming Player Engine
//!
//! This crate provides the parts of an adaptive streaming player which talk
//! to the outside world:
//! - EME session orchestration: key system negotiation, license exchange,
//!   session caching and persistence
//! - Segment fetching: prioritized requests over several CDNs with retry,
//!   backoff and initialization segment caching
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Cadence Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐                       ┌──────────────┐        │
//! │  │     EME      │                       │   Segment    │        │
//! │  │   Manager    │                       │    Queue     │        │
//! │  └──────┬───────┘                       └──────┬───────┘        │
//! │         │                                      │                │
//! │  ┌──────┴───────┐  ┌──────────────┐     ┌──────┴───────┐        │
//! │  │ Media Keys / │  │  Persistent  │     │ Prioritizer  │        │
//! │  │ Get Session  │──│   Sessions   │     └──────┬───────┘        │
//! │  └──────┬───────┘  └──────────────┘            │                │
//! │         │                               ┌──────┴───────┐        │
//! │  ┌──────┴───────┐                       │   Segment    │        │
//! │  │ Loaded       │                       │   Fetcher    │        │
//! │  │ Sessions     │                       └──────┬───────┘        │
//! │  └──────────────┘                              │                │
//! │                                         ┌──────┴───────┐        │
//! │                                         │ Loader (HTTP)│        │
//! │                                         └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod eme;
pub mod error;
pub mod fetchers;
pub mod manifest;
pub mod utils;

pub use config::{
    BackoffConfig, EmeConfig, PrioritizerConfig, SegmentBackoffOptions, SegmentRequestOptions,
    SessionClosingConfig,
};
pub use eme::{dispose_eme, EmeEvent, EmeManager, MediaKeysInfosStore};
pub use error::{Error, LicenseError, PlatformError, Result};
pub use fetchers::{Prioritizer, SegmentFetcherCreator, SegmentQueue};
pub use manifest::{AdaptationType, Segment, SegmentContext, SegmentLoaderContent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Cadence Core initialized");
}
