//! Segment fetching
//!
//! ```text
//! SegmentQueue ─▶ PrioritizedSegmentFetcher ─▶ Prioritizer ─▶ SegmentFetcher
//!                                                                 │
//!                                   InitSegmentCache ◀────────────┤
//!                                                                 ▼
//!                                       try_urls_with_backoff ─▶ SegmentLoader
//! ```

pub mod cache;
pub mod creator;
pub mod fetcher;
#[cfg(feature = "http")]
pub mod http;
pub mod loader;
pub mod prioritized;
pub mod queue;
pub mod retry;

pub use cache::InitSegmentCache;
pub use creator::SegmentFetcherCreator;
pub use fetcher::{RequestObserver, SegmentChunk, SegmentFetcher, SegmentFetcherEvent, SegmentMetrics};
#[cfg(feature = "http")]
pub use http::HttpSegmentLoader;
pub use loader::{
    ChunkInfo, LoaderEvent, ParsedSegment, PassthroughParser, ProgressInfo, RequestMetrics, SegmentLoader,
    SegmentParser, SegmentPipeline, SegmentTransport,
};
pub use prioritized::{
    apply_prioritizer_to_segment_fetcher, PrioritizedSegmentEvent, PrioritizedSegmentFetcher, SegmentRequest,
};
pub use queue::{QueuedSegment, SegmentQueue, SegmentQueueEvent};
pub use retry::{should_retry, try_urls_with_backoff};

/// Context of representation `representation_id` in a one-period manifest
#[cfg(test)]
pub(crate) fn test_context(representation_id: &str) -> crate::manifest::SegmentContext {
    use crate::manifest::{Adaptation, AdaptationType, Manifest, Period, Representation, SegmentContext};
    use std::sync::Arc;

    SegmentContext {
        manifest: Arc::new(Manifest {
            id: "manifest".into(),
            is_live: false,
        }),
        period: Arc::new(Period {
            id: "p1".into(),
            start: 0.0,
        }),
        adaptation: Arc::new(Adaptation {
            id: "main".into(),
            kind: AdaptationType::Video,
        }),
        representation: Arc::new(Representation {
            id: representation_id.into(),
            bitrate: 1_000_000,
        }),
    }
}

/// Four second segment available on two CDNs
#[cfg(test)]
pub(crate) fn test_content(
    representation_id: &str,
    segment_id: &str,
    is_init: bool,
) -> crate::manifest::SegmentLoaderContent {
    use crate::manifest::Segment;
    use std::sync::Arc;

    let media_urls = ["cdn-a", "cdn-b"]
        .iter()
        .filter_map(|cdn| url::Url::parse(&format!("https://{cdn}.example.com/{representation_id}/{segment_id}")).ok())
        .collect();
    test_context(representation_id).with_segment(Arc::new(Segment {
        id: segment_id.into(),
        time: 0,
        duration: 4000,
        timescale: 1000,
        is_init,
        media_urls,
        range: None,
    }))
}
