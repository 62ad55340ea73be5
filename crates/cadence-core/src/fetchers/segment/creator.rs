//! Creation of the segment fetchers of a content

use crate::config::{PrioritizerConfig, SegmentBackoffOptions, SegmentRequestOptions};
use crate::error::Result;
use crate::fetchers::prioritizer::Prioritizer;
use crate::fetchers::segment::fetcher::{RequestObserver, SegmentFetcher, SegmentFetcherEvent};
use crate::fetchers::segment::loader::SegmentTransport;
use crate::fetchers::segment::prioritized::{
    apply_prioritizer_to_segment_fetcher, PrioritizedSegmentFetcher,
};
use crate::manifest::AdaptationType;
use std::sync::Arc;
use tracing::debug;

/// Creates segment fetchers which all share the same prioritizer, so that
/// requests of every type of buffer are scheduled together
pub struct SegmentFetcherCreator {
    transport: Arc<dyn SegmentTransport>,
    options: SegmentRequestOptions,
    prioritizer: Prioritizer<SegmentFetcherEvent>,
    is_offline: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl SegmentFetcherCreator {
    pub fn new(
        transport: Arc<dyn SegmentTransport>,
        options: SegmentRequestOptions,
        priority_steps: PrioritizerConfig,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            options,
            prioritizer: Prioritizer::new(priority_steps)?,
            is_offline: None,
        })
    }

    pub fn with_offline_detector(mut self, is_offline: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.is_offline = Some(is_offline);
        self
    }

    /// Backoff options used by the fetchers of `kind`
    pub fn backoff_options(&self, kind: AdaptationType) -> SegmentBackoffOptions {
        SegmentBackoffOptions::for_buffer(kind, &self.options)
    }

    pub fn create_segment_fetcher(
        &self,
        kind: AdaptationType,
        observer: Option<Arc<dyn RequestObserver>>,
    ) -> PrioritizedSegmentFetcher {
        let backoff = self.backoff_options(kind);
        debug!(
            kind = %kind,
            max_retry_regular = backoff.max_retry_regular,
            max_retry_offline = backoff.max_retry_offline,
            "Fetchers: Creating segment fetcher"
        );

        let mut fetcher = SegmentFetcher::new(kind, self.transport.segment_pipeline(kind), backoff);
        if let Some(observer) = observer {
            fetcher = fetcher.with_observer(observer);
        }
        if let Some(is_offline) = &self.is_offline {
            fetcher = fetcher.with_offline_detector(is_offline.clone());
        }
        apply_prioritizer_to_segment_fetcher(self.prioritizer.clone(), fetcher)
    }
}
