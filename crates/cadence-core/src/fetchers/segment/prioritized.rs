//! Segment fetches scheduled through a [`Prioritizer`]

use crate::error::{Error, Result};
use crate::fetchers::prioritizer::{PrioritizedTask, Prioritizer, PrioritizerEvent, TaskId};
use crate::fetchers::segment::fetcher::{SegmentChunk, SegmentFetcher, SegmentFetcherEvent};
use crate::manifest::{AdaptationType, SegmentLoaderContent};
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Events of a prioritized segment request
#[derive(Debug, Clone)]
pub enum PrioritizedSegmentEvent {
    Warning(Error),
    Chunk(SegmentChunk),
    ChunkComplete,
    /// Paused for a more urgent request, it will start over later
    Interrupted,
    Ended,
}

impl From<PrioritizerEvent<SegmentFetcherEvent>> for PrioritizedSegmentEvent {
    fn from(event: PrioritizerEvent<SegmentFetcherEvent>) -> Self {
        match event {
            PrioritizerEvent::Data(SegmentFetcherEvent::Warning(err)) => Self::Warning(err),
            PrioritizerEvent::Data(SegmentFetcherEvent::Chunk(chunk)) => Self::Chunk(chunk),
            PrioritizerEvent::Data(SegmentFetcherEvent::ChunkComplete) => Self::ChunkComplete,
            PrioritizerEvent::Interrupted => Self::Interrupted,
            PrioritizerEvent::Ended => Self::Ended,
        }
    }
}

/// A pending segment request. Dropping it cancels the request.
pub struct SegmentRequest {
    task: PrioritizedTask<SegmentFetcherEvent>,
}

impl SegmentRequest {
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }
}

impl Stream for SegmentRequest {
    type Item = Result<PrioritizedSegmentEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.task)
            .poll_next(cx)
            .map(|event| event.map(|event| event.map(PrioritizedSegmentEvent::from)))
    }
}

/// Segment fetcher whose requests share a prioritizer with other fetchers
#[derive(Clone)]
pub struct PrioritizedSegmentFetcher {
    fetcher: SegmentFetcher,
    prioritizer: Prioritizer<SegmentFetcherEvent>,
}

impl PrioritizedSegmentFetcher {
    pub fn kind(&self) -> AdaptationType {
        self.fetcher.kind()
    }

    /// Schedule the fetch of `content`
    pub fn create_request(&self, content: SegmentLoaderContent, priority: i32) -> SegmentRequest {
        let fetcher = self.fetcher.clone();
        let task = self
            .prioritizer
            .create(move || fetcher.fetch(content.clone()), priority);
        SegmentRequest { task }
    }

    /// Change the priority of a request not started yet
    pub fn update_priority(&self, request: &SegmentRequest, priority: i32) {
        self.prioritizer.update_priority(request.task_id(), priority);
    }
}

/// Route the fetches of `fetcher` through `prioritizer`
pub fn apply_prioritizer_to_segment_fetcher(
    prioritizer: Prioritizer<SegmentFetcherEvent>,
    fetcher: SegmentFetcher,
) -> PrioritizedSegmentFetcher {
    PrioritizedSegmentFetcher {
        fetcher,
        prioritizer,
    }
}
