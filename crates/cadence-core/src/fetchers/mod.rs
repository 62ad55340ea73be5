//! Network side of the player: prioritized segment requests

pub mod prioritizer;
pub mod segment;

pub use prioritizer::{PrioritizedTask, Prioritizer, PrioritizerEvent, TaskFactory, TaskId};
pub use segment::{
    PrioritizedSegmentEvent, PrioritizedSegmentFetcher, RequestObserver, SegmentFetcher, SegmentFetcherCreator,
    SegmentQueue, SegmentQueueEvent, SegmentRequest,
};
