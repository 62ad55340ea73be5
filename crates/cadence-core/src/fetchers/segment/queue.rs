//! Sequential downloading of the segments wanted for one representation

use crate::error::{Error, Result};
use crate::fetchers::segment::fetcher::SegmentChunk;
use crate::fetchers::segment::prioritized::{PrioritizedSegmentEvent, PrioritizedSegmentFetcher};
use crate::manifest::{Segment, SegmentContext};
use crate::utils::event_stream;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// A segment to download and how urgent it is
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSegment {
    pub segment: Arc<Segment>,
    pub priority: i32,
}

impl QueuedSegment {
    pub fn new(segment: Arc<Segment>, priority: i32) -> Self {
        Self { segment, priority }
    }
}

/// Events of a [`SegmentQueue`]
#[derive(Debug, Clone)]
pub enum SegmentQueueEvent {
    Chunk(SegmentChunk),
    /// Every chunk of this segment was emitted
    ChunkComplete(Arc<Segment>),
    /// The current request failed and is being retried
    Retry(Error),
    /// The current request was paused for a more urgent one
    Interrupted(Arc<Segment>),
    /// Nothing left to download
    Empty,
}

/// Downloads wanted segments one at a time, in queue order.
///
/// The wanted queue can be replaced at any time. If its first segment stays
/// the same, the pending request is kept and only its priority updated,
/// otherwise the pending request is cancelled for the new head.
pub struct SegmentQueue {
    fetcher: PrioritizedSegmentFetcher,
    context: SegmentContext,
    wanted: Arc<watch::Sender<Vec<QueuedSegment>>>,
}

impl SegmentQueue {
    pub fn new(fetcher: PrioritizedSegmentFetcher, context: SegmentContext) -> Self {
        let (wanted, _) = watch::channel(Vec::new());
        Self {
            fetcher,
            context,
            wanted: Arc::new(wanted),
        }
    }

    /// Replace the list of segments to download
    pub fn set_wanted(&self, segments: Vec<QueuedSegment>) {
        self.wanted.send_replace(segments);
    }

    /// Segments still to download, the first one possibly being downloaded
    pub fn wanted(&self) -> Vec<QueuedSegment> {
        self.wanted.borrow().clone()
    }

    /// Start downloading. The stream ends once the queue is dropped.
    pub fn start(&self) -> BoxStream<'static, Result<SegmentQueueEvent>> {
        let fetcher = self.fetcher.clone();
        let context = self.context.clone();
        let mut updates = self.wanted.subscribe();
        // Weak so that the stream ends once the queue is dropped
        let weak_wanted = Arc::downgrade(&self.wanted);

        event_stream(move |sink| async move {
            loop {
                let head = updates.borrow_and_update().first().cloned();
                let Some(mut current) = head else {
                    debug!("Fetchers: Segment queue is empty");
                    sink.emit(SegmentQueueEvent::Empty);
                    if updates.changed().await.is_err() {
                        return Ok(());
                    }
                    continue;
                };

                info!(segment = %current.segment.id, priority = current.priority, "Fetchers: Requesting segment");
                let content = context.with_segment(current.segment.clone());
                let mut request = fetcher.create_request(content, current.priority);

                loop {
                    tokio::select! {
                        changed = updates.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                            let head = updates.borrow_and_update().first().cloned();
                            match head {
                                Some(head) if head.segment.id == current.segment.id => {
                                    if head.priority != current.priority {
                                        fetcher.update_priority(&request, head.priority);
                                    }
                                    current = head;
                                }
                                _ => {
                                    debug!(segment = %current.segment.id, "Fetchers: Cancelling segment request");
                                    break;
                                }
                            }
                        }
                        event = request.next() => match event {
                            None => break,
                            Some(event) => match event? {
                                PrioritizedSegmentEvent::Warning(err) => {
                                    sink.emit(SegmentQueueEvent::Retry(err));
                                }
                                PrioritizedSegmentEvent::Interrupted => {
                                    sink.emit(SegmentQueueEvent::Interrupted(current.segment.clone()));
                                }
                                PrioritizedSegmentEvent::Chunk(chunk) => {
                                    sink.emit(SegmentQueueEvent::Chunk(chunk));
                                }
                                PrioritizedSegmentEvent::ChunkComplete => {
                                    sink.emit(SegmentQueueEvent::ChunkComplete(current.segment.clone()));
                                }
                                PrioritizedSegmentEvent::Ended => {
                                    if let Some(wanted) = weak_wanted.upgrade() {
                                        wanted.send_if_modified(|queue| {
                                            let is_head = queue
                                                .first()
                                                .is_some_and(|s| s.segment.id == current.segment.id);
                                            if is_head {
                                                queue.remove(0);
                                            }
                                            is_head
                                        });
                                    }
                                    break;
                                }
                            },
                        },
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrioritizerConfig, SegmentBackoffOptions};
    use crate::fetchers::prioritizer::Prioritizer;
    use crate::fetchers::segment::fetcher::SegmentFetcher;
    use crate::fetchers::segment::loader::{
        LoaderEvent, PassthroughParser, RequestMetrics, SegmentLoader, SegmentPipeline,
    };
    use crate::fetchers::segment::prioritized::apply_prioritizer_to_segment_fetcher;
    use crate::fetchers::segment::{test_content, test_context};
    use crate::manifest::{AdaptationType, SegmentLoaderContent};
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use std::time::Duration;
    use url::Url;

    struct SlowLoader {
        started: Mutex<Vec<String>>,
    }

    impl SegmentLoader for SlowLoader {
        fn load(&self, _url: &Url, content: &SegmentLoaderContent) -> BoxStream<'static, Result<LoaderEvent>> {
            self.started.lock().push(content.segment.id.clone());
            let data = Bytes::from(content.segment.id.clone());
            stream::once(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(LoaderEvent::Loaded {
                    metrics: RequestMetrics {
                        size: Some(data.len() as u64),
                        duration: Duration::from_millis(100),
                    },
                    data,
                })
            })
            .boxed()
        }
    }

    fn queue() -> (Arc<SlowLoader>, SegmentQueue) {
        let loader = Arc::new(SlowLoader {
            started: Mutex::new(Vec::new()),
        });
        let pipeline = SegmentPipeline {
            loader: loader.clone(),
            parser: Arc::new(PassthroughParser),
        };
        let fetcher = SegmentFetcher::new(AdaptationType::Video, pipeline, SegmentBackoffOptions::default());
        let prioritizer = Prioritizer::new(PrioritizerConfig::default()).unwrap();
        let fetcher = apply_prioritizer_to_segment_fetcher(prioritizer, fetcher);
        (loader, SegmentQueue::new(fetcher, test_context("v1")))
    }

    fn segment(id: &str) -> Arc<Segment> {
        test_content("v1", id, false).segment
    }

    fn name(event: &SegmentQueueEvent) -> String {
        match event {
            SegmentQueueEvent::Chunk(chunk) => format!("chunk {}", chunk.content().segment.id),
            SegmentQueueEvent::ChunkComplete(segment) => format!("complete {}", segment.id),
            SegmentQueueEvent::Retry(_) => "retry".into(),
            SegmentQueueEvent::Interrupted(segment) => format!("interrupted {}", segment.id),
            SegmentQueueEvent::Empty => "empty".into(),
        }
    }

    async fn next_names(events: &mut BoxStream<'static, Result<SegmentQueueEvent>>, count: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..count {
            match events.next().await {
                Some(event) => names.push(name(&event.unwrap())),
                None => break,
            }
        }
        names
    }

    #[tokio::test(start_paused = true)]
    async fn test_downloads_in_order_then_empty() {
        let (loader, queue) = queue();
        queue.set_wanted(vec![
            QueuedSegment::new(segment("seg-1"), 2),
            QueuedSegment::new(segment("seg-2"), 2),
        ]);
        let mut events = queue.start();

        let names = next_names(&mut events, 5).await;
        assert_eq!(
            names,
            vec!["chunk seg-1", "complete seg-1", "chunk seg-2", "complete seg-2", "empty"]
        );
        assert_eq!(*loader.started.lock(), vec!["seg-1", "seg-2"]);
        assert!(queue.wanted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_head_cancels_pending_request() {
        let (loader, queue) = queue();
        queue.set_wanted(vec![QueuedSegment::new(segment("seg-5"), 2)]);
        let mut events = queue.start();

        // Let the first request begin
        tokio::select! {
            _ = events.next() => panic!("no event expected yet"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        queue.set_wanted(vec![
            QueuedSegment::new(segment("seg-1"), 0),
            QueuedSegment::new(segment("seg-5"), 2),
        ]);

        let names = next_names(&mut events, 4).await;
        assert_eq!(
            names,
            vec!["chunk seg-1", "complete seg-1", "chunk seg-5", "complete seg-5"]
        );
        assert_eq!(*loader.started.lock(), vec!["seg-5", "seg-1", "seg-5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_head_keeps_request() {
        let (loader, queue) = queue();
        queue.set_wanted(vec![QueuedSegment::new(segment("seg-1"), 2)]);
        let mut events = queue.start();
        tokio::select! {
            _ = events.next() => panic!("no event expected yet"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        queue.set_wanted(vec![
            QueuedSegment::new(segment("seg-1"), 1),
            QueuedSegment::new(segment("seg-2"), 2),
        ]);
        let names = next_names(&mut events, 2).await;
        assert_eq!(names, vec!["chunk seg-1", "complete seg-1"]);
        assert_eq!(*loader.started.lock(), vec!["seg-1"]);
    }

    #[tokio::test]
    async fn test_stream_ends_with_queue() {
        let (_loader, queue) = queue();
        let mut events = queue.start();
        assert_eq!(next_names(&mut events, 1).await, vec!["empty"]);
        drop(queue);
        assert!(events.next().await.is_none());
    }
}
