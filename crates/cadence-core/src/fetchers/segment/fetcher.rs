//! Fetching of a single segment

use crate::config::SegmentBackoffOptions;
use crate::error::{Error, Result};
use crate::fetchers::segment::cache::InitSegmentCache;
use crate::fetchers::segment::loader::{
    LoaderEvent, ParsedSegment, ProgressInfo, RequestMetrics, SegmentParser, SegmentPipeline,
};
use crate::fetchers::segment::retry::try_urls_with_backoff;
use crate::manifest::{AdaptationType, SegmentLoaderContent};
use crate::utils::{event_stream, EventSink};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

/// Measures of a fetched segment, once it is entirely parsed
#[derive(Debug, Clone)]
pub struct SegmentMetrics {
    pub size: Option<u64>,
    pub request_duration: Duration,
    /// Duration of the media, `None` for initialization segments
    pub segment_duration: Option<f64>,
    pub content: SegmentLoaderContent,
}

/// Receives the telemetry of segment requests
pub trait RequestObserver: Send + Sync {
    fn on_request_begin(&self, _id: &str, _url: &Url, _content: &SegmentLoaderContent) {}

    fn on_progress(&self, _id: &str, _progress: ProgressInfo) {}

    fn on_request_end(&self, _id: &str) {}

    fn on_metrics(&self, _metrics: SegmentMetrics) {}
}

/// Events of a segment fetch
#[derive(Debug, Clone)]
pub enum SegmentFetcherEvent {
    /// A request failed and is being retried
    Warning(Error),
    Chunk(SegmentChunk),
    /// Every chunk of the segment was emitted
    ChunkComplete,
}

/// Metrics are only reported once the request is done and every chunk it
/// produced has been parsed
struct MetricsGate {
    observer: Option<Arc<dyn RequestObserver>>,
    content: SegmentLoaderContent,
    attempt: u32,
    received: u32,
    parsed: u32,
    request: Option<RequestMetrics>,
    sent: bool,
}

impl MetricsGate {
    fn new(observer: Option<Arc<dyn RequestObserver>>, content: SegmentLoaderContent) -> Self {
        Self {
            observer,
            content,
            attempt: 0,
            received: 0,
            parsed: 0,
            request: None,
            sent: false,
        }
    }

    fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.received = 0;
        self.parsed = 0;
        self.attempt
    }

    fn chunk_parsed(&mut self, attempt: u32) -> Option<(Arc<dyn RequestObserver>, SegmentMetrics)> {
        if attempt != self.attempt {
            return None;
        }
        self.parsed += 1;
        self.ready_metrics()
    }

    fn request_done(&mut self, metrics: RequestMetrics) -> Option<(Arc<dyn RequestObserver>, SegmentMetrics)> {
        self.request = Some(metrics);
        self.ready_metrics()
    }

    fn ready_metrics(&mut self) -> Option<(Arc<dyn RequestObserver>, SegmentMetrics)> {
        if self.sent || self.parsed < self.received {
            return None;
        }
        let request = self.request?;
        self.sent = true;
        let observer = self.observer.clone()?;
        let segment_duration =
            (!self.content.segment.is_init).then(|| self.content.segment.duration_seconds());
        Some((
            observer,
            SegmentMetrics {
                size: request.size,
                request_duration: request.duration,
                segment_duration,
                content: self.content.clone(),
            },
        ))
    }
}

fn send_metrics(ready: Option<(Arc<dyn RequestObserver>, SegmentMetrics)>) {
    if let Some((observer, metrics)) = ready {
        observer.on_metrics(metrics);
    }
}

/// Loaded data of a segment, parsed on demand
#[derive(Clone)]
pub struct SegmentChunk {
    data: Bytes,
    content: SegmentLoaderContent,
    parser: Arc<dyn SegmentParser>,
    is_chunked: bool,
    gate: Option<(Arc<Mutex<MetricsGate>>, u32)>,
    counted: Arc<AtomicBool>,
}

impl SegmentChunk {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content(&self) -> &SegmentLoaderContent {
        &self.content
    }

    pub fn parse(&self) -> Result<ParsedSegment> {
        let parsed = self.parser.parse(&self.data, &self.content, self.is_chunked)?;
        if let Some((gate, attempt)) = &self.gate {
            if !self.counted.swap(true, Ordering::SeqCst) {
                let ready = gate.lock().chunk_parsed(*attempt);
                send_metrics(ready);
            }
        }
        Ok(parsed)
    }
}

impl fmt::Debug for SegmentChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentChunk")
            .field("segment", &self.content.segment.id)
            .field("size", &self.data.len())
            .field("is_chunked", &self.is_chunked)
            .finish()
    }
}

/// Reports the end of a request however the fetch stops
struct RequestGuard {
    observer: Arc<dyn RequestObserver>,
    id: String,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.observer.on_request_end(&self.id);
    }
}

/// Fetches segments of one type of buffer
#[derive(Clone)]
pub struct SegmentFetcher {
    kind: AdaptationType,
    pipeline: SegmentPipeline,
    backoff: SegmentBackoffOptions,
    cache: Option<Arc<InitSegmentCache>>,
    observer: Option<Arc<dyn RequestObserver>>,
    is_offline: Arc<dyn Fn() -> bool + Send + Sync>,
    cancel: CancellationToken,
}

impl SegmentFetcher {
    /// Audio and video fetchers get an initialization segment cache
    pub fn new(kind: AdaptationType, pipeline: SegmentPipeline, backoff: SegmentBackoffOptions) -> Self {
        let cache = kind
            .caches_init_segments()
            .then(|| Arc::new(InitSegmentCache::new()));
        Self {
            kind,
            pipeline,
            backoff,
            cache,
            observer: None,
            is_offline: Arc::new(|| false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Used to tell offline failures apart, which have their own retry limit
    pub fn with_offline_detector(mut self, is_offline: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.is_offline = is_offline;
        self
    }

    /// Cancelling `cancel` aborts every fetch of this fetcher, pending
    /// retries included
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> AdaptationType {
        self.kind
    }

    pub fn cache(&self) -> Option<&Arc<InitSegmentCache>> {
        self.cache.as_ref()
    }

    /// Fetch a segment. Dropping the stream aborts the request.
    pub fn fetch(&self, content: SegmentLoaderContent) -> BoxStream<'static, Result<SegmentFetcherEvent>> {
        let fetcher = self.clone();
        event_stream(move |sink| async move { fetcher.run(content, sink).await })
    }

    #[instrument(skip_all, fields(kind = %self.kind, segment = %content.segment.id))]
    async fn run(&self, content: SegmentLoaderContent, sink: EventSink<SegmentFetcherEvent>) -> Result<()> {
        if let Some(data) = self.cache.as_ref().and_then(|cache| cache.get(&content)) {
            debug!("Fetchers: Initialization segment found in cache");
            sink.emit(SegmentFetcherEvent::Chunk(SegmentChunk {
                data,
                content: content.clone(),
                parser: self.pipeline.parser.clone(),
                is_chunked: false,
                gate: None,
                counted: Arc::new(AtomicBool::new(false)),
            }));
            sink.emit(SegmentFetcherEvent::ChunkComplete);
            return Ok(());
        }

        let urls = content.segment.media_urls.clone();
        let id = Uuid::new_v4().to_string();
        let _guard = match (&self.observer, urls.first()) {
            (Some(observer), Some(url)) => {
                observer.on_request_begin(&id, url, &content);
                Some(RequestGuard {
                    observer: observer.clone(),
                    id: id.clone(),
                })
            }
            _ => None,
        };

        let gate = Arc::new(Mutex::new(MetricsGate::new(self.observer.clone(), content.clone())));
        let cancel = self.cancel.child_token();
        let warnings = sink.clone();
        try_urls_with_backoff(
            &urls,
            |url| self.request(url.clone(), &content, &sink, &gate, &id),
            &self.backoff,
            self.is_offline.as_ref(),
            |err| {
                warnings.emit(SegmentFetcherEvent::Warning(err.clone()));
            },
            &cancel,
        )
        .await
    }

    /// One attempt on one URL
    async fn request(
        &self,
        url: Url,
        content: &SegmentLoaderContent,
        sink: &EventSink<SegmentFetcherEvent>,
        gate: &Arc<Mutex<MetricsGate>>,
        id: &str,
    ) -> Result<()> {
        debug!(url = %url, "Fetchers: Loading segment");
        let attempt = gate.lock().begin_attempt();
        let chunk = |data: Bytes, is_chunked: bool| SegmentChunk {
            data,
            content: content.clone(),
            parser: self.pipeline.parser.clone(),
            is_chunked,
            gate: Some((gate.clone(), attempt)),
            counted: Arc::new(AtomicBool::new(false)),
        };

        let mut events = self.pipeline.loader.load(&url, content);
        while let Some(event) = events.next().await {
            match event? {
                LoaderEvent::Progress(progress) => {
                    if let Some(observer) = &self.observer {
                        observer.on_progress(id, progress);
                    }
                }
                LoaderEvent::Chunk(data) => {
                    gate.lock().received += 1;
                    sink.emit(SegmentFetcherEvent::Chunk(chunk(data, true)));
                }
                LoaderEvent::ChunkComplete(metrics) => {
                    sink.emit(SegmentFetcherEvent::ChunkComplete);
                    let ready = gate.lock().request_done(metrics);
                    send_metrics(ready);
                    return Ok(());
                }
                LoaderEvent::Loaded { data, metrics } => {
                    if let Some(cache) = &self.cache {
                        cache.add(content, data.clone());
                    }
                    gate.lock().received += 1;
                    sink.emit(SegmentFetcherEvent::Chunk(chunk(data, false)));
                    sink.emit(SegmentFetcherEvent::ChunkComplete);
                    let ready = gate.lock().request_done(metrics);
                    send_metrics(ready);
                    return Ok(());
                }
            }
        }
        Err(Error::PipelineLoad(format!("request to {url} ended without data")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::segment::loader::{PassthroughParser, SegmentLoader};
    use crate::fetchers::segment::test_content;
    use futures::stream;
    use std::sync::atomic::AtomicU32;

    type Script = dyn Fn(&Url) -> Vec<Result<LoaderEvent>> + Send + Sync;

    /// Loader replaying a script per request
    struct ScriptedLoader {
        script: Box<Script>,
        calls: AtomicU32,
        hang: bool,
    }

    impl ScriptedLoader {
        fn new(script: impl Fn(&Url) -> Vec<Result<LoaderEvent>> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: AtomicU32::new(0),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(|_| Vec::new()),
                calls: AtomicU32::new(0),
                hang: true,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SegmentLoader for ScriptedLoader {
        fn load(&self, url: &Url, _content: &SegmentLoaderContent) -> BoxStream<'static, Result<LoaderEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                return stream::pending().boxed();
            }
            stream::iter((self.script)(url)).boxed()
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        log: Mutex<Vec<String>>,
        metrics: Mutex<Vec<SegmentMetrics>>,
    }

    impl RequestObserver for RecordingObserver {
        fn on_request_begin(&self, _id: &str, url: &Url, _content: &SegmentLoaderContent) {
            let host = url.host_str().unwrap_or_default();
            let cdn = host.split('.').next().unwrap_or_default();
            self.log.lock().push(format!("begin {cdn}"));
        }

        fn on_progress(&self, _id: &str, progress: ProgressInfo) {
            self.log.lock().push(format!("progress {}", progress.size));
        }

        fn on_request_end(&self, _id: &str) {
            self.log.lock().push("end".into());
        }

        fn on_metrics(&self, metrics: SegmentMetrics) {
            self.metrics.lock().push(metrics);
        }
    }

    fn metrics(size: u64) -> RequestMetrics {
        RequestMetrics {
            size: Some(size),
            duration: Duration::from_millis(40),
        }
    }

    fn loaded(data: &'static [u8]) -> Vec<Result<LoaderEvent>> {
        vec![Ok(LoaderEvent::Loaded {
            data: Bytes::from_static(data),
            metrics: metrics(data.len() as u64),
        })]
    }

    fn fetcher(kind: AdaptationType, loader: Arc<dyn SegmentLoader>) -> SegmentFetcher {
        let pipeline = SegmentPipeline {
            loader,
            parser: Arc::new(PassthroughParser),
        };
        SegmentFetcher::new(kind, pipeline, SegmentBackoffOptions::default())
    }

    async fn collect(fetcher: &SegmentFetcher, content: SegmentLoaderContent) -> Vec<SegmentFetcherEvent> {
        fetcher
            .fetch(content)
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_init_segment_served_from_cache() {
        let loader = ScriptedLoader::new(|_| loaded(b"init"));
        let fetcher = fetcher(AdaptationType::Video, loader.clone());
        let content = test_content("v1", "init", true);

        let first = collect(&fetcher, content.clone()).await;
        let second = collect(&fetcher, content).await;
        assert_eq!(loader.calls(), 1);
        for events in [first, second] {
            assert_eq!(events.len(), 2);
            match &events[0] {
                SegmentFetcherEvent::Chunk(chunk) => assert_eq!(chunk.data(), &Bytes::from_static(b"init")),
                other => panic!("unexpected event {other:?}"),
            }
            assert!(matches!(events[1], SegmentFetcherEvent::ChunkComplete));
        }
    }

    #[tokio::test]
    async fn test_text_segments_are_not_cached() {
        let loader = ScriptedLoader::new(|_| loaded(b"init"));
        let fetcher = fetcher(AdaptationType::Text, loader.clone());
        assert!(fetcher.cache().is_none());
        let content = test_content("t1", "init", true);
        collect(&fetcher, content.clone()).await;
        collect(&fetcher, content).await;
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_metrics_wait_for_every_chunk_to_be_parsed() {
        let loader = ScriptedLoader::new(|_| {
            vec![
                Ok(LoaderEvent::Progress(ProgressInfo {
                    duration: Duration::from_millis(10),
                    size: 2,
                    total_size: Some(4),
                })),
                Ok(LoaderEvent::Chunk(Bytes::from_static(b"ab"))),
                Ok(LoaderEvent::Chunk(Bytes::from_static(b"cd"))),
                Ok(LoaderEvent::ChunkComplete(metrics(4))),
            ]
        });
        let observer = Arc::new(RecordingObserver::default());
        let fetcher = fetcher(AdaptationType::Video, loader).with_observer(observer.clone());

        let events = collect(&fetcher, test_content("v1", "seg-1", false)).await;
        let chunks: Vec<SegmentChunk> = events
            .into_iter()
            .filter_map(|event| match event {
                SegmentFetcherEvent::Chunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(*observer.log.lock(), vec!["begin cdn-a", "progress 2", "end"]);
        assert!(observer.metrics.lock().is_empty());

        chunks[0].parse().unwrap();
        // Parsing the same chunk again does not count
        chunks[0].parse().unwrap();
        assert!(observer.metrics.lock().is_empty());

        let parsed = chunks[1].parse().unwrap();
        assert_eq!(parsed.data, Bytes::from_static(b"cd"));
        assert!(parsed.chunk_info.is_none());

        let sent = observer.metrics.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].size, Some(4));
        assert_eq!(sent[0].segment_duration, Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_next_cdn() {
        let loader = ScriptedLoader::new(|url| {
            if url.host_str() == Some("cdn-a.example.com") {
                vec![Err(Error::Http {
                    url: url.to_string(),
                    status: 503,
                })]
            } else {
                loaded(b"data")
            }
        });
        let observer = Arc::new(RecordingObserver::default());
        let fetcher = fetcher(AdaptationType::Audio, loader.clone()).with_observer(observer.clone());

        let events = collect(&fetcher, test_content("a1", "seg-1", false)).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SegmentFetcherEvent::Warning(Error::Http { status: 503, .. })));
        assert!(matches!(events[1], SegmentFetcherEvent::Chunk(_)));
        assert!(matches!(events[2], SegmentFetcherEvent::ChunkComplete));
        assert_eq!(loader.calls(), 2);

        if let SegmentFetcherEvent::Chunk(chunk) = &events[1] {
            let parsed = chunk.parse().unwrap();
            assert_eq!(parsed.chunk_info.map(|info| info.duration), Some(4.0));
        }
        assert_eq!(observer.metrics.lock().len(), 1);
        // One request from the observer's point of view
        assert_eq!(*observer.log.lock(), vec!["begin cdn-a", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_propagated() {
        let loader = ScriptedLoader::new(|url| {
            vec![Err(Error::Http {
                url: url.to_string(),
                status: 403,
            })]
        });
        let fetcher = fetcher(AdaptationType::Video, loader);
        let events: Vec<_> = fetcher.fetch(test_content("v1", "seg-1", false)).collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.as_ref().unwrap_err().error_code(), "HTTP_ERROR");
    }

    #[tokio::test]
    async fn test_dropping_fetch_ends_request() {
        let loader = ScriptedLoader::hanging();
        let observer = Arc::new(RecordingObserver::default());
        let fetcher = fetcher(AdaptationType::Video, loader.clone()).with_observer(observer.clone());

        let mut events = fetcher.fetch(test_content("v1", "seg-1", false));
        let polled = tokio::time::timeout(Duration::from_millis(20), events.next()).await;
        assert!(polled.is_err());
        assert_eq!(loader.calls(), 1);
        drop(events);
        assert_eq!(*observer.log.lock(), vec!["begin cdn-a", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_pending_retries() {
        let loader = ScriptedLoader::new(|url| {
            vec![Err(Error::Http {
                url: url.to_string(),
                status: 503,
            })]
        });
        let observer = Arc::new(RecordingObserver::default());
        let cancel = CancellationToken::new();
        let fetcher = fetcher(AdaptationType::Video, loader.clone())
            .with_observer(observer.clone())
            .with_cancellation(cancel.clone());

        let mut events = fetcher.fetch(test_content("v1", "seg-1", false));
        // Both CDNs failed, the fetch now waits for its backoff delay
        for _ in 0..2 {
            assert!(matches!(events.next().await, Some(Ok(SegmentFetcherEvent::Warning(_)))));
        }
        assert_eq!(loader.calls(), 2);

        cancel.cancel();
        let last = events.next().await;
        assert!(matches!(last, Some(Err(Error::Cancelled))));
        assert!(events.next().await.is_none());
        assert_eq!(loader.calls(), 2);
        assert_eq!(*observer.log.lock(), vec!["begin cdn-a", "end"]);
    }
}
