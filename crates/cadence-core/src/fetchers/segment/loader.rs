//! Transport-facing contracts of the segment pipeline

use crate::error::Result;
use crate::manifest::{AdaptationType, SegmentLoaderContent};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Measures of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMetrics {
    /// Bytes received, if known
    pub size: Option<u64>,
    /// Time between the request and its last byte
    pub duration: Duration,
}

/// Download progress of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInfo {
    pub duration: Duration,
    pub size: u64,
    pub total_size: Option<u64>,
}

/// Events of a single segment request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    Progress(ProgressInfo),
    /// Part of the segment, for requests delivered in chunks
    Chunk(Bytes),
    /// Every chunk has been received
    ChunkComplete(RequestMetrics),
    /// The whole segment at once
    Loaded { data: Bytes, metrics: RequestMetrics },
}

/// Performs one request for one URL
pub trait SegmentLoader: Send + Sync {
    /// Stream the events of a request.
    ///
    /// The stream must end either with a `ChunkComplete`, after zero or more
    /// `Chunk`, or with a single `Loaded`.
    fn load(&self, url: &Url, content: &SegmentLoaderContent) -> BoxStream<'static, Result<LoaderEvent>>;
}

/// Timing information of a parsed chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkInfo {
    /// Start time in seconds
    pub time: f64,
    /// Duration in seconds
    pub duration: f64,
}

/// Segment data ready to be pushed to a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSegment {
    pub data: Bytes,
    pub chunk_info: Option<ChunkInfo>,
}

/// Turns loaded data into pushable data
pub trait SegmentParser: Send + Sync {
    /// `is_chunked` is true for one part of a segment delivered in chunks
    fn parse(&self, data: &Bytes, content: &SegmentLoaderContent, is_chunked: bool) -> Result<ParsedSegment>;
}

/// Parser handing data over untouched, with the timing of the manifest
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughParser;

impl SegmentParser for PassthroughParser {
    fn parse(&self, data: &Bytes, content: &SegmentLoaderContent, is_chunked: bool) -> Result<ParsedSegment> {
        let segment = &content.segment;
        let chunk_info = (!segment.is_init && !is_chunked).then(|| ChunkInfo {
            time: segment.start_seconds(),
            duration: segment.duration_seconds(),
        });
        Ok(ParsedSegment {
            data: data.clone(),
            chunk_info,
        })
    }
}

/// Loader and parser of one type of buffer
#[derive(Clone)]
pub struct SegmentPipeline {
    pub loader: Arc<dyn SegmentLoader>,
    pub parser: Arc<dyn SegmentParser>,
}

/// Source of the segment pipelines of a streaming protocol
pub trait SegmentTransport: Send + Sync {
    fn segment_pipeline(&self, kind: AdaptationType) -> SegmentPipeline;
}

impl SegmentTransport for SegmentPipeline {
    fn segment_pipeline(&self, _kind: AdaptationType) -> SegmentPipeline {
        self.clone()
    }
}
