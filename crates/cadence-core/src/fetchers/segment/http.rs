//! Segment loader over HTTP

use crate::error::{Error, Result};
use crate::fetchers::segment::loader::{LoaderEvent, ProgressInfo, RequestMetrics, SegmentLoader};
use crate::manifest::SegmentLoaderContent;
use crate::utils::event_stream;
use bytes::BytesMut;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::RANGE;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

/// Loads segments with `reqwest`, optionally forwarding each received part
/// as a chunk
#[derive(Debug, Clone)]
pub struct HttpSegmentLoader {
    client: Client,
    chunked: bool,
}

impl HttpSegmentLoader {
    pub fn new(client: Client) -> Self {
        Self { client, chunked: false }
    }

    /// Emit received data as it comes instead of once complete
    pub fn chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }
}

impl Default for HttpSegmentLoader {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

/// Value of the `Range` header for an inclusive byte range
pub fn range_header((start, end): (u64, u64)) -> String {
    format!("bytes={start}-{end}")
}

impl SegmentLoader for HttpSegmentLoader {
    fn load(&self, url: &Url, content: &SegmentLoaderContent) -> BoxStream<'static, Result<LoaderEvent>> {
        let client = self.client.clone();
        let chunked = self.chunked;
        let url = url.clone();
        let range = content.segment.range;

        event_stream(move |sink| async move {
            let start = Instant::now();
            let mut request = client.get(url.clone());
            if let Some(range) = range {
                request = request.header(RANGE, range_header(range));
            }
            debug!(url = %url, ?range, "Fetchers: HTTP request");

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Http {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let total_size = response.content_length();
            let mut body = response.bytes_stream();
            let mut buffer = BytesMut::new();
            let mut size = 0u64;
            while let Some(part) = body.next().await {
                let part = part?;
                size += part.len() as u64;
                trace!(size, "Fetchers: Received data");
                sink.emit(LoaderEvent::Progress(ProgressInfo {
                    duration: start.elapsed(),
                    size,
                    total_size,
                }));
                if chunked {
                    sink.emit(LoaderEvent::Chunk(part));
                } else {
                    buffer.extend_from_slice(&part);
                }
            }

            let metrics = RequestMetrics {
                size: Some(size),
                duration: start.elapsed(),
            };
            if chunked {
                sink.emit(LoaderEvent::ChunkComplete(metrics));
            } else {
                sink.emit(LoaderEvent::Loaded {
                    data: buffer.freeze(),
                    metrics,
                });
            }
            Ok(())
        })
    }
}
