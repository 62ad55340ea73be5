//! Turning an event-emitting future into a stream

use crate::Result;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sending half handed to the future driving an [`event_stream`]
pub struct EventSink<T> {
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> EventSink<T> {
    /// Emit an event. Returns `false` once the stream has been dropped.
    pub fn emit(&self, event: T) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Build a stream out of a future which emits events while it runs.
///
/// The events come out in emission order. If the future fails, its error is
/// the last item. The future only makes progress while the stream is polled
/// and is dropped along with the stream, which is how the work gets
/// cancelled.
pub fn event_stream<T, F, Fut>(f: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnOnce(EventSink<T>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();
    let work = f(EventSink { tx });

    let driver = async move {
        if let Err(err) = work.await {
            let _ = error_tx.send(Err(err));
        }
    };

    let events = UnboundedReceiverStream::new(rx);
    let driver = stream::once(driver).filter_map(|()| async { None::<Result<T>> });
    stream::select(events, driver).boxed()
}
