//! Small shared helpers

pub mod backoff;
pub mod hash;
pub mod stream;

pub use backoff::{retry_with_backoff, RetryPolicy};
pub use hash::hash_buffer;
pub use stream::{event_stream, EventSink};
