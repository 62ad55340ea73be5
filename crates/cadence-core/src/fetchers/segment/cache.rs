//! Cache of initialization segments
//!
//! Initialization segments are requested again each time a representation
//! is switched back to. Only the last one of each representation is kept.

use crate::manifest::SegmentLoaderContent;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct InitSegmentCache {
    /// Representation id -> (segment id, data)
    entries: Mutex<HashMap<String, (String, Bytes)>>,
}

impl InitSegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content: &SegmentLoaderContent) -> Option<Bytes> {
        if !content.segment.is_init {
            return None;
        }
        let entries = self.entries.lock();
        let (segment_id, data) = entries.get(&representation_key(content))?;
        (segment_id == &content.segment.id).then(|| data.clone())
    }

    /// Keep `data` as the initialization segment of its representation.
    /// Media segments are ignored.
    pub fn add(&self, content: &SegmentLoaderContent, data: Bytes) {
        if !content.segment.is_init {
            return;
        }
        self.entries
            .lock()
            .insert(representation_key(content), (content.segment.id.clone(), data));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn representation_key(content: &SegmentLoaderContent) -> String {
    let key = content.cache_key();
    format!("{}/{}/{}", key.period_id, key.adaptation_id, key.representation_id)
}
