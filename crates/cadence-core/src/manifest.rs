//! Manifest object graph consumed by the segment fetchers
//!
//! Manifest parsing lives elsewhere; this module only carries the identity
//! and addressing data needed to request a segment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Type of media carried by an adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptationType {
    Audio,
    Video,
    Text,
    Image,
}

impl AdaptationType {
    /// Audio and video initialization segments are worth caching as they are
    /// requested again on every representation switch
    pub fn caches_init_segments(&self) -> bool {
        matches!(self, AdaptationType::Audio | AdaptationType::Video)
    }
}

impl fmt::Display for AdaptationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdaptationType::Audio => "audio",
            AdaptationType::Video => "video",
            AdaptationType::Text => "text",
            AdaptationType::Image => "image",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub id: String,
    /// Start time in seconds
    pub start: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    pub id: String,
    pub kind: AdaptationType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
}

/// A single segment of a representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    /// Start time, in `timescale` units
    pub time: u64,
    /// Duration, in `timescale` units
    pub duration: u64,
    pub timescale: u32,
    /// Initialization segment of its representation
    pub is_init: bool,
    /// Candidate URLs, one per CDN, in preference order
    pub media_urls: Vec<Url>,
    /// Inclusive byte range, if only a part of the resource is wanted
    pub range: Option<(u64, u64)>,
}

impl Segment {
    /// Start time in seconds
    pub fn start_seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.time as f64 / self.timescale as f64
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.duration as f64 / self.timescale as f64
    }
}

/// Context shared by every segment of a representation
#[derive(Debug, Clone)]
pub struct SegmentContext {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
}

impl SegmentContext {
    /// Attach a segment to this context
    pub fn with_segment(&self, segment: Arc<Segment>) -> SegmentLoaderContent {
        SegmentLoaderContent {
            manifest: self.manifest.clone(),
            period: self.period.clone(),
            adaptation: self.adaptation.clone(),
            representation: self.representation.clone(),
            segment,
        }
    }
}

/// Identifies exactly which resource to fetch.
///
/// Every element is shared with the manifest object graph.
#[derive(Debug, Clone)]
pub struct SegmentLoaderContent {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub segment: Arc<Segment>,
}

impl SegmentLoaderContent {
    /// Key identifying this content in a segment cache
    pub fn cache_key(&self) -> SegmentCacheKey {
        SegmentCacheKey {
            period_id: self.period.id.clone(),
            adaptation_id: self.adaptation.id.clone(),
            representation_id: self.representation.id.clone(),
            segment_id: self.segment.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentCacheKey {
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub segment_id: String,
}
