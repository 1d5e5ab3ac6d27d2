//! Transcript types produced by the transcription stage

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one contiguous span of detected speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub Uuid);

impl SegmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transcript revision for a speech segment.
///
/// Partials are monotonically revised: a later partial for the same segment
/// supersedes an earlier one. A final transcript is immutable and terminal
/// for its segment; consumers must only act on finals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub segment: SegmentId,
    pub text: String,
    pub is_final: bool,
    /// Revision counter within the segment, strictly increasing
    pub revision: u32,
}

impl Transcript {
    pub fn partial(segment: SegmentId, text: impl Into<String>, revision: u32) -> Self {
        Self {
            segment,
            text: text.into(),
            is_final: false,
            revision,
        }
    }

    pub fn final_for(segment: SegmentId, text: impl Into<String>, revision: u32) -> Self {
        Self {
            segment,
            text: text.into(),
            is_final: true,
            revision,
        }
    }

    /// True when there is no usable speech in this transcript
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}
