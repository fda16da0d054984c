use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ranges::RangeSet;

/// Persisted index for one cached resource.
///
/// Serialized to JSON next to the data file and rewritten after every
/// mutation, so a crash loses at most the most recent unsaved write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    /// Byte ranges already written to the data file
    pub ranges: RangeSet,

    /// Total size of the origin resource in bytes (0 = unknown)
    pub content_length: u64,

    /// MIME type reported by the origin (empty = unknown)
    pub content_type: String,

    /// When this index was created
    pub created_at: DateTime<Utc>,

    /// When this index was last modified
    pub last_modified: DateTime<Utc>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            ranges: RangeSet::new(),
            content_length: 0,
            content_type: String::new(),
            created_at: now,
            last_modified: now,
        }
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether both content length and content type are known.
    pub fn metadata_known(&self) -> bool {
        self.content_length > 0 && !self.content_type.is_empty()
    }

    /// Fill in metadata fields that are still unknown.
    ///
    /// Returns true if anything changed.
    pub fn absorb_metadata(&mut self, content_length: Option<u64>, content_type: Option<&str>) -> bool {
        let mut changed = false;

        if self.content_length == 0
            && let Some(len) = content_length
            && len > 0
        {
            self.content_length = len;
            changed = true;
        }

        if self.content_type.is_empty()
            && let Some(ct) = content_type
            && !ct.is_empty()
        {
            self.content_type = ct.to_string();
            changed = true;
        }

        if changed {
            self.last_modified = Utc::now();
        }
        changed
    }

    /// Record `length` bytes written at `offset`. Merges immediately.
    pub fn record_write(&mut self, offset: u64, length: u64) {
        self.ranges.insert(offset, length);
        self.last_modified = Utc::now();
    }

    /// Whether the entire resource has been cached.
    pub fn is_complete(&self) -> bool {
        self.content_length > 0 && self.ranges.total_cached_bytes() >= self.content_length
    }

    /// Integer percentage of the resource cached so far, when the total
    /// size is known.
    pub fn progress_percent(&self) -> Option<u32> {
        if self.content_length == 0 {
            return None;
        }
        let cached = self.ranges.total_cached_bytes().min(self.content_length);
        Some((cached * 100 / self.content_length) as u32)
    }
}
