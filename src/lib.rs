//! Resumable, persistent byte-range cache for streamed media.
//!
//! One [`CacheEngine`] per origin URL sits between a media player and the
//! network: byte spans already on disk are served locally, missing spans are
//! fetched with HTTP range requests and streamed through to the caller while
//! being written to the cache. A coalesced range index is persisted next to
//! the data file so downloads resume across process restarts.

pub mod config;
pub mod engine;
pub mod error;
mod fetcher;
pub mod index;
pub mod ranges;
pub mod source;
pub mod stats;
pub mod storage;

pub use config::CacheConfig;
pub use engine::{CacheEngine, CacheEngineHandle};
pub use error::{CacheError, Result};
pub use index::CacheIndex;
pub use ranges::{ByteRange, RangeSet};
pub use source::{ByteSource, DataEvent, DataStream, RequestHandle, ResourceMetadata};
pub use stats::CacheStats;
