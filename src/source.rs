use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CacheError, Result};

/// Opaque identifier for one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(Uuid);

impl RequestHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Resource metadata a player needs before playback can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Total size in bytes (0 = unknown)
    pub content_length: u64,
    /// MIME type (empty = unknown)
    pub content_type: String,
}

/// Incremental delivery events for one data request.
#[derive(Debug)]
pub enum DataEvent {
    /// A chunk of requested bytes, delivered in offset order
    Chunk(Vec<u8>),
    /// The request finished; also sent when a request is cancelled or the
    /// engine is torn down
    Done,
    /// The request failed with a genuine (non-cancellation) error
    Failed(CacheError),
}

/// An in-progress data request: its handle (for cancellation) and the
/// stream of delivery events.
#[derive(Debug)]
pub struct DataStream {
    pub handle: RequestHandle,
    events: mpsc::UnboundedReceiver<DataEvent>,
}

impl DataStream {
    pub(crate) fn new(handle: RequestHandle, events: mpsc::UnboundedReceiver<DataEvent>) -> Self {
        Self { handle, events }
    }

    /// Receive the next delivery event. `None` once the stream terminated.
    pub async fn recv(&mut self) -> Option<DataEvent> {
        self.events.recv().await
    }

    /// Drain the stream into a single buffer, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(event) = self.recv().await {
            match event {
                DataEvent::Chunk(bytes) => out.extend_from_slice(&bytes),
                DataEvent::Done => return Ok(out),
                DataEvent::Failed(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Abstract byte source a playback component reads from.
///
/// The cache engine implements this; the player never talks to the origin
/// directly.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Resolve content length and type, from the index when known and from
    /// the origin otherwise.
    ///
    /// `Err(CacheError::Cancelled)` here means the request was cancelled,
    /// not that anything failed; a torn-down source answers
    /// `Err(CacheError::Disconnected)` instead. Neither is worth logging
    /// as an error.
    async fn request_metadata(&self) -> Result<ResourceMetadata>;

    /// Request `length` bytes starting at `offset`; `None` means to the end
    /// of the resource. Data is delivered incrementally.
    async fn request_data(&self, offset: u64, length: Option<u64>) -> Result<DataStream>;

    /// Cancel an outstanding request. No effect if it already completed.
    async fn cancel(&self, handle: RequestHandle) -> Result<()>;

    /// Cancel everything and render the source inert. Idempotent.
    async fn teardown(&self) -> Result<()>;
}
