use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fetcher::{FetchEvent, FetchOutcome, Fetcher};
use crate::source::{ByteSource, DataEvent, DataStream, RequestHandle, ResourceMetadata};
use crate::stats::{CacheStats, ProgressTracker};
use crate::storage::CacheStorage;

/// Commands accepted by the engine's worker loop.
#[derive(Debug)]
enum EngineCommand {
    RequestMetadata {
        respond_to: mpsc::UnboundedSender<Result<ResourceMetadata>>,
    },
    RequestData {
        offset: u64,
        length: Option<u64>,
        respond_to: mpsc::UnboundedSender<DataStream>,
    },
    Cancel {
        handle: RequestHandle,
        respond_to: mpsc::UnboundedSender<()>,
    },
    Teardown {
        respond_to: mpsc::UnboundedSender<()>,
    },
}

/// What an in-flight network task will fulfill once it completes.
#[derive(Debug)]
enum PendingKind {
    Metadata {
        respond_to: mpsc::UnboundedSender<Result<ResourceMetadata>>,
    },
    Data {
        events: mpsc::UnboundedSender<DataEvent>,
        /// Requested span, used to trim forwarding when the origin ignores
        /// `Range` and answers 200 with the full body
        span_start: u64,
        span_end: Option<u64>,
    },
}

/// In-flight request table entry. Inserted when a fetch is spawned and
/// removed exactly once, at its single terminal event (completion, error,
/// cancellation, or teardown).
#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    token: CancellationToken,
}

/// Byte-range cache engine for one streamed resource.
///
/// The worker loop exclusively owns the range index, the pending-request
/// table, and all file I/O. External commands and network-task completions
/// both arrive over channels and are handled one at a time, so no request
/// ever observes a half-merged index.
pub struct CacheEngine {
    origin_url: Url,
    storage: CacheStorage,
    fetcher: Fetcher,
    pending: HashMap<RequestHandle, PendingRequest>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    fetch_events: mpsc::UnboundedReceiver<FetchEvent>,
    stats: CacheStats,
    progress: ProgressTracker,
    enable_stats: bool,
    inert: bool,
}

impl CacheEngine {
    /// Create an engine for one origin URL.
    ///
    /// Fails only on invalid configuration, an unparseable URL, or an
    /// unusable cache directory. The caller drives the returned engine
    /// with [`CacheEngine::run`]; [`CacheEngine::spawn`] does both.
    pub fn new(config: CacheConfig, origin_url: &str) -> Result<(CacheEngineHandle, CacheEngine)> {
        config.validate()?;
        let url = Url::parse(origin_url)?;

        let cache_dir = config.cache_directory()?;
        let storage = CacheStorage::open(&cache_dir, origin_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let fetcher = Fetcher::new(client, url.clone(), fetch_tx);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stats = CacheStats::new();

        let handle = CacheEngineHandle {
            commands: cmd_tx,
            stats: stats.clone(),
        };
        let engine = Self {
            origin_url: url,
            storage,
            fetcher,
            pending: HashMap::new(),
            commands: cmd_rx,
            fetch_events: fetch_rx,
            stats,
            progress: ProgressTracker::new(),
            enable_stats: config.enable_stats,
            inert: false,
        };

        Ok((handle, engine))
    }

    /// Create an engine and spawn its worker loop on the current runtime.
    pub fn spawn(config: CacheConfig, origin_url: &str) -> Result<CacheEngineHandle> {
        let (handle, engine) = Self::new(config, origin_url)?;
        tokio::spawn(engine.run());
        Ok(handle)
    }

    /// Run the worker loop until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Cache engine for {} starting", self.origin_url);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // All handles gone; tear down and exit
                        self.teardown_inner();
                        break;
                    }
                },
                Some(event) = self.fetch_events.recv() => self.handle_fetch_event(event),
            }
        }

        if self.enable_stats {
            info!("{}", self.stats.format_report());
        }
        debug!("Cache engine for {} stopped", self.origin_url);
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::RequestMetadata { respond_to } => {
                self.request_metadata(respond_to);
            }
            EngineCommand::RequestData {
                offset,
                length,
                respond_to,
            } => {
                let stream = self.request_data(offset, length);
                let _ = respond_to.send(stream);
            }
            EngineCommand::Cancel { handle, respond_to } => {
                self.cancel_request(handle);
                let _ = respond_to.send(());
            }
            EngineCommand::Teardown { respond_to } => {
                self.teardown_inner();
                let _ = respond_to.send(());
            }
        }
    }

    fn request_metadata(&mut self, respond_to: mpsc::UnboundedSender<Result<ResourceMetadata>>) {
        self.stats.increment_request();

        if self.inert {
            let _ = respond_to.send(Err(CacheError::Disconnected));
            return;
        }

        let index = self.storage.index();
        if index.metadata_known() {
            self.stats.increment_cache_hit();
            let _ = respond_to.send(Ok(ResourceMetadata {
                content_length: index.content_length,
                content_type: index.content_type.clone(),
            }));
            return;
        }

        self.stats.increment_cache_miss();
        let handle = RequestHandle::new();
        let token = CancellationToken::new();
        self.pending.insert(
            handle,
            PendingRequest {
                kind: PendingKind::Metadata { respond_to },
                token: token.clone(),
            },
        );
        tokio::spawn(self.fetcher.clone().fetch_metadata(handle, token));
    }

    fn request_data(&mut self, offset: u64, length: Option<u64>) -> DataStream {
        self.stats.increment_request();

        let handle = RequestHandle::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = DataStream::new(handle, events_rx);

        if self.inert {
            let _ = events_tx.send(DataEvent::Done);
            return stream;
        }

        // A to-end request becomes a bounded span once the total size is
        // known; otherwise only the network can answer it.
        let known_total = self.storage.index().content_length;
        let effective_length = match length {
            Some(len) => Some(len),
            None if known_total > 0 => Some(known_total.saturating_sub(offset)),
            None => None,
        };

        if let Some(len) = effective_length
            && self.storage.index().ranges.is_fully_covered(offset, len)
        {
            self.stats.increment_cache_hit();
            debug!(
                "Cache hit for {} bytes at offset {} of {}",
                len, offset, self.origin_url
            );
            if len > 0 {
                match self.storage.read_range(offset, len) {
                    Ok(data) => {
                        self.stats.add_bytes_served(data.len() as u64);
                        let _ = events_tx.send(DataEvent::Chunk(data));
                    }
                    Err(e) => {
                        error!("Failed to read cached span at {}: {}", offset, e);
                        let _ = events_tx.send(DataEvent::Failed(e));
                        return stream;
                    }
                }
            }
            let _ = events_tx.send(DataEvent::Done);
            return stream;
        }

        self.stats.increment_cache_miss();
        debug!(
            "Cache miss for offset {} (length {:?}) of {}",
            offset, length, self.origin_url
        );

        let token = CancellationToken::new();
        self.pending.insert(
            handle,
            PendingRequest {
                kind: PendingKind::Data {
                    events: events_tx,
                    span_start: offset,
                    span_end: effective_length.map(|len| offset + len),
                },
                token: token.clone(),
            },
        );
        tokio::spawn(
            self.fetcher
                .clone()
                .fetch_range(handle, offset, length, token),
        );

        stream
    }

    fn cancel_request(&mut self, handle: RequestHandle) {
        // No effect when the request already completed
        if let Some(pending) = self.pending.get(&handle) {
            debug!("Cancelling request {}", handle);
            self.stats.increment_cancellation();
            pending.token.cancel();
        }
    }

    /// Cancel everything, clear the pending table, and go inert.
    /// Idempotent; called both for the external Teardown command and when
    /// the last handle is dropped.
    fn teardown_inner(&mut self) {
        if self.inert {
            return;
        }
        self.inert = true;

        let outstanding = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.token.cancel();
            match pending.kind {
                PendingKind::Data { events, .. } => {
                    let _ = events.send(DataEvent::Done);
                }
                PendingKind::Metadata { respond_to } => {
                    let _ = respond_to.send(Err(CacheError::Disconnected));
                }
            }
        }

        info!(
            "Cache engine for {} torn down ({} outstanding requests cancelled)",
            self.origin_url, outstanding
        );
    }

    fn handle_fetch_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Headers {
                handle,
                content_length,
                content_type,
            } => self.on_fetch_headers(handle, content_length, content_type),
            FetchEvent::Chunk {
                handle,
                offset,
                data,
            } => self.on_fetch_chunk(handle, offset, data),
            FetchEvent::Done { handle, outcome } => self.on_fetch_done(handle, outcome),
        }
    }

    fn on_fetch_headers(
        &mut self,
        handle: RequestHandle,
        content_length: Option<u64>,
        content_type: Option<String>,
    ) {
        // Late headers from a cancelled or torn-down request
        if !self.pending.contains_key(&handle) {
            return;
        }

        if self
            .storage
            .index_mut()
            .absorb_metadata(content_length, content_type.as_deref())
        {
            // Persist metadata as soon as it is known, not only on the
            // next byte write
            self.save_index();
        }
    }

    fn on_fetch_chunk(&mut self, handle: RequestHandle, offset: u64, data: Vec<u8>) {
        // Late chunks from a cancelled or torn-down request are dropped
        let Some(pending) = self.pending.get(&handle) else {
            return;
        };
        let PendingKind::Data {
            events,
            span_start,
            span_end,
        } = &pending.kind
        else {
            return;
        };
        let events = events.clone();
        let (span_start, span_end) = (*span_start, *span_end);

        let len = data.len() as u64;

        // Write first so the caller never holds bytes the cache lost
        if let Err(e) = self.storage.write_at(offset, &data) {
            error!("Failed to write fetched chunk at offset {}: {}", offset, e);
            if let Some(pending) = self.pending.remove(&handle) {
                pending.token.cancel();
            }
            let _ = events.send(DataEvent::Failed(e));
            return;
        }

        self.stats.add_bytes_fetched(len);

        // Forward incrementally; playback proceeds before the fetch ends.
        // On a 200 fallback the body starts at byte 0 regardless of the
        // requested span, so the caller gets only the intersection while
        // the full body is still cached.
        let chunk_end = offset + len;
        let forward_start = offset.max(span_start);
        let forward_end = span_end.map_or(chunk_end, |end| chunk_end.min(end));
        if forward_start < forward_end {
            let slice = &data[(forward_start - offset) as usize..(forward_end - offset) as usize];
            self.stats.add_bytes_served(slice.len() as u64);
            let _ = events.send(DataEvent::Chunk(slice.to_vec()));
        }

        // Extend the index, merge, and persist after every chunk. Saving is
        // write amplification traded for crash-safety; failures are
        // non-fatal because the in-memory index stays authoritative.
        self.storage.index_mut().record_write(offset, len);
        self.save_index();
        self.report_progress();
    }

    fn on_fetch_done(&mut self, handle: RequestHandle, outcome: FetchOutcome) {
        // The single point of cleanup for every pending request
        let Some(pending) = self.pending.remove(&handle) else {
            return;
        };

        match pending.kind {
            PendingKind::Metadata { respond_to } => match outcome {
                FetchOutcome::Success => {
                    // Malformed responses leave fields unknown; the caller
                    // degrades gracefully rather than erroring
                    let index = self.storage.index();
                    let _ = respond_to.send(Ok(ResourceMetadata {
                        content_length: index.content_length,
                        content_type: index.content_type.clone(),
                    }));
                }
                FetchOutcome::Cancelled => {
                    let _ = respond_to.send(Err(CacheError::Cancelled));
                }
                FetchOutcome::Failed(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            PendingKind::Data { events, .. } => match outcome {
                FetchOutcome::Success => {
                    debug!("Fetch for request {} completed", handle);
                    let _ = events.send(DataEvent::Done);
                }
                FetchOutcome::Cancelled => {
                    // Finalized cleanly, not surfaced as an error
                    debug!("Fetch for request {} cancelled", handle);
                    let _ = events.send(DataEvent::Done);
                }
                FetchOutcome::Failed(e) => {
                    error!("Fetch for request {} failed: {}", handle, e);
                    let _ = events.send(DataEvent::Failed(e));
                }
            },
        }
    }

    fn save_index(&mut self) {
        if let Err(e) = self.storage.save_index() {
            warn!(
                "Failed to save cache index for {}: {}",
                self.origin_url, e
            );
        }
    }

    fn report_progress(&mut self) {
        if !self.enable_stats {
            return;
        }
        if let Some(percent) = self.storage.index().progress_percent()
            && let Some(percent) = self.progress.update(percent)
        {
            info!("📥 Cached {}% of {}", percent, self.origin_url);
        }
    }
}

/// Cloneable handle to a running [`CacheEngine`].
///
/// All methods enqueue a command for the worker loop and await its reply;
/// callers are never blocked on network or disk I/O directly.
#[derive(Debug, Clone)]
pub struct CacheEngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    stats: CacheStats,
}

impl CacheEngineHandle {
    pub async fn request_metadata(&self) -> Result<ResourceMetadata> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::RequestMetadata { respond_to: sender })
            .map_err(|_| CacheError::Disconnected)?;

        receiver.recv().await.ok_or(CacheError::Disconnected)?
    }

    pub async fn request_data(&self, offset: u64, length: Option<u64>) -> Result<DataStream> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::RequestData {
                offset,
                length,
                respond_to: sender,
            })
            .map_err(|_| CacheError::Disconnected)?;

        receiver.recv().await.ok_or(CacheError::Disconnected)
    }

    pub async fn cancel(&self, handle: RequestHandle) -> Result<()> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::Cancel {
                handle,
                respond_to: sender,
            })
            .map_err(|_| CacheError::Disconnected)?;

        receiver.recv().await.ok_or(CacheError::Disconnected)
    }

    /// Tear the engine down: cancel all in-flight work and render it inert.
    /// Blocks until cleanup completed. Idempotent.
    pub async fn teardown(&self) -> Result<()> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.commands
            .send(EngineCommand::Teardown { respond_to: sender })
            .map_err(|_| CacheError::Disconnected)?;

        receiver.recv().await.ok_or(CacheError::Disconnected)
    }

    /// Snapshot of the engine's counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[async_trait]
impl ByteSource for CacheEngineHandle {
    async fn request_metadata(&self) -> Result<ResourceMetadata> {
        CacheEngineHandle::request_metadata(self).await
    }

    async fn request_data(&self, offset: u64, length: Option<u64>) -> Result<DataStream> {
        CacheEngineHandle::request_data(self, offset, length).await
    }

    async fn cancel(&self, handle: RequestHandle) -> Result<()> {
        CacheEngineHandle::cancel(self, handle).await
    }

    async fn teardown(&self) -> Result<()> {
        CacheEngineHandle::teardown(self).await
    }
}
