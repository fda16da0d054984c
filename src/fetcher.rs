use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

use crate::error::CacheError;
use crate::source::RequestHandle;

/// Messages a fetch task sends back into the engine's serialized loop.
#[derive(Debug)]
pub(crate) enum FetchEvent {
    /// Response headers arrived; metadata extracted from them, if any
    Headers {
        handle: RequestHandle,
        content_length: Option<u64>,
        content_type: Option<String>,
    },
    /// A body chunk arrived, positioned at its absolute resource offset
    Chunk {
        handle: RequestHandle,
        offset: u64,
        data: Vec<u8>,
    },
    /// The task finished; the single terminal event per fetch
    Done {
        handle: RequestHandle,
        outcome: FetchOutcome,
    },
}

#[derive(Debug)]
pub(crate) enum FetchOutcome {
    Success,
    Cancelled,
    Failed(CacheError),
}

/// Issues HEAD and ranged GET requests against the origin and streams the
/// results back to the engine. One instance per engine; tasks are spawned
/// per request.
#[derive(Debug, Clone)]
pub(crate) struct Fetcher {
    client: Client,
    origin_url: Url,
    events: mpsc::UnboundedSender<FetchEvent>,
}

impl Fetcher {
    pub(crate) fn new(
        client: Client,
        origin_url: Url,
        events: mpsc::UnboundedSender<FetchEvent>,
    ) -> Self {
        Self {
            client,
            origin_url,
            events,
        }
    }

    /// HEAD the origin for content length and type.
    pub(crate) async fn fetch_metadata(self, handle: RequestHandle, token: CancellationToken) {
        let request = self.client.head(self.origin_url.clone());

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.finish(handle, FetchOutcome::Cancelled);
                return;
            }
            result = request.send() => match result {
                Ok(resp) => resp,
                Err(e) => {
                    error!("HEAD request to {} failed: {}", self.origin_url, e);
                    self.finish(handle, FetchOutcome::Failed(e.into()));
                    return;
                }
            },
        };

        if !response.status().is_success() {
            let status = response.status();
            error!("HEAD request to {} returned {}", self.origin_url, status);
            self.finish(
                handle,
                FetchOutcome::Failed(CacheError::Network(format!("HTTP error: {}", status))),
            );
            return;
        }

        let (content_length, content_type) = extract_metadata(response.headers());
        let _ = self.events.send(FetchEvent::Headers {
            handle,
            content_length,
            content_type,
        });
        self.finish(handle, FetchOutcome::Success);
    }

    /// GET the missing span `[offset, offset + length - 1]`, or from
    /// `offset` to the end of the resource when `length` is `None`.
    /// Chunks are streamed back as they arrive, not buffered.
    pub(crate) async fn fetch_range(
        self,
        handle: RequestHandle,
        offset: u64,
        length: Option<u64>,
        token: CancellationToken,
    ) {
        let range_value = range_header_value(offset, length);
        debug!(
            "Fetching {} with Range: {}",
            self.origin_url, range_value
        );

        let request = self
            .client
            .get(self.origin_url.clone())
            .header(RANGE, range_value);

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.finish(handle, FetchOutcome::Cancelled);
                return;
            }
            result = request.send() => match result {
                Ok(resp) => resp,
                Err(e) => {
                    error!("GET request to {} failed: {}", self.origin_url, e);
                    self.finish(handle, FetchOutcome::Failed(e.into()));
                    return;
                }
            },
        };

        // Origins without range support answer 200 with the full body;
        // both are acceptable because the cursor starts at the requested
        // offset only for 206.
        let status = response.status();
        if !status.is_success() {
            error!("GET request to {} returned {}", self.origin_url, status);
            self.finish(
                handle,
                FetchOutcome::Failed(CacheError::Network(format!("HTTP error: {}", status))),
            );
            return;
        }

        let (content_length, content_type) = extract_metadata(response.headers());
        let _ = self.events.send(FetchEvent::Headers {
            handle,
            content_length,
            content_type,
        });

        let mut cursor = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };

        let mut stream = response.bytes_stream();
        loop {
            let chunk_result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.finish(handle, FetchOutcome::Cancelled);
                    return;
                }
                next = stream.next() => match next {
                    Some(r) => r,
                    None => break,
                },
            };

            match chunk_result {
                Ok(chunk) => {
                    let data = chunk.to_vec();
                    let len = data.len() as u64;
                    let _ = self.events.send(FetchEvent::Chunk {
                        handle,
                        offset: cursor,
                        data,
                    });
                    cursor += len;
                }
                Err(e) => {
                    error!("Stream error from {}: {}", self.origin_url, e);
                    self.finish(handle, FetchOutcome::Failed(e.into()));
                    return;
                }
            }
        }

        self.finish(handle, FetchOutcome::Success);
    }

    fn finish(&self, handle: RequestHandle, outcome: FetchOutcome) {
        let _ = self.events.send(FetchEvent::Done { handle, outcome });
    }
}

/// Pull content length and type out of response headers. The total size
/// comes from `Content-Length` when present, otherwise from the total in a
/// `Content-Range: bytes <start>-<end>/<total>` header.
fn extract_metadata(headers: &reqwest::header::HeaderMap) -> (Option<u64>, Option<String>) {
    let from_content_range = headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total);

    let content_length = match from_content_range {
        Some(total) => Some(total),
        None => headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok()),
    };

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    (content_length, content_type)
}

/// Parse the total size from `bytes <start>-<end>/<total>`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    if total == "*" {
        return None;
    }
    total.trim().parse::<u64>().ok()
}

/// Build a `Range` header value for the missing span.
fn range_header_value(offset: u64, length: Option<u64>) -> String {
    match length {
        Some(len) if len > 0 => format!("bytes={}-{}", offset, offset + len - 1),
        _ => format!("bytes={}-", offset),
    }
}
