//! End-to-end tests for the cache engine against a mock HTTP origin.

use std::io::Write;
use std::time::Duration;

use spancache::{CacheConfig, CacheEngine, DataEvent};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_directory: Some(dir.path().to_path_buf()),
        request_timeout_secs: 10,
        enable_stats: true,
    }
}

#[tokio::test]
async fn cache_survives_engine_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let body = b"0123456789".to_vec();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v.mp4")
        .match_header("range", "bytes=0-9")
        .with_status(206)
        .with_header("content-range", "bytes 0-9/10")
        .with_header("content-type", "video/mp4")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/v.mp4", server.url());

    // First engine downloads and persists
    {
        let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();
        let stream = handle.request_data(0, Some(10)).await.unwrap();
        assert_eq!(stream.collect().await.unwrap(), body);
        handle.teardown().await.unwrap();
    }

    // Second engine on the same directory serves from disk
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();
    let stream = handle.request_data(0, Some(10)).await.unwrap();
    assert_eq!(stream.collect().await.unwrap(), body);

    // Exactly one origin request across both engine lifetimes
    mock.assert_async().await;
}

#[tokio::test]
async fn metadata_persisted_across_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("HEAD", "/v.mp4")
        .with_status(200)
        .with_header("content-length", "4096")
        .with_header("content-type", "video/mp4")
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/v.mp4", server.url());

    {
        let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();
        let meta = handle.request_metadata().await.unwrap();
        assert_eq!(meta.content_length, 4096);
        handle.teardown().await.unwrap();
    }

    // HEAD metadata was persisted immediately, so no second origin request
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();
    let meta = handle.request_metadata().await.unwrap();
    assert_eq!(meta.content_length, 4096);
    assert_eq!(meta.content_type, "video/mp4");

    mock.assert_async().await;
}

#[tokio::test]
async fn data_is_delivered_incrementally() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/v.mp4")
        .with_status(206)
        .with_header("content-range", "bytes 0-7/8")
        .with_chunked_body(|w| {
            w.write_all(b"AAAA")?;
            w.flush()?;
            std::thread::sleep(Duration::from_millis(300));
            w.write_all(b"BBBB")
        })
        .create_async()
        .await;

    let url = format!("{}/v.mp4", server.url());
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();

    let mut stream = handle.request_data(0, Some(8)).await.unwrap();

    // The first bytes arrive before the fetch has finished
    let mut chunks = Vec::new();
    let mut received = Vec::new();
    while let Some(event) = stream.recv().await {
        match event {
            DataEvent::Chunk(data) => {
                received.extend_from_slice(&data);
                chunks.push(data.len());
            }
            DataEvent::Done => break,
            DataEvent::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    assert_eq!(received, b"AAAABBBB");
    assert!(
        chunks.len() >= 2,
        "expected incremental delivery, got {:?}",
        chunks
    );
}

#[tokio::test]
async fn cancellation_finalizes_cleanly_and_keeps_partial_data() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v.mp4")
        .with_status(206)
        .with_header("content-range", "bytes 0-99/100")
        .with_chunked_body(|w| {
            w.write_all(b"AAAA")?;
            w.flush()?;
            // Leave the caller plenty of time to cancel mid-stream
            std::thread::sleep(Duration::from_millis(1500));
            w.write_all(&[b'B'; 96])
        })
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/v.mp4", server.url());
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();

    let mut stream = handle.request_data(0, None).await.unwrap();

    // Wait for the first chunk, then cancel
    let first = stream.recv().await.expect("first event");
    let first_len = match first {
        DataEvent::Chunk(data) => {
            assert_eq!(data, b"AAAA");
            data.len() as u64
        }
        other => panic!("expected chunk, got {:?}", other),
    };
    handle.cancel(stream.handle).await.unwrap();

    // Cancellation finishes the stream cleanly, never as an error
    loop {
        match stream.recv().await {
            Some(DataEvent::Chunk(_)) => continue,
            Some(DataEvent::Done) | None => break,
            Some(DataEvent::Failed(e)) => panic!("cancellation surfaced as error: {}", e),
        }
    }

    // The bytes received before cancellation are cached: re-requesting them
    // does not hit the origin again (expect(1) above)
    let stream = handle.request_data(0, Some(first_len)).await.unwrap();
    assert_eq!(stream.collect().await.unwrap(), b"AAAA");
    mock.assert_async().await;
}

#[tokio::test]
async fn to_end_request_uses_known_content_length() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let body = b"0123456789".to_vec();

    let mut server = mockito::Server::new_async().await;
    let _head = server
        .mock("HEAD", "/v.mp4")
        .with_status(200)
        .with_header("content-length", "10")
        .with_header("content-type", "video/mp4")
        .create_async()
        .await;
    let get = server
        .mock("GET", "/v.mp4")
        .match_header("range", "bytes=0-9")
        .with_status(206)
        .with_header("content-range", "bytes 0-9/10")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/v.mp4", server.url());
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();

    handle.request_metadata().await.unwrap();
    let stream = handle.request_data(0, Some(10)).await.unwrap();
    assert_eq!(stream.collect().await.unwrap(), body);
    get.assert_async().await;

    // "To end" resolves against the known content length: a cache hit
    let stream = handle.request_data(0, None).await.unwrap();
    assert_eq!(stream.collect().await.unwrap(), body);

    // A to-end request at the very end is zero bytes long and needs no fetch
    let stream = handle.request_data(10, None).await.unwrap();
    assert_eq!(stream.collect().await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn seek_pattern_coalesces_ranges() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let mut server = mockito::Server::new_async().await;
    // Player buffers the head, seeks to the middle, then backfills
    let mut mocks = Vec::new();
    for (range, body, content_range) in [
        ("bytes=0-9", "AAAAAAAAAA", "bytes 0-9/30"),
        ("bytes=20-29", "CCCCCCCCCC", "bytes 20-29/30"),
        ("bytes=10-19", "BBBBBBBBBB", "bytes 10-19/30"),
    ] {
        let mock = server
            .mock("GET", "/v.mp4")
            .match_header("range", range)
            .with_status(206)
            .with_header("content-range", content_range)
            .with_body(body)
            .expect(1)
            .create_async()
            .await;
        mocks.push(mock);
    }

    let url = format!("{}/v.mp4", server.url());
    let handle = CacheEngine::spawn(test_config(&dir), &url).unwrap();

    for (offset, expected) in [(0u64, "AAAAAAAAAA"), (20, "CCCCCCCCCC"), (10, "BBBBBBBBBB")] {
        let stream = handle.request_data(offset, Some(10)).await.unwrap();
        assert_eq!(stream.collect().await.unwrap(), expected.as_bytes());
    }

    // After backfill the three ranges merged into one; the whole resource
    // is now a single local read
    let stream = handle.request_data(0, Some(30)).await.unwrap();
    assert_eq!(
        stream.collect().await.unwrap(),
        b"AAAAAAAAAABBBBBBBBBBCCCCCCCCCC"
    );
}
