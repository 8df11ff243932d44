//! Integration tests for the buffered segmented stream (C5, spec §4.5)
//! against the fake in-process NNTP server: sequential read (S1-style) and
//! random seek (S2-style).

mod support;

use std::sync::Arc;
use std::time::Duration;

use nntpvfs::config::ProviderPriority;
use nntpvfs::fetch::FetchEngine;
use nntpvfs::pool::Pool;
use nntpvfs::provider::{OperationContext, UsageType};
use nntpvfs::stream::segmented::SegmentedStream;
use nntpvfs::stream::{SeekFrom, SeekableRead};
use tokio::sync::Semaphore;

struct Fixture {
    _server: support::FakeServer,
    engine: Arc<FetchEngine>,
    message_ids: Vec<String>,
    segment_sizes: Vec<u64>,
    expected: Vec<u8>,
}

async fn build_fixture() -> Fixture {
    let server = support::FakeServer::start().await;
    let segments: Vec<Vec<u8>> = vec![
        b"segment-zero-bytes-here-".repeat(3),
        b"the-second-segments-payload-".repeat(2),
        b"final-tail-segment".to_vec(),
    ];

    let mut message_ids = Vec::new();
    let mut segment_sizes = Vec::new();
    let mut expected = Vec::new();
    for (i, raw) in segments.iter().enumerate() {
        let id = format!("seg-{i}");
        server.set_article(&id, support::build_article(&format!("part{i}.bin"), raw));
        message_ids.push(id);
        segment_sizes.push(raw.len() as u64);
        expected.extend_from_slice(raw);
    }

    let provider = server.provider("primary", ProviderPriority::Primary, 4);
    let pool = Pool::new(provider, Arc::new(Semaphore::new(200)));
    let engine = Arc::new(FetchEngine::new(vec![pool], vec![], Duration::from_secs(5)));

    Fixture {
        _server: server,
        engine,
        message_ids,
        segment_sizes,
        expected,
    }
}

#[tokio::test]
async fn sequential_read_reproduces_logical_bytes() {
    let fx = build_fixture().await;
    let ctx = OperationContext::new(UsageType::Streaming);
    let mut stream = SegmentedStream::new(
        fx.message_ids.clone(),
        fx.segment_sizes.clone(),
        fx.engine.clone(),
        ctx,
        false,
        4,
        4,
    );

    let mut collected = Vec::new();
    let mut buf = [0u8; 7]; // deliberately not aligned to segment boundaries
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }

    assert_eq!(collected, fx.expected);
}

#[tokio::test]
async fn seek_into_middle_segment_then_read() {
    let fx = build_fixture().await;
    let ctx = OperationContext::new(UsageType::Streaming);
    let mut stream = SegmentedStream::new(
        fx.message_ids.clone(),
        fx.segment_sizes.clone(),
        fx.engine.clone(),
        ctx,
        false,
        4,
        4,
    );

    let offset = fx.segment_sizes[0] + 3; // three bytes into the second segment
    let pos = stream.seek(SeekFrom::Start(offset)).await.unwrap();
    assert_eq!(pos, offset);

    let mut buf = vec![0u8; 5];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &fx.expected[offset as usize..offset as usize + n]);
}

#[tokio::test]
async fn seek_past_logical_length_is_rejected() {
    let fx = build_fixture().await;
    let ctx = OperationContext::new(UsageType::Streaming);
    let mut stream = SegmentedStream::new(
        fx.message_ids.clone(),
        fx.segment_sizes.clone(),
        fx.engine.clone(),
        ctx,
        false,
        4,
        4,
    );

    let total: u64 = fx.segment_sizes.iter().sum();
    let err = stream.seek(SeekFrom::Start(total + 1)).await.unwrap_err();
    assert!(matches!(err, nntpvfs::error::CoreError::SeekPositionNotFound { .. }));
}
