//! Integration tests for the segment fetcher (C3, spec §4.3) against the
//! fake in-process NNTP server: success, provider failover (S3), and
//! graceful degradation (S6).

mod support;

use std::sync::Arc;
use std::time::Duration;

use nntpvfs::config::ProviderPriority;
use nntpvfs::fetch::FetchEngine;
use nntpvfs::pool::Pool;
use nntpvfs::provider::{OperationContext, UsageType};
use tokio::sync::Semaphore;

fn global_semaphore(cap: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(cap))
}

#[tokio::test]
async fn fetch_decodes_article_from_single_provider() {
    let server = support::FakeServer::start().await;
    let raw = b"hello from the only provider".to_vec();
    server.set_article("msg1", support::build_article("payload.bin", &raw));

    let provider = server.provider("primary", ProviderPriority::Primary, 4);
    let pool = Pool::new(provider, global_semaphore(200));
    let engine = FetchEngine::new(vec![pool], vec![], Duration::from_secs(5));

    let ctx = OperationContext::new(UsageType::Streaming);
    let fetched = engine.fetch("msg1", &ctx, false, raw.len() as u64).await.unwrap();

    assert_eq!(fetched.decoded.data, raw);
    assert!(!fetched.degraded);
}

#[tokio::test]
async fn fetch_fails_over_from_primary_to_backup() {
    // S3: primary reports the segment missing (430), backup serves it.
    let primary_server = support::FakeServer::start().await; // no articles registered -> always 430
    let backup_server = support::FakeServer::start().await;
    let raw = b"served only by the backup".to_vec();
    backup_server.set_article("msg2", support::build_article("payload.bin", &raw));

    let primary = Pool::new(
        primary_server.provider("primary", ProviderPriority::Primary, 4),
        global_semaphore(200),
    );
    let backup = Pool::new(
        backup_server.provider("backup", ProviderPriority::Backup, 4),
        global_semaphore(200),
    );
    let engine = FetchEngine::new(vec![primary], vec![backup], Duration::from_secs(5));

    let ctx = OperationContext::new(UsageType::Streaming);
    let fetched = engine.fetch("msg2", &ctx, false, raw.len() as u64).await.unwrap();
    assert_eq!(fetched.decoded.data, raw);
}

#[tokio::test]
async fn fetch_fails_terminally_when_all_providers_miss() {
    let primary_server = support::FakeServer::start().await;
    let backup_server = support::FakeServer::start().await;

    let primary = Pool::new(
        primary_server.provider("primary", ProviderPriority::Primary, 4),
        global_semaphore(200),
    );
    let backup = Pool::new(
        backup_server.provider("backup", ProviderPriority::Backup, 4),
        global_semaphore(200),
    );
    let engine = FetchEngine::new(vec![primary], vec![backup], Duration::from_secs(5));

    let ctx = OperationContext::new(UsageType::Streaming);
    let err = engine.fetch("ghost", &ctx, false, 1024).await.unwrap_err();
    assert!(matches!(err, nntpvfs::error::CoreError::ArticleNotFound { .. }));
}

#[tokio::test]
async fn graceful_degradation_substitutes_zero_filled_block() {
    // S6: every provider misses the segment but graceful_degradation=true.
    let server = support::FakeServer::start().await;
    let provider = server.provider("primary", ProviderPriority::Primary, 4);
    let pool = Pool::new(provider, global_semaphore(200));
    let engine = FetchEngine::new(vec![pool], vec![], Duration::from_secs(5));

    let ctx = OperationContext::new(UsageType::Streaming);
    let declared_size = 4096u64;
    let fetched = engine
        .fetch("missing-everywhere", &ctx, true, declared_size)
        .await
        .unwrap();

    assert!(fetched.degraded);
    assert_eq!(fetched.decoded.data.len(), declared_size as usize);
    assert!(fetched.decoded.data.iter().all(|&b| b == 0));
}
