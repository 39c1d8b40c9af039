use std::time::Duration;

use llmux_common::{ModelFamily, Service};
use llmux_keypool::{
    AcquireError, DisableReason, KEY_REUSE_DELAY, KeyEventHub, KeyEventKind, KeyPatch, KeyRecord,
    KeySecret, ServicePool,
};

fn bearer(service: Service, api_key: &str) -> KeyRecord {
    KeyRecord::new(
        service,
        KeySecret::Bearer {
            api_key: api_key.to_string(),
        },
    )
}

fn pool_with(service: Service, keys: Vec<KeyRecord>) -> ServicePool {
    ServicePool::new(service, keys, KeyEventHub::new(16))
}

#[tokio::test(start_paused = true)]
async fn get_prefers_least_recently_used() {
    let pool = pool_with(
        Service::Anthropic,
        vec![
            bearer(Service::Anthropic, "key-a"),
            bearer(Service::Anthropic, "key-b"),
        ],
    );

    let first = pool.get(ModelFamily::Claude).await.unwrap();
    // Skip past the reuse delay so both keys are eligible again.
    tokio::time::advance(KEY_REUSE_DELAY + Duration::from_millis(1)).await;
    let second = pool.get(ModelFamily::Claude).await.unwrap();
    assert_ne!(first.hash, second.hash, "LRU must rotate to the other key");
}

#[tokio::test(start_paused = true)]
async fn reuse_delay_blocks_immediate_reissue() {
    let pool = pool_with(Service::Anthropic, vec![bearer(Service::Anthropic, "k")]);

    pool.get(ModelFamily::Claude).await.unwrap();
    let err = pool.get(ModelFamily::Claude).await.unwrap_err();
    assert_eq!(err, AcquireError::NoKeysAvailable);

    tokio::time::advance(KEY_REUSE_DELAY + Duration::from_millis(1)).await;
    assert!(pool.get(ModelFamily::Claude).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_key_respects_lockout() {
    let pool = pool_with(Service::Anthropic, vec![bearer(Service::Anthropic, "k")]);
    let key = pool.get(ModelFamily::Claude).await.unwrap();

    pool.mark_rate_limited(&key.hash).await;
    tokio::time::advance(Duration::from_millis(1900)).await;
    assert!(pool.get(ModelFamily::Claude).await.is_err());

    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(pool.get(ModelFamily::Claude).await.is_ok());
}

#[tokio::test]
async fn disabled_key_is_never_returned() {
    let pool = pool_with(Service::Deepseek, vec![bearer(Service::Deepseek, "k")]);
    let key = pool.get(ModelFamily::Deepseek).await.unwrap();
    pool.disable(&key.hash, DisableReason::Revoked).await;

    let snapshot = pool.snapshot().await;
    assert!(snapshot[0].is_disabled);
    assert!(snapshot[0].is_revoked);
    assert_eq!(
        pool.get(ModelFamily::Deepseek).await.unwrap_err(),
        AcquireError::NoKeysAvailable
    );
}

#[tokio::test]
async fn revoked_implies_disabled_and_is_terminal_across_recheck() {
    let pool = pool_with(Service::OpenAi, vec![bearer(Service::OpenAi, "k")]);
    let key = pool.get(ModelFamily::Gpt4o).await.unwrap();
    pool.disable(&key.hash, DisableReason::Revoked).await;

    pool.recheck().await;
    let snapshot = pool.snapshot().await;
    assert!(snapshot[0].is_disabled, "revocation survives recheck");
}

#[tokio::test]
async fn quota_disable_recovers_on_recheck() {
    let pool = pool_with(Service::OpenAi, vec![bearer(Service::OpenAi, "k")]);
    let key = pool.get(ModelFamily::Gpt4o).await.unwrap();
    pool.disable(&key.hash, DisableReason::Quota).await;
    assert_eq!(pool.available(Some(ModelFamily::Gpt4o)).await, 0);

    pool.recheck().await;
    assert_eq!(pool.available(Some(ModelFamily::Gpt4o)).await, 1);
}

#[tokio::test]
async fn family_narrowing_holds_until_recheck() {
    let pool = pool_with(Service::Anthropic, vec![bearer(Service::Anthropic, "k")]);
    let key = pool.get(ModelFamily::ClaudeOpus).await.unwrap();

    pool.update(
        &key.hash,
        KeyPatch {
            remove_family: Some(ModelFamily::ClaudeOpus),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(pool.available(Some(ModelFamily::ClaudeOpus)).await, 0);
    assert_eq!(pool.available(Some(ModelFamily::Claude)).await, 1);

    pool.recheck().await;
    assert_eq!(pool.available(Some(ModelFamily::ClaudeOpus)).await, 1);
}

#[tokio::test(start_paused = true)]
async fn lockout_period_reports_smallest_pending_wait() {
    let pool = pool_with(
        Service::Anthropic,
        vec![
            bearer(Service::Anthropic, "key-a"),
            bearer(Service::Anthropic, "key-b"),
        ],
    );
    let a = pool.get(ModelFamily::Claude).await.unwrap();
    let b = pool.get(ModelFamily::Claude).await.unwrap();
    pool.mark_rate_limited(&a.hash).await;
    pool.mark_rate_limited(&b.hash).await;

    let lockout = pool.lockout_period(ModelFamily::Claude).await.unwrap();
    assert!(lockout > Duration::ZERO);
    assert!(lockout <= Duration::from_secs(2));

    // A family no key owns reports no lockout at all.
    assert!(pool.lockout_period(ModelFamily::Grok).await.is_none());
}

#[tokio::test]
async fn usage_is_credited_per_family() {
    let pool = pool_with(Service::GoogleAi, vec![bearer(Service::GoogleAi, "k")]);
    let key = pool.get(ModelFamily::GeminiPro).await.unwrap();

    pool.increment_usage(&key.hash, ModelFamily::GeminiPro, 100, 10)
        .await;
    pool.increment_usage(&key.hash, ModelFamily::GeminiPro, 50, 5)
        .await;
    pool.increment_usage(&key.hash, ModelFamily::GeminiFlash, 7, 3)
        .await;

    let snapshot = pool.snapshot().await;
    let usage = &snapshot[0].token_usage;
    assert_eq!(usage[&ModelFamily::GeminiPro].input, 150);
    assert_eq!(usage[&ModelFamily::GeminiPro].output, 15);
    assert_eq!(usage[&ModelFamily::GeminiFlash].input, 7);
    assert_eq!(snapshot[0].prompt_count, 3);
}

#[tokio::test]
async fn key_events_reach_subscribers() {
    let hub = KeyEventHub::new(16);
    let mut rx = hub.subscribe();
    let pool = ServicePool::new(
        Service::Xai,
        vec![bearer(Service::Xai, "k")],
        hub.clone(),
    );
    let key = pool.get(ModelFamily::Grok).await.unwrap();
    pool.mark_rate_limited(&key.hash).await;

    let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, KeyEventKind::RateLimited);
    assert_eq!(event.hash, key.hash);
}
