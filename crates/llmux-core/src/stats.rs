use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde_json::{Value as JsonValue, json};

use llmux_common::{ModelFamily, Service, family_cost};

use crate::state::AppState;

const INFO_CACHE_TTL: Duration = Duration::from_secs(2);

/// Aggregate counters for the info endpoint.
pub struct ProxyStats {
    prompts: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    info_cache: ArcSwapOption<CachedInfo>,
}

struct CachedInfo {
    built_at: Instant,
    doc: JsonValue,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            prompts: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            info_cache: ArcSwapOption::empty(),
        }
    }

    pub fn record_prompt(&self) {
        self.prompts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    pub fn refund_tokens(&self, input: u64) {
        // Saturating: a refund can race a recheck reset.
        let mut current = self.input_tokens.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(input);
            match self.input_tokens.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn prompts(&self) -> u64 {
        self.prompts.load(Ordering::Relaxed)
    }

    pub fn tokens(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The `GET /` document: per-family key health, usage, queue depth and wait
/// estimate, plus aggregate counters. Rebuilt at most every two seconds.
pub async fn info_document(state: &AppState) -> JsonValue {
    if let Some(cached) = state.stats.info_cache.load_full()
        && cached.built_at.elapsed() < INFO_CACHE_TTL
    {
        return cached.doc.clone();
    }

    let doc = build_info_document(state).await;
    state.stats.info_cache.store(Some(std::sync::Arc::new(CachedInfo {
        built_at: Instant::now(),
        doc: doc.clone(),
    })));
    doc
}

async fn build_info_document(state: &AppState) -> JsonValue {
    let mut families = serde_json::Map::new();

    for service in Service::ALL {
        let pool = state.keypool.pool(service);
        let keys = pool.snapshot().await;
        if keys.is_empty() {
            continue;
        }

        for family in ModelFamily::ALL {
            if !state.config.family_allowed(family) {
                continue;
            }
            let owners: Vec<_> = keys
                .iter()
                .filter(|key| key.model_families.contains(&family))
                .collect();
            if owners.is_empty() {
                continue;
            }

            let active = owners
                .iter()
                .filter(|key| !key.is_disabled)
                .count();
            let revoked = owners.iter().filter(|key| key.is_revoked).count();
            let over_quota = owners.iter().filter(|key| key.is_over_quota).count();
            let (input, output) = owners.iter().fold((0u64, 0u64), |acc, key| {
                let usage = key
                    .token_usage
                    .get(&family)
                    .copied()
                    .unwrap_or_default();
                (acc.0 + usage.input, acc.1 + usage.output)
            });
            let cost = family_cost(family).cost_of(input, output);
            let queue_stats = state.queue.stats(service, family).await;

            families.insert(
                family.as_str().to_string(),
                json!({
                    "service": service.as_str(),
                    "activeKeys": active,
                    "revokedKeys": revoked,
                    "overQuotaKeys": over_quota,
                    "usage": {
                        "input": input,
                        "output": output,
                        "cost": format!("${cost:.2}"),
                    },
                    "proomptersInQueue": queue_stats.queued,
                    "estimatedQueueTime": format!("{}s", queue_stats.estimated_wait.as_secs()),
                }),
            );
        }
    }

    let (input, output) = state.stats.tokens();
    json!({
        "uptime": state.started_at.elapsed().as_secs(),
        "proompts": state.stats.prompts(),
        "tookens": input + output,
        "build": env!("CARGO_PKG_VERSION"),
        "families": JsonValue::Object(families),
    })
}
