use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use llmux_common::{ModelFamily, Service};

use crate::events::{KeyEvent, KeyEventHub, KeyEventKind};
use crate::record::{KeyPatch, KeyRecord};

/// Forced jitter after `get`: the same key is not handed out again until the
/// in-flight request's fate is known.
pub const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);

const RATE_LIMIT_LOCKOUT_DEFAULT: Duration = Duration::from_millis(2000);

/// Per-service lockout overrides for providers whose limits recover slowly.
fn rate_limit_lockout(service: Service) -> Duration {
    match service {
        Service::Aws => Duration::from_secs(10),
        Service::Cohere | Service::Moonshot => Duration::from_secs(5),
        _ => RATE_LIMIT_LOCKOUT_DEFAULT,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    NoKeysAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    Quota,
    Revoked,
}

/// All credentials of one service. Mutations are serialized behind one lock;
/// callers only ever receive value copies of records.
pub struct ServicePool {
    service: Service,
    keys: Mutex<Vec<KeyRecord>>,
    events: KeyEventHub,
}

impl ServicePool {
    pub fn new(service: Service, keys: Vec<KeyRecord>, events: KeyEventHub) -> Self {
        Self {
            service,
            keys: Mutex::new(keys),
            events,
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    /// Least-recently-used eligible key. On success the underlying record is
    /// touched: `last_used` moves to now, and `rate_limited_until` is pushed
    /// out by [`KEY_REUSE_DELAY`] so the dispatcher cannot flood one key.
    pub async fn get(&self, family: ModelFamily) -> Result<KeyRecord, AcquireError> {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;

        let chosen = keys
            .iter_mut()
            .filter(|key| key.eligible(family, now))
            .min_by(|a, b| {
                a.last_used
                    .cmp(&b.last_used)
                    .then_with(|| a.hash.cmp(&b.hash))
            });

        let Some(key) = chosen else {
            return Err(AcquireError::NoKeysAvailable);
        };

        key.last_used = Some(now);
        let reuse_until = now + KEY_REUSE_DELAY;
        key.rate_limited_until = Some(match key.rate_limited_until {
            Some(until) if until > reuse_until => until,
            _ => reuse_until,
        });
        Ok(key.clone())
    }

    pub async fn mark_rate_limited(&self, hash: &str) {
        let now = Instant::now();
        let lockout = rate_limit_lockout(self.service);
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.rate_limited_at = Some(now);
            key.rate_limited_until = Some(now + lockout);
            self.events.emit(KeyEvent {
                service: self.service,
                hash: hash.to_string(),
                kind: KeyEventKind::RateLimited,
            });
        }
    }

    pub async fn disable(&self, hash: &str, reason: DisableReason) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.is_disabled = true;
            match reason {
                DisableReason::Revoked => key.is_revoked = true,
                DisableReason::Quota => key.is_over_quota = true,
            }
            tracing::warn!(
                service = %self.service,
                key = %key.hash,
                ?reason,
                "credential removed from rotation"
            );
            self.events.emit(KeyEvent {
                service: self.service,
                hash: hash.to_string(),
                kind: KeyEventKind::Disabled,
            });
        }
    }

    /// Idempotent field-wise merge; unknown hashes are ignored.
    pub async fn update(&self, hash: &str, patch: KeyPatch) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            patch.apply(key);
            self.events.emit(KeyEvent {
                service: self.service,
                hash: hash.to_string(),
                kind: KeyEventKind::Updated,
            });
        }
    }

    pub async fn increment_usage(&self, hash: &str, family: ModelFamily, input: u64, output: u64) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.prompt_count += 1;
            let usage = key.token_usage.entry(family).or_default();
            usage.input += input;
            usage.output += output;
        }
    }

    /// Late credit for completion tokens counted after the response ends.
    /// Does not bump `prompt_count`; the dispatch already did.
    pub async fn credit_output(&self, hash: &str, family: ModelFamily, output: u64) {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.iter_mut().find(|key| key.hash == hash) {
            key.token_usage.entry(family).or_default().output += output;
        }
    }

    /// Count of keys eligible right now. `None` counts keys eligible for any
    /// of their families.
    pub async fn available(&self, family: Option<ModelFamily>) -> usize {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        keys.iter()
            .filter(|key| match family {
                Some(family) => key.eligible(family, now),
                None => {
                    !key.is_disabled
                        && !key.is_rate_limited(now)
                        && !key.model_families.is_empty()
                }
            })
            .count()
    }

    /// Smallest pending lockout among keys owning the family, zero when one
    /// is already eligible, `None` when no key owns the family at all (the
    /// dispatcher refuses to dispatch then).
    pub async fn lockout_period(&self, family: ModelFamily) -> Option<Duration> {
        let now = Instant::now();
        let keys = self.keys.lock().await;
        let mut smallest: Option<Duration> = None;
        let mut owns_family = false;
        for key in keys.iter() {
            if key.is_disabled || !key.serves_family(family) {
                continue;
            }
            owns_family = true;
            let pending = key
                .rate_limited_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            smallest = Some(match smallest {
                Some(current) if current < pending => current,
                _ => pending,
            });
        }
        if owns_family { smallest } else { None }
    }

    /// Value copies of every record, for the info endpoint and tests.
    pub async fn snapshot(&self) -> Vec<KeyRecord> {
        self.keys.lock().await.clone()
    }

    /// Periodic revalidation: transient flags clear, narrowed families are
    /// restored, and over-quota keys re-enter rotation for a fresh probe.
    /// Revocation is terminal.
    pub async fn recheck(&self) {
        let mut keys = self.keys.lock().await;
        let mut recovered = Vec::new();
        for key in keys.iter_mut() {
            key.last_checked = Some(std::time::SystemTime::now());
            if key.is_revoked {
                continue;
            }
            key.rate_limited_at = None;
            key.rate_limited_until = None;
            key.model_families = crate::record::default_families(self.service);
            if let crate::record::KeyExtra::GoogleAi {
                over_quota_families,
                ..
            } = &mut key.extra
            {
                over_quota_families.clear();
            }
            if key.is_disabled && key.is_over_quota {
                key.is_disabled = false;
                key.is_over_quota = false;
                recovered.push(key.hash.clone());
            }
        }
        drop(keys);
        for hash in recovered {
            self.events.emit(KeyEvent {
                service: self.service,
                hash,
                kind: KeyEventKind::Recovered,
            });
        }
    }
}
