use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use llmux_common::Service;

use crate::registry::KeyPool;

/// Recheck cadence per service. OpenAI credentials change slowly; Google AI
/// per-family quotas reset often enough to warrant hourly probes.
fn recheck_interval(service: Service) -> Duration {
    match service {
        Service::OpenAi => Duration::from_secs(8 * 60 * 60),
        Service::GoogleAi => Duration::from_secs(60 * 60),
        _ => Duration::from_secs(6 * 60 * 60),
    }
}

/// Spawn one recheck task per service. Each task starts after a random
/// offset of up to a quarter interval so a fleet of hosts does not hammer
/// the providers in lockstep.
pub fn spawn_recheckers(pool: Arc<KeyPool>) {
    for service in Service::ALL {
        let interval = recheck_interval(service);
        let offset = {
            let quarter = interval.as_secs().max(4) / 4;
            Duration::from_secs(rand::rng().random_range(0..quarter))
        };
        let service_pool = pool.pool(service);
        tokio::spawn(async move {
            tokio::time::sleep(offset).await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::debug!(service = %service, "rechecking credentials");
                service_pool.recheck().await;
            }
        });
    }
}
