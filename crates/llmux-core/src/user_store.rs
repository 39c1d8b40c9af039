use async_trait::async_trait;

use llmux_common::{Dialect, ModelFamily};

/// Per-user accounting collaborator. The core does not persist user state;
/// deployments plug in their own store.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn increment_prompt_count(&self, token: &str);

    async fn increment_token_count(
        &self,
        token: &str,
        model: &str,
        dialect: Dialect,
        input: u64,
        output: u64,
    );

    /// Return the credit charged for an attempt that ended in a
    /// policy-violation rejection.
    async fn refund_last_attempt(&self, token: &str, family: ModelFamily, input: u64);
}

/// Default collaborator when no user store is wired in.
pub struct NoopUserStore;

#[async_trait]
impl UserStore for NoopUserStore {
    async fn increment_prompt_count(&self, _token: &str) {}

    async fn increment_token_count(
        &self,
        _token: &str,
        _model: &str,
        _dialect: Dialect,
        _input: u64,
        _output: u64,
    ) {
    }

    async fn refund_last_attempt(&self, _token: &str, _family: ModelFamily, _input: u64) {}
}
