use bytes::Bytes;

/// Typed union every pipeline stage classifies into.
///
/// `UpstreamRateLimited` and `UpstreamUnavailable` re-enter the queue while
/// the retry budget lasts; key-state errors mutate the pool and are only
/// user-visible when no other key remains.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("prompt exceeds the context window: {0}")]
    ContextTooLarge(String),

    #[error("no keys available: {0}")]
    NoKeysAvailable(String),

    #[error("upstream rate limited")]
    UpstreamRateLimited,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("key revoked")]
    KeyRevoked,

    #[error("key over quota")]
    KeyOverQuota,

    #[error("client cancelled")]
    ClientCancelled,

    #[error("internal error: {0}")]
    InternalError(String),

    /// An upstream body relayed to the client verbatim, e.g. a moderation
    /// rejection. The proxy only appends a note.
    #[error("upstream error passthrough ({status})")]
    UpstreamPassthrough { status: u16, body: Bytes },
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::ContextTooLarge(_) => "context_too_large",
            ProxyError::NoKeysAvailable(_) => "no_keys_available",
            ProxyError::UpstreamRateLimited => "upstream_rate_limited",
            ProxyError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProxyError::KeyRevoked => "key_revoked",
            ProxyError::KeyOverQuota => "key_over_quota",
            ProxyError::ClientCancelled => "client_cancelled",
            ProxyError::InternalError(_) => "internal_error",
            ProxyError::UpstreamPassthrough { .. } => "upstream_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) | ProxyError::ContextTooLarge(_) => 400,
            ProxyError::NoKeysAvailable(_) => 503,
            ProxyError::UpstreamRateLimited => 429,
            ProxyError::UpstreamUnavailable(_) => 502,
            ProxyError::KeyRevoked | ProxyError::KeyOverQuota => 502,
            ProxyError::ClientCancelled => 499,
            ProxyError::InternalError(_) => 500,
            ProxyError::UpstreamPassthrough { status, .. } => *status,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamRateLimited
                | ProxyError::UpstreamUnavailable(_)
                | ProxyError::KeyRevoked
                | ProxyError::KeyOverQuota
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        assert!(ProxyError::UpstreamRateLimited.is_retryable());
        assert!(ProxyError::UpstreamUnavailable("503".into()).is_retryable());
        assert!(!ProxyError::BadRequest("x".into()).is_retryable());
        assert!(!ProxyError::ClientCancelled.is_retryable());
    }
}
