use llmux_common::{ModelFamily, ProxyError, Service};

use crate::upstream::{Headers, TransportErrorKind, UpstreamFailure, header_get};

/// Pool mutation an upstream failure demands before the request is retried
/// or surfaced.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyAction {
    None,
    RateLimit,
    DisableRevoked,
    DisableQuota,
    /// Google AI quota exhaustion hits one family, not the key.
    OverQuotaFamily(ModelFamily),
    /// AWS access denial narrows the key instead of disabling it.
    NarrowFamily(ModelFamily),
    SetRequiresPreamble,
    DisallowMultimodality,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Revert per-attempt mutations and re-enqueue at the partition tail.
    Retry(ProxyError),
    /// Return a typed error to the client.
    Surface(ProxyError),
    /// Relay the upstream body verbatim with a proxy note attached.
    Passthrough { refund: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub key_action: KeyAction,
    pub outcome: FailureOutcome,
}

fn classified(key_action: KeyAction, outcome: FailureOutcome) -> Classified {
    Classified {
        key_action,
        outcome,
    }
}

/// Map one upstream failure to a key action and a request disposition,
/// per-service. `family` is the partition family of the failed attempt.
pub fn classify_failure(
    service: Service,
    family: ModelFamily,
    failure: &UpstreamFailure,
) -> Classified {
    match failure {
        UpstreamFailure::Transport { kind, message } => classify_transport(*kind, message),
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => classify_http(service, family, *status, headers, body),
    }
}

fn classify_transport(kind: TransportErrorKind, message: &str) -> Classified {
    let error = ProxyError::UpstreamUnavailable(format!("{kind:?}: {message}"));
    match kind {
        TransportErrorKind::Timeout
        | TransportErrorKind::ReadTimeout
        | TransportErrorKind::Connect
        | TransportErrorKind::Dns => classified(KeyAction::None, FailureOutcome::Retry(error)),
        TransportErrorKind::Tls | TransportErrorKind::Other => {
            classified(KeyAction::None, FailureOutcome::Surface(error))
        }
    }
}

fn classify_http(
    service: Service,
    family: ModelFamily,
    status: u16,
    headers: &Headers,
    body: &[u8],
) -> Classified {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();

    match status {
        400 => classify_400(service, &text),
        401 => classified(
            KeyAction::DisableRevoked,
            FailureOutcome::Retry(ProxyError::KeyRevoked),
        ),
        402 if service == Service::Deepseek => classified(
            KeyAction::DisableQuota,
            FailureOutcome::Retry(ProxyError::KeyOverQuota),
        ),
        403 => classify_403(service, family, &text),
        404 => classified(KeyAction::None, FailureOutcome::Passthrough { refund: false }),
        405 if service == Service::Xai && text.contains("insufficient") => classified(
            KeyAction::DisableQuota,
            FailureOutcome::Retry(ProxyError::KeyOverQuota),
        ),
        429 => classify_429(service, family, headers, &text),
        503 if service == Service::Aws => classified(
            KeyAction::None,
            FailureOutcome::Retry(ProxyError::UpstreamUnavailable("bedrock 503".to_string())),
        ),
        500..=599 => classified(
            KeyAction::None,
            FailureOutcome::Retry(ProxyError::UpstreamUnavailable(format!(
                "upstream returned {status}"
            ))),
        ),
        _ => classified(
            KeyAction::None,
            FailureOutcome::Surface(ProxyError::UpstreamUnavailable(format!(
                "unexpected upstream status {status}"
            ))),
        ),
    }
}

fn classify_400(service: Service, text: &str) -> Classified {
    if text.contains("billing_hard_limit_reached") {
        return classified(
            KeyAction::DisableQuota,
            FailureOutcome::Retry(ProxyError::KeyOverQuota),
        );
    }
    if service == Service::Anthropic && text.contains("prompt must start with") {
        return classified(
            KeyAction::SetRequiresPreamble,
            FailureOutcome::Retry(ProxyError::UpstreamUnavailable(
                "key requires preamble".to_string(),
            )),
        );
    }
    if is_moderation_rejection(text) {
        // Moderation rejections pass through verbatim and refund the
        // attempt's token credit.
        return classified(KeyAction::None, FailureOutcome::Passthrough { refund: true });
    }
    classified(KeyAction::None, FailureOutcome::Passthrough { refund: false })
}

fn is_moderation_rejection(text: &str) -> bool {
    text.contains("content_filter")
        || text.contains("content management policy")
        || text.contains("moderation")
        || text.contains("flagged")
}

fn classify_403(service: Service, family: ModelFamily, text: &str) -> Classified {
    match service {
        Service::Anthropic if text.contains("image") || text.contains("multimodal") => classified(
            KeyAction::DisallowMultimodality,
            FailureOutcome::Retry(ProxyError::UpstreamUnavailable(
                "key lost multimodal access".to_string(),
            )),
        ),
        Service::Aws if text.contains("accessdeniedexception") => classified(
            KeyAction::NarrowFamily(family),
            FailureOutcome::Retry(ProxyError::UpstreamUnavailable(
                "key lost model access".to_string(),
            )),
        ),
        _ => classified(
            KeyAction::DisableRevoked,
            FailureOutcome::Retry(ProxyError::KeyRevoked),
        ),
    }
}

fn classify_429(
    service: Service,
    family: ModelFamily,
    headers: &Headers,
    text: &str,
) -> Classified {
    if service == Service::GoogleAi {
        if text.contains("\"quota_limit_value\":\"0\"") || text.contains("quota_limit_value: 0") {
            // A zeroed quota limit means the key was hard-disabled upstream.
            return classified(
                KeyAction::DisableRevoked,
                FailureOutcome::Retry(ProxyError::KeyRevoked),
            );
        }
        if text.contains("resource_exhausted") || text.contains("quota") {
            return classified(
                KeyAction::OverQuotaFamily(family),
                FailureOutcome::Retry(ProxyError::KeyOverQuota),
            );
        }
    }
    if is_daily_limit(headers, text) {
        // Per-day limits will not clear inside any sane retry window.
        return classified(
            KeyAction::RateLimit,
            FailureOutcome::Surface(ProxyError::UpstreamRateLimited),
        );
    }
    classified(
        KeyAction::RateLimit,
        FailureOutcome::Retry(ProxyError::UpstreamRateLimited),
    )
}

fn is_daily_limit(headers: &Headers, text: &str) -> bool {
    if text.contains("per day") || text.contains("requests_per_day") || text.contains("rpd") {
        return true;
    }
    matches!(
        header_get(headers, "x-ratelimit-limit-requests-day"),
        Some(_)
    )
}

/// Parse an upstream Retry-After header, seconds or HTTP-date form.
pub fn parse_retry_after(headers: &Headers) -> Option<std::time::Duration> {
    let value = header_get(headers, "retry-after")?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(std::time::Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_failure(status: u16, body: &str) -> UpstreamFailure {
        UpstreamFailure::Http {
            status,
            headers: Vec::new(),
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn rate_limit_marks_and_retries() {
        let out = classify_failure(
            Service::Anthropic,
            ModelFamily::Claude,
            &http_failure(429, r#"{"error":{"type":"rate_limit_error"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::RateLimit);
        assert!(matches!(
            out.outcome,
            FailureOutcome::Retry(ProxyError::UpstreamRateLimited)
        ));
    }

    #[test]
    fn google_quota_hits_single_family() {
        let out = classify_failure(
            Service::GoogleAi,
            ModelFamily::GeminiPro,
            &http_failure(
                429,
                r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"quota exceeded"}}"#,
            ),
        );
        assert_eq!(
            out.key_action,
            KeyAction::OverQuotaFamily(ModelFamily::GeminiPro)
        );
        assert!(matches!(out.outcome, FailureOutcome::Retry(_)));
    }

    #[test]
    fn google_zeroed_quota_revokes() {
        let out = classify_failure(
            Service::GoogleAi,
            ModelFamily::GeminiPro,
            &http_failure(429, r#"{"quota_limit_value":"0"}"#),
        );
        assert_eq!(out.key_action, KeyAction::DisableRevoked);
    }

    #[test]
    fn unauthorized_revokes_key() {
        let out = classify_failure(
            Service::OpenAi,
            ModelFamily::Gpt4o,
            &http_failure(401, r#"{"error":{"message":"Incorrect API key"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::DisableRevoked);
    }

    #[test]
    fn moderation_400_passes_through_with_refund() {
        let out = classify_failure(
            Service::OpenAi,
            ModelFamily::Gpt4o,
            &http_failure(400, r#"{"error":{"code":"content_filter"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::None);
        assert_eq!(out.outcome, FailureOutcome::Passthrough { refund: true });
    }

    #[test]
    fn anthropic_preamble_400_updates_key_and_retries() {
        let out = classify_failure(
            Service::Anthropic,
            ModelFamily::Claude,
            &http_failure(400, r#"{"error":{"message":"prompt must start with \"\n\nHuman:\""}}"#),
        );
        assert_eq!(out.key_action, KeyAction::SetRequiresPreamble);
        assert!(matches!(out.outcome, FailureOutcome::Retry(_)));
    }

    #[test]
    fn aws_access_denied_narrows_family() {
        let out = classify_failure(
            Service::Aws,
            ModelFamily::AwsClaudeOpus,
            &http_failure(403, r#"{"__type":"AccessDeniedException"}"#),
        );
        assert_eq!(
            out.key_action,
            KeyAction::NarrowFamily(ModelFamily::AwsClaudeOpus)
        );
    }

    #[test]
    fn deepseek_insufficient_balance_is_quota() {
        let out = classify_failure(
            Service::Deepseek,
            ModelFamily::Deepseek,
            &http_failure(402, r#"{"error":{"message":"Insufficient Balance"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::DisableQuota);
    }

    #[test]
    fn aws_503_retries_without_key_action() {
        let out = classify_failure(
            Service::Aws,
            ModelFamily::AwsClaude,
            &http_failure(503, "Service Unavailable"),
        );
        assert_eq!(out.key_action, KeyAction::None);
        assert!(matches!(out.outcome, FailureOutcome::Retry(_)));
    }

    #[test]
    fn model_not_found_passes_through_untouched() {
        let out = classify_failure(
            Service::OpenAi,
            ModelFamily::Gpt4o,
            &http_failure(404, r#"{"error":{"code":"model_not_found"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::None);
        assert_eq!(out.outcome, FailureOutcome::Passthrough { refund: false });
    }

    #[test]
    fn daily_limit_surfaces_instead_of_retrying() {
        let out = classify_failure(
            Service::OpenAi,
            ModelFamily::Gpt4o,
            &http_failure(429, r#"{"error":{"message":"Limit reached for requests_per_day"}}"#),
        );
        assert_eq!(out.key_action, KeyAction::RateLimit);
        assert!(matches!(out.outcome, FailureOutcome::Surface(_)));
    }
}
