use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use llmux_common::{Dialect, ProxyError, Service};
use llmux_keypool::{DisableReason, KeyExtra, KeyPatch, KeyRecord};
use llmux_protocol::error::ErrorPayload;
use llmux_protocol::sse::SseParser;
use llmux_translate::response::{ResponseBody, translate_response};
use llmux_translate::stream::StreamTransformer;
use llmux_translate::tokens::count_text;

use crate::classify::{Classified, FailureOutcome, KeyAction, classify_failure, parse_retry_after};
use crate::preprocess::{PreparedRequest, preprocess};
use crate::sign::{ChangeLog, SignInput, sign_request};
use crate::state::AppState;
use crate::upstream::{Headers, UpstreamBody, UpstreamFailure, header_get};

pub use crate::preprocess::InboundParts as InboundRequest;

const PROXY_NOTE: &str = "forwarded by llmux; upstream body unchanged";
/// Bound on consecutive keys skipped for deployment policy (AWS logging).
const MAX_POLICY_SKIPS: u32 = 4;

/// How one completed pipeline run answers the client.
#[derive(Debug)]
pub enum ProxyOutcome {
    Blocking {
        status: u16,
        body: Bytes,
    },
    Streaming {
        content_type: &'static str,
        rx: mpsc::Receiver<Bytes>,
    },
}

#[derive(Clone)]
pub struct ProxyEngine {
    state: Arc<AppState>,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// The full request lifecycle: preprocess, enqueue, dispatch, sign,
    /// upstream I/O, postprocess, respond. Classified retryable failures
    /// revert per-attempt mutations and re-enter the queue at the tail,
    /// bounded by the configured retry budget.
    pub async fn handle_completion(
        &self,
        inbound: InboundRequest,
        user_token: Option<String>,
    ) -> Result<ProxyOutcome, ProxyError> {
        let prepared = preprocess(&self.state.config, inbound)?;
        self.state.stats.record_prompt();
        if let Some(token) = &user_token {
            self.state.user_store.increment_prompt_count(token).await;
        }

        let mut changes = ChangeLog::new(prepared.body.clone());
        let mut attempt_body = prepared.body.clone();
        let mut retry_count: u32 = 0;
        let mut policy_skips: u32 = 0;
        let first_enqueued_at = Instant::now();

        loop {
            let ticket = self
                .state
                .queue
                .enqueue(
                    prepared.service,
                    prepared.family,
                    prepared.model.clone(),
                    Some(first_enqueued_at),
                )
                .await?;
            let key = tokio::time::timeout(self.state.config.request_timeout, ticket)
                .await
                .map_err(|_| {
                    ProxyError::UpstreamUnavailable("timed out waiting for a key".to_string())
                })?
                .map_err(|_| ProxyError::InternalError("dispatcher went away".to_string()))?;

            if self.violates_aws_logging_policy(&key) {
                policy_skips += 1;
                if policy_skips > MAX_POLICY_SKIPS {
                    return Err(ProxyError::NoKeysAvailable(
                        "no AWS key with confirmed-disabled logging".to_string(),
                    ));
                }
                continue;
            }

            attempt_body = self.apply_key_mutations(&prepared, &key, attempt_body, &mut changes);

            self.state
                .keypool
                .increment_usage(
                    prepared.service,
                    &key.hash,
                    prepared.family,
                    prepared.prompt_tokens,
                    0,
                )
                .await;
            self.state.stats.record_tokens(prepared.prompt_tokens, 0);

            let signed = sign_request(
                SignInput {
                    service: prepared.service,
                    model: &prepared.model,
                    is_streaming: prepared.is_streaming,
                    body: attempt_body.clone(),
                    base_url_override: self.state.config.base_url_for(prepared.service),
                },
                &key,
                &mut changes,
                self.state.client.as_ref(),
            )
            .await?;

            tracing::debug!(
                service = %prepared.service,
                family = %prepared.family,
                key = %key.hash,
                attempt = retry_count + 1,
                "dispatching to upstream"
            );

            match self.state.client.send(signed).await {
                Ok(response) => {
                    self.track_key_rate_limit(&prepared, &key, &response.headers)
                        .await;
                    return if prepared.is_streaming {
                        self.stream_response(&prepared, key, user_token, response.body)
                    } else {
                        let outcome = self
                            .blocking_response(&prepared, &key, &user_token, response.body)
                            .await;
                        self.state
                            .queue
                            .complete(prepared.service, prepared.family)
                            .await;
                        outcome
                    };
                }
                Err(failure) => {
                    self.state
                        .queue
                        .complete(prepared.service, prepared.family)
                        .await;
                    let classified =
                        classify_failure(prepared.service, prepared.family, &failure);
                    self.log_failure(&prepared, &key, &failure, &classified);
                    self.apply_key_action(&prepared, &key, &classified.key_action, &failure)
                        .await;

                    match classified.outcome {
                        FailureOutcome::Passthrough { refund } => {
                            if refund {
                                self.refund_last_attempt(&prepared, &user_token).await;
                            }
                            let (status, body) = match failure {
                                UpstreamFailure::Http { status, body, .. } => (status, body),
                                UpstreamFailure::Transport { message, .. } => (
                                    502,
                                    ErrorPayload::new("upstream_error", message).to_bytes(),
                                ),
                            };
                            return Ok(ProxyOutcome::Blocking {
                                status,
                                body: ErrorPayload::annotate_upstream(&body, PROXY_NOTE),
                            });
                        }
                        FailureOutcome::Retry(error) => {
                            retry_count += 1;
                            if retry_count > self.state.config.max_retries {
                                return Err(error);
                            }
                            attempt_body = changes.revert();
                            continue;
                        }
                        FailureOutcome::Surface(error) => return Err(error),
                    }
                }
            }
        }
    }

    fn violates_aws_logging_policy(&self, key: &KeyRecord) -> bool {
        if key.service != Service::Aws || self.state.config.allow_aws_logging {
            return false;
        }
        matches!(
            key.extra,
            KeyExtra::Aws {
                logging_status: llmux_keypool::AwsLoggingStatus::Enabled,
                ..
            }
        )
    }

    /// Key-dependent body rewrites, recorded so a re-enqueue reverts them.
    fn apply_key_mutations(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        body: Bytes,
        changes: &mut ChangeLog,
    ) -> Bytes {
        let KeyExtra::Anthropic {
            requires_preamble,
            allows_multimodality,
            ..
        } = &key.extra
        else {
            return body;
        };
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
            return body;
        };
        let mut changed = false;

        if *requires_preamble
            && let Some(system) = value.get_mut("system")
            && let Some(text) = system.as_str()
            && !text.starts_with("\n\nHuman:")
        {
            *system = serde_json::Value::String(format!("\n\nHuman: {text}"));
            changes.record("body:anthropic-preamble");
            changed = true;
        }

        if !*allows_multimodality
            && let Some(messages) = value.get_mut("messages").and_then(|m| m.as_array_mut())
        {
            for message in messages {
                let Some(blocks) = message.get_mut("content").and_then(|c| c.as_array_mut())
                else {
                    continue;
                };
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("image") {
                        *block = serde_json::json!({
                            "type": "text",
                            "text": "[image omitted: credential is text-only]",
                        });
                        changed = true;
                    }
                }
            }
            if changed {
                changes.record("body:flatten-multimodal");
            }
        }

        if changed {
            serde_json::to_vec(&value).map(Bytes::from).unwrap_or(body)
        } else {
            body
        }
    }

    async fn apply_key_action(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        action: &KeyAction,
        failure: &UpstreamFailure,
    ) {
        let pool = &self.state.keypool;
        match action {
            KeyAction::None => {}
            KeyAction::RateLimit => {
                pool.mark_rate_limited(prepared.service, &key.hash).await;
                if let UpstreamFailure::Http { headers, .. } = failure
                    && let Some(retry_after) = parse_retry_after(headers)
                {
                    tracing::debug!(
                        key = %key.hash,
                        seconds = retry_after.as_secs(),
                        "upstream requested a longer backoff"
                    );
                }
            }
            KeyAction::DisableRevoked => {
                pool.disable(prepared.service, &key.hash, DisableReason::Revoked)
                    .await;
            }
            KeyAction::DisableQuota => {
                pool.disable(prepared.service, &key.hash, DisableReason::Quota)
                    .await;
            }
            KeyAction::OverQuotaFamily(family) => {
                pool.update(
                    prepared.service,
                    &key.hash,
                    KeyPatch {
                        add_over_quota_family: Some(*family),
                        ..Default::default()
                    },
                )
                .await;
            }
            KeyAction::NarrowFamily(family) => {
                pool.update(
                    prepared.service,
                    &key.hash,
                    KeyPatch {
                        remove_family: Some(*family),
                        remove_model_id: Some(prepared.model.clone()),
                        ..Default::default()
                    },
                )
                .await;
            }
            KeyAction::SetRequiresPreamble => {
                pool.update(
                    prepared.service,
                    &key.hash,
                    KeyPatch {
                        requires_preamble: Some(true),
                        ..Default::default()
                    },
                )
                .await;
            }
            KeyAction::DisallowMultimodality => {
                pool.update(
                    prepared.service,
                    &key.hash,
                    KeyPatch {
                        allows_multimodality: Some(false),
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }

    /// Postprocess for a blocking response: recount completion tokens,
    /// credit usage, translate back to the client's dialect.
    async fn blocking_response(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        user_token: &Option<String>,
        body: UpstreamBody,
    ) -> Result<ProxyOutcome, ProxyError> {
        let UpstreamBody::Bytes(raw) = body else {
            return Err(ProxyError::InternalError(
                "blocking request returned a stream".to_string(),
            ));
        };
        let parsed = ResponseBody::parse(prepared.out_dialect, &raw)
            .map_err(|err| ProxyError::InternalError(format!("upstream body: {err}")))?;

        let (_, reported_output) = parsed.reported_usage();
        let output_tokens = reported_output.unwrap_or_else(|| {
            count_text(
                prepared.out_dialect,
                &prepared.model,
                &parsed.completion_text(),
            )
        });
        self.credit_completion(prepared, key, user_token, output_tokens)
            .await;

        let meta = prepared.response_meta();
        let translated = translate_response(parsed, prepared.in_dialect, &meta)
            .map_err(|err| ProxyError::InternalError(err.to_string()))?;
        let body = translated
            .to_bytes()
            .map_err(|err| ProxyError::InternalError(err.to_string()))?;
        Ok(ProxyOutcome::Blocking {
            status: 200,
            body: Bytes::from(body),
        })
    }

    /// Streaming I/O: a pump task feeds upstream bytes through the SSE
    /// parser and the dialect transformer, teeing raw events to the trace
    /// log. The pump owns postprocess so accounting happens even when the
    /// client disconnects mid-stream.
    fn stream_response(
        &self,
        prepared: &PreparedRequest,
        key: KeyRecord,
        user_token: Option<String>,
        body: UpstreamBody,
    ) -> Result<ProxyOutcome, ProxyError> {
        let UpstreamBody::Stream(mut upstream_rx) = body else {
            return Err(ProxyError::InternalError(
                "streaming request returned a buffered body".to_string(),
            ));
        };

        let meta = prepared.response_meta();
        let mut transformer =
            StreamTransformer::new(prepared.out_dialect, prepared.in_dialect, &meta)
                .map_err(|err| ProxyError::InternalError(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let engine = self.clone();
        let prepared_summary = StreamSummaryCtx {
            service: prepared.service,
            family: prepared.family,
            model: prepared.model.clone(),
            in_dialect: prepared.in_dialect,
            out_dialect: prepared.out_dialect,
            key_hash: key.hash.clone(),
        };

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut client_gone = false;

            'pump: while let Some(chunk) = upstream_rx.recv().await {
                for event in parser.push(&chunk) {
                    tracing::trace!(
                        event = event.event.as_deref().unwrap_or("data"),
                        raw = %event.data,
                        "upstream stream event"
                    );
                    for out in transformer.push(&event) {
                        if tx.send(out.encode()).await.is_err() {
                            client_gone = true;
                            break 'pump;
                        }
                    }
                }
            }
            // Dropping `upstream_rx` here closes the upstream socket.
            drop(upstream_rx);

            if !client_gone {
                for event in parser.finish() {
                    for out in transformer.push(&event) {
                        let _ = tx.send(out.encode()).await;
                    }
                }
                for out in transformer.close() {
                    let _ = tx.send(out.encode()).await;
                }
            } else {
                tracing::debug!(key = %prepared_summary.key_hash, "client cancelled mid-stream");
            }

            let outcome = transformer.outcome();
            let output_tokens = outcome.output_tokens.unwrap_or_else(|| {
                estimate_output_tokens(
                    prepared_summary.out_dialect,
                    &prepared_summary.model,
                    outcome.completion_chars,
                )
            });
            engine
                .credit_stream_completion(&prepared_summary, &user_token, output_tokens)
                .await;
            engine
                .state
                .queue
                .complete(prepared_summary.service, prepared_summary.family)
                .await;
        });

        Ok(ProxyOutcome::Streaming {
            content_type: "text/event-stream",
            rx,
        })
    }

    async fn credit_completion(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        user_token: &Option<String>,
        output_tokens: u64,
    ) {
        self.state
            .keypool
            .credit_output(prepared.service, &key.hash, prepared.family, output_tokens)
            .await;
        self.state.stats.record_tokens(0, output_tokens);
        if let Some(token) = user_token {
            self.state
                .user_store
                .increment_token_count(
                    token,
                    &prepared.model,
                    prepared.in_dialect,
                    prepared.prompt_tokens,
                    output_tokens,
                )
                .await;
        }
    }

    async fn credit_stream_completion(
        &self,
        ctx: &StreamSummaryCtx,
        user_token: &Option<String>,
        output_tokens: u64,
    ) {
        self.state
            .keypool
            .credit_output(ctx.service, &ctx.key_hash, ctx.family, output_tokens)
            .await;
        self.state.stats.record_tokens(0, output_tokens);
        if let Some(token) = user_token {
            self.state
                .user_store
                .increment_token_count(token, &ctx.model, ctx.in_dialect, 0, output_tokens)
                .await;
        }
    }

    async fn refund_last_attempt(&self, prepared: &PreparedRequest, user_token: &Option<String>) {
        self.state.stats.refund_tokens(prepared.prompt_tokens);
        if let Some(token) = user_token {
            self.state
                .user_store
                .refund_last_attempt(token, prepared.family, prepared.prompt_tokens)
                .await;
        }
    }

    /// Cache the upstream's advertised rate-limit window on the key.
    async fn track_key_rate_limit(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        headers: &Headers,
    ) {
        let remaining = header_get(headers, "x-ratelimit-remaining-requests")
            .or_else(|| header_get(headers, "x-ratelimit-remaining"));
        if remaining.is_some_and(|value| value.trim() == "0") {
            tracing::debug!(key = %key.hash, "upstream window exhausted; parking key");
            self.state
                .keypool
                .mark_rate_limited(prepared.service, &key.hash)
                .await;
        }
    }

    fn log_failure(
        &self,
        prepared: &PreparedRequest,
        key: &KeyRecord,
        failure: &UpstreamFailure,
        classified: &Classified,
    ) {
        match failure {
            UpstreamFailure::Http { status, body, .. } => {
                tracing::warn!(
                    key = %key.hash,
                    status = status,
                    action = ?classified.key_action,
                    stage = "upstream",
                    service = %prepared.service,
                    "upstream error"
                );
                if matches!(classified.outcome, FailureOutcome::Surface(ProxyError::UpstreamUnavailable(_)))
                {
                    let preview = String::from_utf8_lossy(&body[..body.len().min(128)]);
                    tracing::error!(key = %key.hash, body = %preview, "unclassified upstream error");
                }
            }
            UpstreamFailure::Transport { kind, message } => {
                tracing::warn!(
                    key = %key.hash,
                    kind = ?kind,
                    stage = "transport",
                    service = %prepared.service,
                    error = %message,
                    "upstream transport error"
                );
            }
        }
    }
}

struct StreamSummaryCtx {
    service: Service,
    family: llmux_common::ModelFamily,
    model: String,
    in_dialect: Dialect,
    out_dialect: Dialect,
    key_hash: String,
}

/// Character-ratio fallback when a stream ended without reported usage.
fn estimate_output_tokens(_dialect: Dialect, _model: &str, completion_chars: u64) -> u64 {
    completion_chars.div_ceil(4)
}
