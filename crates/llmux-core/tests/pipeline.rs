use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use llmux_common::{Dialect, GlobalConfig, ModelFamily, ProxyError, Service};
use llmux_core::{
    AppState, InboundRequest, NoopUserStore, ProxyEngine, ProxyOutcome, UpstreamBody,
    UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
};
use llmux_keypool::KeyPool;
use llmux_queue::{AdmissionQueue, spawn_dispatcher};

enum Scripted {
    Ok {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    OkStream {
        events: Vec<(&'static str, &'static str)>,
    },
    Fail {
        status: u16,
        body: Bytes,
    },
}

/// Upstream double: hands back scripted responses in order and records
/// every signed request it saw.
struct FakeClient {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<UpstreamHttpRequest>>,
}

impl FakeClient {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<UpstreamHttpRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl UpstreamClient for FakeClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.seen.lock().unwrap().push(req);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Ok {
                    status,
                    headers,
                    body,
                }) => Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                }),
                Some(Scripted::OkStream { events }) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for (name, data) in events {
                            let frame = if name.is_empty() {
                                format!("data: {data}\n\n")
                            } else {
                                format!("event: {name}\ndata: {data}\n\n")
                            };
                            if tx.send(Bytes::from(frame)).await.is_err() {
                                return;
                            }
                        }
                    });
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Some(Scripted::Fail { status, body }) => Err(UpstreamFailure::Http {
                    status,
                    headers: Vec::new(),
                    body,
                }),
                None => Err(UpstreamFailure::Transport {
                    kind: llmux_core::upstream::TransportErrorKind::Other,
                    message: "script exhausted".to_string(),
                }),
            }
        })
    }
}

fn build_engine(
    keys: Vec<(Service, Vec<String>)>,
    client: Arc<FakeClient>,
) -> (ProxyEngine, Arc<KeyPool>) {
    let keypool = Arc::new(KeyPool::new(keys));
    let queue = AdmissionQueue::new(keypool.clone());
    spawn_dispatcher(queue.clone());
    let state = AppState::new(
        GlobalConfig::default(),
        keypool.clone(),
        queue,
        client,
        Arc::new(NoopUserStore),
    );
    (ProxyEngine::new(state), keypool)
}

fn openai_inbound(service: Service, body: &str) -> InboundRequest {
    InboundRequest {
        service,
        dialect: Dialect::OpenAiChat,
        body: Bytes::from(body.to_string()),
        model_from_path: None,
        stream_hint: false,
    }
}

const ANTHROPIC_OK: &str = r#"{"id":"msg_up","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[{"type":"text","text":"hello there"}],"stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":3}}"#;

#[tokio::test(start_paused = true)]
async fn openai_dialect_request_reaches_anthropic_natively() {
    let client = FakeClient::new(vec![Scripted::Ok {
        status: 200,
        headers: Vec::new(),
        body: Bytes::from_static(ANTHROPIC_OK.as_bytes()),
    }]);
    let (engine, _) = build_engine(
        vec![(Service::Anthropic, vec!["sk-ant-1".to_string()])],
        client.clone(),
    );

    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::Anthropic,
                r#"{"model":"claude-3-5-sonnet-latest","messages":[{"role":"user","content":"hi"}],"max_tokens":64,"stream":false}"#,
            ),
            None,
        )
        .await
        .unwrap();

    let seen = client.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].url.ends_with("/v1/messages"));
    let upstream_body: serde_json::Value =
        serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(upstream_body["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(upstream_body["max_tokens"], 64);
    assert_eq!(upstream_body["system"], "");

    let ProxyOutcome::Blocking { status, body } = outcome else {
        panic!("expected blocking outcome");
    };
    assert_eq!(status, 200);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["object"], "chat.completion");
    assert_eq!(response["choices"][0]["message"]["role"], "assistant");
    assert_eq!(
        response["choices"][0]["message"]["content"],
        "hello there"
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limited_key_is_parked_and_request_retries_on_other_key() {
    let client = FakeClient::new(vec![
        Scripted::Fail {
            status: 429,
            body: Bytes::from_static(br#"{"error":{"type":"rate_limit_error"}}"#),
        },
        Scripted::Ok {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from_static(ANTHROPIC_OK.as_bytes()),
        },
    ]);
    let (engine, keypool) = build_engine(
        vec![(
            Service::Anthropic,
            vec!["sk-ant-a".to_string(), "sk-ant-b".to_string()],
        )],
        client.clone(),
    );

    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::Anthropic,
                r#"{"model":"claude-3-5-sonnet-latest","messages":[{"role":"user","content":"hi"}],"max_tokens":64}"#,
            ),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ProxyOutcome::Blocking { status: 200, .. }));

    let seen = client.requests();
    assert_eq!(seen.len(), 2, "exactly one retry");
    let key_of = |req: &UpstreamHttpRequest| {
        req.headers
            .iter()
            .find(|(name, _)| name == "x-api-key")
            .map(|(_, value)| value.clone())
    };
    assert_ne!(key_of(&seen[0]), key_of(&seen[1]), "retry used another key");

    let snapshot = keypool.pool(Service::Anthropic).snapshot().await;
    let limited: Vec<_> = snapshot
        .iter()
        .filter(|key| key.rate_limited_at.is_some())
        .collect();
    assert_eq!(limited.len(), 1);
    assert!(limited[0].rate_limited_until.unwrap() > limited[0].rate_limited_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn google_quota_exhaustion_hits_one_family_only() {
    let client = FakeClient::new(vec![
        Scripted::Fail {
            status: 429,
            body: Bytes::from_static(
                br#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"quota exceeded for model"}}"#,
            ),
        },
        Scripted::Ok {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from_static(
                br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]},"finishReason":"STOP"}]}"#,
            ),
        },
    ]);
    let (engine, keypool) = build_engine(
        vec![(Service::GoogleAi, vec!["aiza-key".to_string()])],
        client.clone(),
    );

    // The single key loses gemini-pro, so the retry finds no owner.
    let err = engine
        .handle_completion(
            openai_inbound(
                Service::GoogleAi,
                r#"{"model":"gemini-1.5-pro","messages":[{"role":"user","content":"hi"}],"max_tokens":32}"#,
            ),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NoKeysAvailable(_)));

    let snapshot = keypool.pool(Service::GoogleAi).snapshot().await;
    assert!(!snapshot[0].serves_family(ModelFamily::GeminiPro));
    assert!(snapshot[0].serves_family(ModelFamily::GeminiFlash));

    // The same key still serves the flash family.
    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::GoogleAi,
                r#"{"model":"gemini-1.5-flash","messages":[{"role":"user","content":"hi"}],"max_tokens":32}"#,
            ),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ProxyOutcome::Blocking { status: 200, .. }));
}

#[tokio::test(start_paused = true)]
async fn oversized_context_never_reaches_upstream_or_queue() {
    let client = FakeClient::new(Vec::new());
    let (engine, _) = build_engine(
        vec![(Service::Anthropic, vec!["sk-ant-1".to_string()])],
        client.clone(),
    );

    let huge = "x".repeat(900_000);
    let err = engine
        .handle_completion(
            openai_inbound(
                Service::Anthropic,
                &format!(
                    r#"{{"model":"claude-3-5-sonnet-latest","messages":[{{"role":"user","content":"{huge}"}}],"max_tokens":64}}"#
                ),
            ),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::ContextTooLarge(_)));
    assert!(client.requests().is_empty(), "no upstream call");
}

#[tokio::test(start_paused = true)]
async fn anthropic_stream_arrives_as_openai_chunks_in_order() {
    let client = FakeClient::new(vec![Scripted::OkStream {
        events: vec![
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_up","model":"claude-3-5-sonnet-20241022","role":"assistant","usage":{"input_tokens":9}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ],
    }]);
    let (engine, keypool) = build_engine(
        vec![(Service::Anthropic, vec!["sk-ant-1".to_string()])],
        client.clone(),
    );

    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::Anthropic,
                r#"{"model":"claude-3-5-sonnet-latest","messages":[{"role":"user","content":"hi"}],"max_tokens":64,"stream":true}"#,
            ),
            None,
        )
        .await
        .unwrap();

    let ProxyOutcome::Streaming {
        content_type,
        mut rx,
    } = outcome
    else {
        panic!("expected streaming outcome");
    };
    assert_eq!(content_type, "text/event-stream");

    let mut raw = Vec::new();
    while let Some(chunk) = rx.recv().await {
        raw.extend_from_slice(&chunk);
    }
    let text = String::from_utf8(raw).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();
    // role chunk, "Hel", "lo", finish chunk, [DONE]
    assert_eq!(frames.len(), 5);

    let payload = |frame: &str| -> serde_json::Value {
        let data = frame.strip_prefix("data: ").unwrap();
        serde_json::from_str(data).unwrap()
    };
    assert_eq!(
        payload(frames[0])["choices"][0]["delta"]["role"],
        "assistant"
    );
    assert_eq!(payload(frames[1])["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(payload(frames[2])["choices"][0]["delta"]["content"], "lo");
    assert_eq!(payload(frames[3])["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[4], "data: [DONE]");

    // The pump credits the reported completion tokens to the key.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = keypool.pool(Service::Anthropic).snapshot().await;
    let usage = snapshot[0].token_usage[&ModelFamily::Claude];
    assert_eq!(usage.output, 2);
    assert!(usage.input > 0);
}

#[tokio::test(start_paused = true)]
async fn client_cancel_mid_stream_still_credits_received_tokens() {
    let client = FakeClient::new(vec![Scripted::OkStream {
        events: vec![
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_up","model":"claude-3-5-sonnet-20241022","role":"assistant","usage":{"input_tokens":9}}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial answer"}}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{},"usage":{"output_tokens":4}}"#,
            ),
        ],
    }]);
    let (engine, keypool) = build_engine(
        vec![(Service::Anthropic, vec!["sk-ant-1".to_string()])],
        client.clone(),
    );

    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::Anthropic,
                r#"{"model":"claude-3-5-sonnet-latest","messages":[{"role":"user","content":"hi"}],"max_tokens":64,"stream":true}"#,
            ),
            None,
        )
        .await
        .unwrap();

    let ProxyOutcome::Streaming { mut rx, .. } = outcome else {
        panic!("expected streaming outcome");
    };
    // Take one chunk, then hang up.
    let first = rx.recv().await;
    assert!(first.is_some());
    drop(rx);

    // The pump finishes accounting despite the disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = keypool.pool(Service::Anthropic).snapshot().await;
    let usage = snapshot[0].token_usage[&ModelFamily::Claude];
    assert!(usage.input > 0, "prompt tokens were charged at dispatch");
}

#[tokio::test(start_paused = true)]
async fn moderation_rejection_passes_through_with_proxy_note() {
    let client = FakeClient::new(vec![Scripted::Fail {
        status: 400,
        body: Bytes::from_static(
            br#"{"error":{"message":"request was flagged","code":"content_filter"}}"#,
        ),
    }]);
    let (engine, _) = build_engine(
        vec![(Service::OpenAi, vec!["sk-oai-1".to_string()])],
        client.clone(),
    );

    let outcome = engine
        .handle_completion(
            openai_inbound(
                Service::OpenAi,
                r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"max_tokens":16}"#,
            ),
            None,
        )
        .await
        .unwrap();

    let ProxyOutcome::Blocking { status, body } = outcome else {
        panic!("expected blocking outcome");
    };
    assert_eq!(status, 400);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], "content_filter");
    assert!(value["proxy_note"].is_string());
    assert_eq!(client.requests().len(), 1, "no retry for moderation 400s");
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_bounded() {
    let failures: Vec<Scripted> = (0..8)
        .map(|_| Scripted::Fail {
            status: 500,
            body: Bytes::from_static(b"internal"),
        })
        .collect();
    let client = FakeClient::new(failures);
    let (engine, _) = build_engine(
        vec![(Service::OpenAi, vec!["sk-oai-1".to_string()])],
        client.clone(),
    );

    let err = engine
        .handle_completion(
            openai_inbound(
                Service::OpenAi,
                r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"max_tokens":16}"#,
            ),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
    // MAX_RETRIES re-enqueues mean at most MAX_RETRIES + 1 dispatches.
    assert_eq!(client.requests().len(), GlobalConfig::default().max_retries as usize + 1);
}
