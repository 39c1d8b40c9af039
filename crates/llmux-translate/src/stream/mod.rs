mod anthropic2openai;
mod google2openai;
mod openai2anthropic;
mod passthrough;

use llmux_common::Dialect;
use llmux_protocol::error::ErrorPayload;
use llmux_protocol::sse::SseEvent;

use crate::TranslateError;
use crate::response::ResponseMeta;

pub use anthropic2openai::AnthropicToOpenAiStream;
pub use google2openai::GoogleToOpenAiStream;
pub use openai2anthropic::OpenAiToAnthropicStream;
pub use passthrough::{AnthropicPassthrough, GooglePassthrough, OpenAiPassthrough};

/// What the stream produced, for postprocess accounting. `completion_chars`
/// backs the token estimate when the upstream never reported usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamOutcome {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub completion_chars: u64,
    pub finished: bool,
}

/// Stateful per-request SSE rewriter between the upstream response dialect
/// and the dialect the client spoke. Framing (line splitting, `[DONE]`,
/// buffer reassembly) is the SSE parser's job below this layer.
pub enum StreamTransformer {
    OpenAiPassthrough(OpenAiPassthrough),
    AnthropicPassthrough(AnthropicPassthrough),
    GooglePassthrough(GooglePassthrough),
    AnthropicToOpenAi(AnthropicToOpenAiStream),
    GoogleToOpenAi(GoogleToOpenAiStream),
    OpenAiToAnthropic(OpenAiToAnthropicStream),
}

impl StreamTransformer {
    pub fn new(
        response_dialect: Dialect,
        requested_dialect: Dialect,
        meta: &ResponseMeta,
    ) -> Result<Self, TranslateError> {
        use Dialect::{AnthropicMessages, GoogleAi, MistralChat, OpenAiChat};
        match (response_dialect, requested_dialect) {
            (OpenAiChat | MistralChat, OpenAiChat | MistralChat) => Ok(
                StreamTransformer::OpenAiPassthrough(OpenAiPassthrough::new(meta)),
            ),
            (AnthropicMessages, AnthropicMessages) => Ok(StreamTransformer::AnthropicPassthrough(
                AnthropicPassthrough::new(),
            )),
            (GoogleAi, GoogleAi) => {
                Ok(StreamTransformer::GooglePassthrough(GooglePassthrough::new()))
            }
            (AnthropicMessages, OpenAiChat | MistralChat) => Ok(
                StreamTransformer::AnthropicToOpenAi(AnthropicToOpenAiStream::new(meta)),
            ),
            (GoogleAi, OpenAiChat | MistralChat) => Ok(StreamTransformer::GoogleToOpenAi(
                GoogleToOpenAiStream::new(meta),
            )),
            (OpenAiChat | MistralChat, AnthropicMessages) => Ok(
                StreamTransformer::OpenAiToAnthropic(OpenAiToAnthropicStream::new(meta)),
            ),
            (from, to) => Err(TranslateError::Unsupported { from, to }),
        }
    }

    /// Transform one upstream event into zero or more client events.
    /// Unmapped upstream events produce no output without ending the stream.
    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        match self {
            StreamTransformer::OpenAiPassthrough(state) => state.push(event),
            StreamTransformer::AnthropicPassthrough(state) => state.push(event),
            StreamTransformer::GooglePassthrough(state) => state.push(event),
            StreamTransformer::AnthropicToOpenAi(state) => state.push(event),
            StreamTransformer::GoogleToOpenAi(state) => state.push(event),
            StreamTransformer::OpenAiToAnthropic(state) => state.push(event),
        }
    }

    /// Flush terminal events. Called exactly once, on upstream `[DONE]`,
    /// connection close, or parse failure.
    pub fn close(&mut self) -> Vec<SseEvent> {
        match self {
            StreamTransformer::OpenAiPassthrough(state) => state.close(),
            StreamTransformer::AnthropicPassthrough(state) => state.close(),
            StreamTransformer::GooglePassthrough(state) => state.close(),
            StreamTransformer::AnthropicToOpenAi(state) => state.close(),
            StreamTransformer::GoogleToOpenAi(state) => state.close(),
            StreamTransformer::OpenAiToAnthropic(state) => state.close(),
        }
    }

    pub fn outcome(&self) -> StreamOutcome {
        match self {
            StreamTransformer::OpenAiPassthrough(state) => state.outcome(),
            StreamTransformer::AnthropicPassthrough(state) => state.outcome(),
            StreamTransformer::GooglePassthrough(state) => state.outcome(),
            StreamTransformer::AnthropicToOpenAi(state) => state.outcome(),
            StreamTransformer::GoogleToOpenAi(state) => state.outcome(),
            StreamTransformer::OpenAiToAnthropic(state) => state.outcome(),
        }
    }
}

/// An in-band error in the requested dialect, followed by stream close.
pub fn error_events(requested_dialect: Dialect, error_type: &str, message: &str) -> Vec<SseEvent> {
    let payload = ErrorPayload::new(error_type, message);
    let data = String::from_utf8_lossy(&payload.to_bytes()).into_owned();
    match requested_dialect {
        Dialect::AnthropicMessages => vec![SseEvent::named("error", data)],
        Dialect::OpenAiChat | Dialect::MistralChat => {
            vec![SseEvent::data(data), SseEvent::data("[DONE]")]
        }
        Dialect::GoogleAi => vec![SseEvent::data(data)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ResponseMeta {
        ResponseMeta {
            request_id: "feedface".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            created: 1_700_000_000,
        }
    }

    fn anthropic_event(name: &str, data: &str) -> SseEvent {
        SseEvent::named(name, data)
    }

    #[test]
    fn anthropic_stream_to_openai_chunks() {
        let mut transformer = StreamTransformer::new(
            Dialect::AnthropicMessages,
            Dialect::OpenAiChat,
            &meta(),
        )
        .unwrap();

        let mut out = Vec::new();
        out.extend(transformer.push(&anthropic_event(
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_up","model":"claude-3-5-sonnet-20241022","role":"assistant","usage":{"input_tokens":9}}}"#,
        )));
        out.extend(transformer.push(&anthropic_event(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        )));
        out.extend(transformer.push(&anthropic_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        )));
        out.extend(transformer.push(&anthropic_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
        )));
        out.extend(transformer.push(&anthropic_event(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
        )));
        out.extend(transformer.push(&anthropic_event(
            "message_stop",
            r#"{"type":"message_stop"}"#,
        )));

        // role chunk, two content chunks, finish chunk, [DONE]
        assert_eq!(out.len(), 5);
        let role: serde_json::Value = serde_json::from_str(&out[0].data).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        let first: serde_json::Value = serde_json::from_str(&out[1].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        let second: serde_json::Value = serde_json::from_str(&out[2].data).unwrap();
        assert_eq!(second["choices"][0]["delta"]["content"], "lo");
        let finish: serde_json::Value = serde_json::from_str(&out[3].data).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert!(out[4].is_done());

        let outcome = transformer.outcome();
        assert_eq!(outcome.input_tokens, Some(9));
        assert_eq!(outcome.output_tokens, Some(2));
        assert!(outcome.finished);
    }

    #[test]
    fn unmapped_events_produce_no_output() {
        let mut transformer = StreamTransformer::new(
            Dialect::AnthropicMessages,
            Dialect::OpenAiChat,
            &meta(),
        )
        .unwrap();
        assert!(transformer
            .push(&anthropic_event("ping", r#"{"type":"ping"}"#))
            .is_empty());
        assert!(transformer
            .push(&SseEvent::named("made_up", r#"{"type":"made_up"}"#))
            .is_empty());
    }

    #[test]
    fn close_emits_exactly_one_terminator() {
        let mut transformer = StreamTransformer::new(
            Dialect::AnthropicMessages,
            Dialect::OpenAiChat,
            &meta(),
        )
        .unwrap();
        let closed = transformer.close();
        assert!(closed.last().unwrap().is_done());
        // A second close after message_stop would double-terminate; the
        // transformer guards against it.
        assert!(transformer.close().is_empty());
    }

    #[test]
    fn google_stream_synthesizes_first_role_chunk() {
        let mut transformer =
            StreamTransformer::new(Dialect::GoogleAi, Dialect::OpenAiChat, &meta()).unwrap();
        let out = transformer.push(&SseEvent::data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]},"index":0}]}"#,
        ));
        assert_eq!(out.len(), 2);
        let role: serde_json::Value = serde_json::from_str(&out[0].data).unwrap();
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(role["choices"][0]["delta"]["content"], "");
        let content: serde_json::Value = serde_json::from_str(&out[1].data).unwrap();
        assert_eq!(content["choices"][0]["delta"]["content"], "Hi");
    }

    #[test]
    fn openai_to_anthropic_emits_named_events() {
        let mut transformer = StreamTransformer::new(
            Dialect::OpenAiChat,
            Dialect::AnthropicMessages,
            &meta(),
        )
        .unwrap();
        let mut out = Vec::new();
        out.extend(transformer.push(&SseEvent::data(
            r#"{"id":"x","object":"chat.completion.chunk","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        )));
        out.extend(transformer.push(&SseEvent::data(
            r#"{"id":"x","object":"chat.completion.chunk","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )));
        out.extend(transformer.push(&SseEvent::data(
            r#"{"id":"x","object":"chat.completion.chunk","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        )));
        out.extend(transformer.push(&SseEvent::data("[DONE]")));

        let names: Vec<_> = out
            .iter()
            .map(|event| event.event.clone().unwrap_or_default())
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn azure_prompt_filter_preamble_is_dropped() {
        let mut transformer =
            StreamTransformer::new(Dialect::OpenAiChat, Dialect::OpenAiChat, &meta()).unwrap();
        let out = transformer.push(&SseEvent::data(
            r#"{"id":"","object":"chat.completion.chunk","created":0,"model":"","choices":[],"prompt_filter_results":[{"prompt_index":0}]}"#,
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn error_events_match_requested_dialect() {
        let anthropic = error_events(Dialect::AnthropicMessages, "upstream_error", "boom");
        assert_eq!(anthropic.len(), 1);
        assert_eq!(anthropic[0].event.as_deref(), Some("error"));

        let openai = error_events(Dialect::OpenAiChat, "upstream_error", "boom");
        assert_eq!(openai.len(), 2);
        assert!(openai[1].is_done());
    }
}
