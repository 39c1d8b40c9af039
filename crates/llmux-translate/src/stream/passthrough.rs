use llmux_protocol::anthropic::{KnownStreamEvent, StreamEvent};
use llmux_protocol::google::GenerateContentResponse;
use llmux_protocol::openai::{ChatCompletionChunk, ChatRole, ChunkDelta};
use llmux_protocol::sse::SseEvent;

use crate::response::ResponseMeta;
use crate::stream::StreamOutcome;

/// Same-dialect OpenAI relay. Chunks are forwarded byte-for-byte, but the
/// state machine still inspects them to drop Azure's leading
/// `prompt_filter_results` event, synthesize the initial role chunk when
/// the upstream omits it, and capture usage for postprocess.
pub struct OpenAiPassthrough {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    closed: bool,
    outcome: StreamOutcome,
}

impl OpenAiPassthrough {
    pub fn new(meta: &ResponseMeta) -> Self {
        Self {
            id: meta.completion_id(),
            model: meta.model.clone(),
            created: meta.created,
            role_emitted: false,
            closed: false,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if event.is_done() {
            self.closed = true;
            self.outcome.finished = true;
            return vec![SseEvent::data("[DONE]")];
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(&event.data) else {
            // Not a chunk we recognize; forward untouched.
            return vec![event.clone()];
        };
        if chunk.is_prompt_filter_preamble() {
            return Vec::new();
        }
        if let Some(usage) = &chunk.usage {
            self.outcome.input_tokens = Some(usage.prompt_tokens);
            self.outcome.output_tokens = Some(usage.completion_tokens);
        }

        let mut out = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            if choice.delta.role.is_some() {
                self.role_emitted = true;
            } else if !self.role_emitted && choice.delta.content.is_some() {
                self.role_emitted = true;
                let role = ChatCompletionChunk::new(
                    self.id.clone(),
                    self.model.clone(),
                    self.created,
                )
                .with_delta(
                    ChunkDelta {
                        role: Some(ChatRole::Assistant),
                        content: Some(String::new()),
                        tool_calls: None,
                    },
                    None,
                );
                out.push(SseEvent::data(
                    serde_json::to_string(&role).unwrap_or_default(),
                ));
            }
            if let Some(text) = &choice.delta.content {
                self.outcome.completion_chars += text.len() as u64;
            }
        }
        out.push(event.clone());
        out
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.outcome.finished = true;
        vec![SseEvent::data("[DONE]")]
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }
}

/// Same-dialect Anthropic relay; events pass through with usage capture.
pub struct AnthropicPassthrough {
    closed: bool,
    outcome: StreamOutcome,
}

impl AnthropicPassthrough {
    pub fn new() -> Self {
        Self {
            closed: false,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if let Ok(StreamEvent::Known(known)) = serde_json::from_str::<StreamEvent>(&event.data) {
            match &known {
                KnownStreamEvent::MessageStart { message } => {
                    if message.usage.input_tokens.is_some() {
                        self.outcome.input_tokens = message.usage.input_tokens;
                    }
                }
                KnownStreamEvent::ContentBlockDelta { delta, .. } => {
                    if let llmux_protocol::anthropic::ContentDelta::TextDelta { text } = delta {
                        self.outcome.completion_chars += text.len() as u64;
                    }
                }
                KnownStreamEvent::MessageDelta { usage, .. } => {
                    if let Some(usage) = usage
                        && usage.output_tokens.is_some()
                    {
                        self.outcome.output_tokens = usage.output_tokens;
                    }
                }
                KnownStreamEvent::MessageStop => {
                    self.closed = true;
                    self.outcome.finished = true;
                }
                _ => {}
            }
        }
        vec![event.clone()]
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        vec![SseEvent::named(
            "message_stop",
            r#"{"type":"message_stop"}"#,
        )]
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }
}

impl Default for AnthropicPassthrough {
    fn default() -> Self {
        Self::new()
    }
}

/// Same-dialect Google relay; frames pass through with usage capture.
pub struct GooglePassthrough {
    closed: bool,
    outcome: StreamOutcome,
}

impl GooglePassthrough {
    pub fn new() -> Self {
        Self {
            closed: false,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if let Ok(frame) = serde_json::from_str::<GenerateContentResponse>(&event.data) {
            if let Some(usage) = &frame.usage_metadata {
                if usage.prompt_token_count.is_some() {
                    self.outcome.input_tokens = usage.prompt_token_count;
                }
                if usage.candidates_token_count.is_some() {
                    self.outcome.output_tokens = usage.candidates_token_count;
                }
            }
            if let Some(content) = frame
                .candidates
                .first()
                .and_then(|candidate| candidate.content.as_ref())
            {
                self.outcome.completion_chars += content.flat_text().len() as u64;
            }
            if frame
                .candidates
                .first()
                .and_then(|candidate| candidate.finish_reason)
                .is_some()
            {
                self.outcome.finished = true;
            }
        }
        vec![event.clone()]
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        self.closed = true;
        Vec::new()
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }
}

impl Default for GooglePassthrough {
    fn default() -> Self {
        Self::new()
    }
}
