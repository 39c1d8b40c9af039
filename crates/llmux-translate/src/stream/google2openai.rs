use llmux_protocol::google::GenerateContentResponse;
use llmux_protocol::openai::{
    ChatCompletionChunk, ChatRole, ChunkDelta, FinishReason, Usage,
};
use llmux_protocol::sse::SseEvent;

use crate::response::{ResponseMeta, google_finish_to_openai};
use crate::stream::{StreamOutcome, error_events};

/// Rewrites a `streamGenerateContent` (alt=sse) stream into OpenAI chunks.
/// Google frames carry no role preamble, so the OpenAI-style initial
/// `delta.role` chunk is synthesized before the first content event.
pub struct GoogleToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    finish_emitted: bool,
    closed: bool,
    outcome: StreamOutcome,
}

impl GoogleToOpenAiStream {
    pub fn new(meta: &ResponseMeta) -> Self {
        Self {
            id: meta.completion_id(),
            model: meta.model.clone(),
            created: meta.created,
            role_emitted: false,
            finish_emitted: false,
            closed: false,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        let frame: GenerateContentResponse = match serde_json::from_str(&event.data) {
            Ok(frame) => frame,
            Err(err) => {
                self.closed = true;
                return error_events(
                    llmux_common::Dialect::OpenAiChat,
                    "upstream_error",
                    &format!("unparseable upstream event: {err}"),
                );
            }
        };

        if let Some(version) = &frame.model_version {
            self.model = version.clone();
        }
        if let Some(usage) = &frame.usage_metadata {
            if usage.prompt_token_count.is_some() {
                self.outcome.input_tokens = usage.prompt_token_count;
            }
            if usage.candidates_token_count.is_some() {
                self.outcome.output_tokens = usage.candidates_token_count;
            }
        }

        let mut out = Vec::new();
        if !self.role_emitted {
            self.role_emitted = true;
            out.push(self.encode(self.chunk(
                ChunkDelta {
                    role: Some(ChatRole::Assistant),
                    content: Some(String::new()),
                    tool_calls: None,
                },
                None,
            )));
        }

        let Some(candidate) = frame.candidates.first() else {
            return out;
        };
        if let Some(content) = &candidate.content {
            let text = content.flat_text();
            if !text.is_empty() {
                self.outcome.completion_chars += text.len() as u64;
                out.push(self.encode(self.chunk(
                    ChunkDelta {
                        role: None,
                        content: Some(text),
                        tool_calls: None,
                    },
                    None,
                )));
            }
        }
        if let Some(reason) = candidate.finish_reason {
            self.finish_emitted = true;
            let mut chunk = self.chunk(ChunkDelta::default(), Some(google_finish_to_openai(reason)));
            chunk.usage = self.final_usage();
            out.push(self.encode(chunk));
        }
        out
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.outcome.finished = true;
        let mut out = Vec::new();
        if !self.finish_emitted {
            self.finish_emitted = true;
            let mut chunk = self.chunk(ChunkDelta::default(), Some(FinishReason::Stop));
            chunk.usage = self.final_usage();
            out.push(self.encode(chunk));
        }
        out.push(SseEvent::data("[DONE]"));
        out
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created)
            .with_delta(delta, finish_reason)
    }

    fn encode(&self, chunk: ChatCompletionChunk) -> SseEvent {
        SseEvent::data(serde_json::to_string(&chunk).unwrap_or_default())
    }

    fn final_usage(&self) -> Option<Usage> {
        match (self.outcome.input_tokens, self.outcome.output_tokens) {
            (None, None) => None,
            (input, output) => Some(Usage {
                prompt_tokens: input.unwrap_or(0),
                completion_tokens: output.unwrap_or(0),
                total_tokens: input.unwrap_or(0) + output.unwrap_or(0),
                completion_tokens_details: None,
            }),
        }
    }
}
