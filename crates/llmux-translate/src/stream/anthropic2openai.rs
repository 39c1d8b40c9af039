use llmux_protocol::anthropic::{
    ContentBlock, ContentDelta, KnownStreamEvent, StreamEvent,
};
use llmux_protocol::openai::{
    ChatCompletionChunk, ChatRole, ChunkDelta, FinishReason, FunctionCallChunk, ToolCallChunk,
    Usage,
};
use llmux_protocol::sse::SseEvent;

use crate::response::{ResponseMeta, stop_reason_to_finish};
use crate::stream::{StreamOutcome, error_events};

/// Rewrites an Anthropic messages stream into OpenAI chat-completion chunks.
///
/// The synthesized chunk id derives from the request id, not the upstream
/// message id, so replays of the same request are byte-stable.
pub struct AnthropicToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    finish_emitted: bool,
    closed: bool,
    pending_finish: Option<FinishReason>,
    outcome: StreamOutcome,
}

impl AnthropicToOpenAiStream {
    pub fn new(meta: &ResponseMeta) -> Self {
        Self {
            id: meta.completion_id(),
            model: meta.model.clone(),
            created: meta.created,
            role_emitted: false,
            finish_emitted: false,
            closed: false,
            pending_finish: None,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.closed = true;
                return error_events(
                    llmux_common::Dialect::OpenAiChat,
                    "upstream_error",
                    &format!("unparseable upstream event: {err}"),
                );
            }
        };
        let known = match parsed {
            StreamEvent::Known(known) => known,
            StreamEvent::Unknown(_) => return Vec::new(),
        };

        match known {
            KnownStreamEvent::MessageStart { message } => {
                self.model = message.model;
                if message.usage.input_tokens.is_some() {
                    self.outcome.input_tokens = message.usage.input_tokens;
                }
                self.role_emitted = true;
                vec![self.encode(self.chunk(
                    ChunkDelta {
                        role: Some(ChatRole::Assistant),
                        content: Some(String::new()),
                        tool_calls: None,
                    },
                    None,
                    None,
                ))]
            }
            KnownStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.block_start(index, content_block),
            KnownStreamEvent::ContentBlockDelta { index, delta } => self.block_delta(index, delta),
            KnownStreamEvent::ContentBlockStop { .. } => Vec::new(),
            KnownStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage
                    && usage.output_tokens.is_some()
                {
                    self.outcome.output_tokens = usage.output_tokens;
                }
                self.pending_finish = delta.stop_reason.map(stop_reason_to_finish);
                Vec::new()
            }
            KnownStreamEvent::MessageStop => {
                self.outcome.finished = true;
                self.closed = true;
                let mut out = Vec::new();
                if !self.finish_emitted {
                    self.finish_emitted = true;
                    let finish = self.pending_finish.unwrap_or(FinishReason::Stop);
                    out.push(self.encode(self.chunk(
                        ChunkDelta::default(),
                        Some(finish),
                        self.final_usage(),
                    )));
                }
                out.push(SseEvent::data("[DONE]"));
                out
            }
            KnownStreamEvent::Ping => Vec::new(),
            KnownStreamEvent::Error { error } => {
                self.closed = true;
                error_events(
                    llmux_common::Dialect::OpenAiChat,
                    &error.error_type,
                    &error.message,
                )
            }
        }
    }

    pub fn close(&mut self) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut out = Vec::new();
        if !self.finish_emitted {
            self.finish_emitted = true;
            let finish = self.pending_finish.unwrap_or(FinishReason::Stop);
            out.push(self.encode(self.chunk(ChunkDelta::default(), Some(finish), self.final_usage())));
        }
        out.push(SseEvent::data("[DONE]"));
        out
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }

    fn block_start(&mut self, index: u32, block: ContentBlock) -> Vec<SseEvent> {
        match block {
            ContentBlock::Text { text } | ContentBlock::Thinking { thinking: text } => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    self.text_chunks(text)
                }
            }
            ContentBlock::ToolUse { id, name, .. } => {
                let chunk = self.chunk(
                    ChunkDelta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![ToolCallChunk {
                            index,
                            id: Some(id),
                            call_type: Some("function".to_string()),
                            function: Some(FunctionCallChunk {
                                name: Some(name),
                                arguments: None,
                            }),
                        }]),
                    },
                    None,
                    None,
                );
                vec![self.encode(chunk)]
            }
            _ => Vec::new(),
        }
    }

    fn block_delta(&mut self, index: u32, delta: ContentDelta) -> Vec<SseEvent> {
        match delta {
            ContentDelta::TextDelta { text } | ContentDelta::ThinkingDelta { thinking: text } => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    self.text_chunks(text)
                }
            }
            ContentDelta::InputJsonDelta { partial_json } => {
                if partial_json.is_empty() {
                    return Vec::new();
                }
                let chunk = self.chunk(
                    ChunkDelta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![ToolCallChunk {
                            index,
                            id: None,
                            call_type: Some("function".to_string()),
                            function: Some(FunctionCallChunk {
                                name: None,
                                arguments: Some(partial_json),
                            }),
                        }]),
                    },
                    None,
                    None,
                );
                vec![self.encode(chunk)]
            }
            ContentDelta::SignatureDelta { .. } => Vec::new(),
        }
    }

    fn text_chunks(&mut self, text: String) -> Vec<SseEvent> {
        self.outcome.completion_chars += text.len() as u64;
        let mut out = Vec::new();
        if !self.role_emitted {
            // Upstream skipped message_start; honor the first-message rule.
            self.role_emitted = true;
            out.push(self.encode(self.chunk(
                ChunkDelta {
                    role: Some(ChatRole::Assistant),
                    content: Some(String::new()),
                    tool_calls: None,
                },
                None,
                None,
            )));
        }
        out.push(self.encode(self.chunk(
            ChunkDelta {
                role: None,
                content: Some(text),
                tool_calls: None,
            },
            None,
            None,
        )));
        out
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        let mut chunk = ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created)
            .with_delta(delta, finish_reason);
        chunk.usage = usage;
        chunk
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
