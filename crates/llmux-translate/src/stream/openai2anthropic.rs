use llmux_protocol::anthropic::{
    ContentDelta, KnownStreamEvent, MessageDeltaBody, MessagesUsage, StopReason,
};
use llmux_protocol::openai::ChatCompletionChunk;
use llmux_protocol::sse::SseEvent;

use crate::response::{ResponseMeta, finish_to_stop_reason};
use crate::stream::{StreamOutcome, error_events};

/// Rewrites OpenAI chat-completion chunks into an Anthropic messages
/// stream: message_start, one text content block, message_delta with the
/// mapped stop reason, message_stop.
pub struct OpenAiToAnthropicStream {
    message_id: String,
    model: String,
    started: bool,
    text_block_open: bool,
    stop_reason: Option<StopReason>,
    closed: bool,
    outcome: StreamOutcome,
}

impl OpenAiToAnthropicStream {
    pub fn new(meta: &ResponseMeta) -> Self {
        Self {
            message_id: meta.message_id(),
            model: meta.model.clone(),
            started: false,
            text_block_open: false,
            stop_reason: None,
            closed: false,
            outcome: StreamOutcome::default(),
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<SseEvent> {
        if self.closed {
            return Vec::new();
        }
        if event.is_done() {
            return self.close();
        }
        let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.closed = true;
                return error_events(
                    llmux_common::Dialect::AnthropicMessages,
                    "upstream_error",
                    &format!("unparseable upstream event: {err}"),
                );
            }
        };
        if chunk.is_prompt_filter_preamble() {
            return Vec::new();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if let Some(usage) = &chunk.usage {
            self.outcome.input_tokens = Some(usage.prompt_tokens);
            self.outcome.output_tokens = Some(usage.completion_tokens);
        }

        let mut out = Vec::new();
        let Some(choice) = chunk.choices.first() else {
            return out;
        };

        if !self.started {
            self.started = true;
            out.push(self.emit(KnownStreamEvent::MessageStart {
                message: llmux_protocol::anthropic::StreamMessageStart {
                    id: self.message_id.clone(),
                    model: self.model.clone(),
                    role: llmux_protocol::anthropic::MessageRole::Assistant,
                    usage: MessagesUsage::default(),
                },
            }));
        }

        if let Some(text) = &choice.delta.content
            && !text.is_empty()
        {
            if !self.text_block_open {
                self.text_block_open = true;
                out.push(self.emit(KnownStreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: llmux_protocol::anthropic::ContentBlock::Text {
                        text: String::new(),
                    },
                }));
            }
            self.outcome.completion_chars += text.len() as u64;
            out.push(self.emit(KnownStreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { text: text.clone() },
            }));
        }

        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(finish_to_stop_reason(reason));
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
        if !self.started {
            out.push(self.emit(KnownStreamEvent::MessageStart {
                message: llmux_protocol::anthropic::StreamMessageStart {
                    id: self.message_id.clone(),
                    model: self.model.clone(),
                    role: llmux_protocol::anthropic::MessageRole::Assistant,
                    usage: MessagesUsage::default(),
                },
            }));
        }
        if self.text_block_open {
            out.push(self.emit(KnownStreamEvent::ContentBlockStop { index: 0 }));
        }
        out.push(self.emit(KnownStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: Some(MessagesUsage {
                input_tokens: self.outcome.input_tokens,
                output_tokens: self.outcome.output_tokens,
            }),
        }));
        out.push(self.emit(KnownStreamEvent::MessageStop));
        out
    }

    pub fn outcome(&self) -> StreamOutcome {
        self.outcome
    }

    fn emit(&self, event: KnownStreamEvent) -> SseEvent {
        SseEvent::named(
            event.event_name(),
            serde_json::to_string(&event).unwrap_or_default(),
        )
    }
}
