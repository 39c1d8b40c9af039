use llmux_common::Dialect;
use llmux_protocol::{anthropic, google, openai};
use serde_json::Value as JsonValue;

use crate::TranslateError;

/// Per-request identity injected at preprocess time so synthesized ids are
/// deterministic for a given request.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub request_id: String,
    pub model: String,
    pub created: i64,
}

impl ResponseMeta {
    pub fn completion_id(&self) -> String {
        format!("chatcmpl-{}", self.request_id)
    }

    pub fn message_id(&self) -> String {
        format!("msg_{}", self.request_id)
    }
}

/// A parsed blocking response body in one of the supported dialects.
/// Mistral responses reuse the OpenAI shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    OpenAi(openai::ChatCompletionResponse),
    Anthropic(anthropic::MessagesResponse),
    Google(google::GenerateContentResponse),
}

impl ResponseBody {
    pub fn parse(dialect: Dialect, body: &[u8]) -> Result<Self, TranslateError> {
        let schema_err = |err: serde_json::Error| TranslateError::Schema(err.to_string());
        match dialect {
            Dialect::OpenAiChat | Dialect::MistralChat => Ok(ResponseBody::OpenAi(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
            Dialect::AnthropicMessages => Ok(ResponseBody::Anthropic(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
            Dialect::GoogleAi => Ok(ResponseBody::Google(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TranslateError> {
        let encode_err = |err: serde_json::Error| TranslateError::Schema(err.to_string());
        match self {
            ResponseBody::OpenAi(resp) => serde_json::to_vec(resp).map_err(encode_err),
            ResponseBody::Anthropic(resp) => serde_json::to_vec(resp).map_err(encode_err),
            ResponseBody::Google(resp) => serde_json::to_vec(resp).map_err(encode_err),
        }
    }

    /// Completion token count as reported by the upstream, if any.
    pub fn reported_usage(&self) -> (Option<u64>, Option<u64>) {
        match self {
            ResponseBody::OpenAi(resp) => match &resp.usage {
                Some(usage) => (Some(usage.prompt_tokens), Some(usage.completion_tokens)),
                None => (None, None),
            },
            ResponseBody::Anthropic(resp) => {
                (resp.usage.input_tokens, resp.usage.output_tokens)
            }
            ResponseBody::Google(resp) => match &resp.usage_metadata {
                Some(usage) => (usage.prompt_token_count, usage.candidates_token_count),
                None => (None, None),
            },
        }
    }

    /// Concatenated completion text, used to estimate output tokens when
    /// the upstream reports no usage.
    pub fn completion_text(&self) -> String {
        match self {
            ResponseBody::OpenAi(resp) => resp
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .unwrap_or_default(),
            ResponseBody::Anthropic(resp) => resp
                .content
                .iter()
                .filter_map(|block| match block {
                    anthropic::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            ResponseBody::Google(resp) => resp
                .candidates
                .first()
                .and_then(|candidate| candidate.content.as_ref())
                .map(|content| content.flat_text())
                .unwrap_or_default(),
        }
    }
}

/// Blocking-response table, symmetric to the request table.
pub fn translate_response(
    body: ResponseBody,
    to: Dialect,
    meta: &ResponseMeta,
) -> Result<ResponseBody, TranslateError> {
    let from = match &body {
        ResponseBody::OpenAi(_) => Dialect::OpenAiChat,
        ResponseBody::Anthropic(_) => Dialect::AnthropicMessages,
        ResponseBody::Google(_) => Dialect::GoogleAi,
    };
    if from == to || (from == Dialect::OpenAiChat && to == Dialect::MistralChat) {
        return Ok(body);
    }
    match (body, to) {
        (ResponseBody::Anthropic(resp), Dialect::OpenAiChat | Dialect::MistralChat) => {
            Ok(ResponseBody::OpenAi(anthropic_to_openai(resp, meta)))
        }
        (ResponseBody::Google(resp), Dialect::OpenAiChat | Dialect::MistralChat) => {
            Ok(ResponseBody::OpenAi(google_to_openai(resp, meta)))
        }
        (ResponseBody::OpenAi(resp), Dialect::AnthropicMessages) => {
            Ok(ResponseBody::Anthropic(openai_to_anthropic(resp, meta)))
        }
        (ResponseBody::Google(resp), Dialect::AnthropicMessages) => Ok(ResponseBody::Anthropic(
            openai_to_anthropic(google_to_openai(resp, meta), meta),
        )),
        (_, to) => Err(TranslateError::Unsupported { from, to }),
    }
}

fn anthropic_to_openai(
    resp: anthropic::MessagesResponse,
    meta: &ResponseMeta,
) -> openai::ChatCompletionResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    for block in &resp.content {
        match block {
            anthropic::ContentBlock::Text { text } => text_parts.push(text.clone()),
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                })
            }
            _ => {}
        }
    }

    let usage = openai::Usage {
        prompt_tokens: resp.usage.input_tokens.unwrap_or(0),
        completion_tokens: resp.usage.output_tokens.unwrap_or(0),
        total_tokens: resp.usage.input_tokens.unwrap_or(0) + resp.usage.output_tokens.unwrap_or(0),
        completion_tokens_details: None,
    };

    openai::ChatCompletionResponse {
        id: meta.completion_id(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: resp.model.clone(),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::AssistantMessage {
                role: openai::ChatRole::Assistant,
                content: Some(text_parts.join("")),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: resp.stop_reason.map(stop_reason_to_finish),
        }],
        usage: Some(usage),
    }
}

fn openai_to_anthropic(
    resp: openai::ChatCompletionResponse,
    meta: &ResponseMeta,
) -> anthropic::MessagesResponse {
    let choice = resp.choices.into_iter().next();
    let mut content: Vec<anthropic::ContentBlock> = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = choice {
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(anthropic::ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.into_iter().flatten() {
            content.push(anthropic::ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: serde_json::from_str(&call.function.arguments).unwrap_or(JsonValue::Null),
            });
        }
        stop_reason = choice.finish_reason.map(finish_to_stop_reason);
    }

    anthropic::MessagesResponse {
        id: meta.message_id(),
        response_type: "message".to_string(),
        role: anthropic::MessageRole::Assistant,
        model: resp.model,
        content,
        stop_reason,
        stop_sequence: None,
        usage: anthropic::MessagesUsage {
            input_tokens: resp.usage.as_ref().map(|usage| usage.prompt_tokens),
            output_tokens: resp.usage.as_ref().map(|usage| usage.completion_tokens),
        },
    }
}

fn google_to_openai(
    resp: google::GenerateContentResponse,
    meta: &ResponseMeta,
) -> openai::ChatCompletionResponse {
    let candidate = resp.candidates.first();
    let content = candidate
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| content.flat_text())
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|candidate| candidate.finish_reason)
        .map(google_finish_to_openai);

    openai::ChatCompletionResponse {
        id: meta.completion_id(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: resp
            .model_version
            .clone()
            .unwrap_or_else(|| meta.model.clone()),
        choices: vec![openai::ChatChoice {
            index: 0,
            message: openai::AssistantMessage {
                role: openai::ChatRole::Assistant,
                content: Some(content),
                tool_calls: None,
            },
            finish_reason,
        }],
        usage: resp.usage_metadata.as_ref().map(|usage| openai::Usage {
            prompt_tokens: usage.prompt_token_count.unwrap_or(0),
            completion_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
            completion_tokens_details: None,
        }),
    }
}

pub fn stop_reason_to_finish(reason: anthropic::StopReason) -> openai::FinishReason {
    match reason {
        anthropic::StopReason::EndTurn | anthropic::StopReason::StopSequence => {
            openai::FinishReason::Stop
        }
        anthropic::StopReason::MaxTokens => openai::FinishReason::Length,
        anthropic::StopReason::ToolUse => openai::FinishReason::ToolCalls,
        anthropic::StopReason::Refusal => openai::FinishReason::ContentFilter,
    }
}

pub fn finish_to_stop_reason(reason: openai::FinishReason) -> anthropic::StopReason {
    match reason {
        openai::FinishReason::Stop => anthropic::StopReason::EndTurn,
        openai::FinishReason::Length => anthropic::StopReason::MaxTokens,
        openai::FinishReason::ToolCalls => anthropic::StopReason::ToolUse,
        openai::FinishReason::ContentFilter => anthropic::StopReason::Refusal,
    }
}

pub fn google_finish_to_openai(reason: google::FinishReason) -> openai::FinishReason {
    match reason {
        google::FinishReason::Stop | google::FinishReason::Other => openai::FinishReason::Stop,
        google::FinishReason::MaxTokens => openai::FinishReason::Length,
        google::FinishReason::Safety | google::FinishReason::Recitation => {
            openai::FinishReason::ContentFilter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ResponseMeta {
        ResponseMeta {
            request_id: "0123456789abcdef".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            created: 1_700_000_000,
        }
    }

    #[test]
    fn anthropic_blocking_becomes_chat_completion() {
        let resp = anthropic::MessagesResponse {
            id: "msg_up".to_string(),
            response_type: "message".to_string(),
            role: anthropic::MessageRole::Assistant,
            model: "claude-3-5-sonnet-20241022".to_string(),
            content: vec![anthropic::ContentBlock::Text {
                text: "hello".to_string(),
            }],
            stop_reason: Some(anthropic::StopReason::EndTurn),
            stop_sequence: None,
            usage: anthropic::MessagesUsage {
                input_tokens: Some(10),
                output_tokens: Some(2),
            },
        };
        let out = translate_response(
            ResponseBody::Anthropic(resp),
            Dialect::OpenAiChat,
            &meta(),
        )
        .unwrap();
        let ResponseBody::OpenAi(out) = out else {
            panic!("wrong dialect");
        };
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.id, "chatcmpl-0123456789abcdef");
        assert_eq!(out.choices[0].message.role, openai::ChatRole::Assistant);
        assert_eq!(out.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(
            out.choices[0].finish_reason,
            Some(openai::FinishReason::Stop)
        );
        assert_eq!(out.usage.as_ref().unwrap().total_tokens, 12);
    }

    #[test]
    fn synthesized_ids_are_deterministic() {
        let resp = google::GenerateContentResponse::default();
        let a = google_to_openai(resp.clone(), &meta());
        let b = google_to_openai(resp, &meta());
        assert_eq!(a.id, b.id);
    }
}
