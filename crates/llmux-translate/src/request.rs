use llmux_common::Dialect;
use llmux_protocol::{anthropic, google, mistral, openai};
use serde_json::Value as JsonValue;

use crate::TranslateError;

const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 4096;

/// A parsed request body in one of the supported dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    OpenAi(openai::ChatCompletionRequest),
    Anthropic(anthropic::MessagesRequest),
    Google(google::GenerateContentRequest),
    Mistral(mistral::ChatCompletionRequest),
}

impl RequestBody {
    pub fn parse(dialect: Dialect, body: &[u8]) -> Result<Self, TranslateError> {
        let schema_err = |err: serde_json::Error| TranslateError::Schema(err.to_string());
        match dialect {
            Dialect::OpenAiChat => Ok(RequestBody::OpenAi(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
            Dialect::AnthropicMessages => Ok(RequestBody::Anthropic(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
            Dialect::GoogleAi => Ok(RequestBody::Google(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
            Dialect::MistralChat => Ok(RequestBody::Mistral(
                serde_json::from_slice(body).map_err(schema_err)?,
            )),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            RequestBody::OpenAi(_) => Dialect::OpenAiChat,
            RequestBody::Anthropic(_) => Dialect::AnthropicMessages,
            RequestBody::Google(_) => Dialect::GoogleAi,
            RequestBody::Mistral(_) => Dialect::MistralChat,
        }
    }

    /// The `model` field. Google bodies carry the model in the URL path, so
    /// the router stores it back here via [`RequestBody::set_model`].
    pub fn model(&self) -> &str {
        match self {
            RequestBody::OpenAi(req) => &req.model,
            RequestBody::Anthropic(req) => &req.model,
            RequestBody::Google(_) => "",
            RequestBody::Mistral(req) => &req.model,
        }
    }

    pub fn set_model(&mut self, model: &str) {
        match self {
            RequestBody::OpenAi(req) => req.model = model.to_string(),
            RequestBody::Anthropic(req) => req.model = model.to_string(),
            RequestBody::Google(_) => {}
            RequestBody::Mistral(req) => req.model = model.to_string(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            RequestBody::OpenAi(req) => req.is_streaming(),
            RequestBody::Anthropic(req) => req.is_streaming(),
            RequestBody::Google(_) => false,
            RequestBody::Mistral(req) => req.is_streaming(),
        }
    }

    /// The client's requested output budget, if stated.
    pub fn output_tokens(&self) -> Option<u64> {
        match self {
            RequestBody::OpenAi(req) => req.output_tokens(),
            RequestBody::Anthropic(req) => Some(req.max_tokens),
            RequestBody::Google(req) => req
                .generation_config
                .as_ref()
                .and_then(|config| config.max_output_tokens),
            RequestBody::Mistral(req) => req.max_tokens,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TranslateError> {
        let encode_err = |err: serde_json::Error| TranslateError::Schema(err.to_string());
        match self {
            RequestBody::OpenAi(req) => serde_json::to_vec(req).map_err(encode_err),
            RequestBody::Anthropic(req) => serde_json::to_vec(req).map_err(encode_err),
            RequestBody::Google(req) => serde_json::to_vec(req).map_err(encode_err),
            RequestBody::Mistral(req) => serde_json::to_vec(req).map_err(encode_err),
        }
    }
}

/// The request-transform table over the dialect product. Identity pairs
/// return the body unchanged; uncovered pairs fail with `Unsupported`.
pub fn translate_request(body: RequestBody, to: Dialect) -> Result<RequestBody, TranslateError> {
    let from = body.dialect();
    if from == to {
        return Ok(body);
    }
    match (body, to) {
        (RequestBody::OpenAi(req), Dialect::AnthropicMessages) => {
            Ok(RequestBody::Anthropic(openai_to_anthropic(req)))
        }
        (RequestBody::Anthropic(req), Dialect::OpenAiChat) => {
            Ok(RequestBody::OpenAi(anthropic_to_openai(req)))
        }
        (RequestBody::OpenAi(req), Dialect::GoogleAi) => {
            Ok(RequestBody::Google(openai_to_google(req)))
        }
        (RequestBody::Google(req), Dialect::OpenAiChat) => {
            Ok(RequestBody::OpenAi(google_to_openai(req)))
        }
        (RequestBody::OpenAi(req), Dialect::MistralChat) => {
            Ok(RequestBody::Mistral(openai_to_mistral(req)))
        }
        (RequestBody::Mistral(req), Dialect::OpenAiChat) => {
            Ok(RequestBody::OpenAi(mistral_to_openai(req)))
        }
        (RequestBody::Anthropic(req), Dialect::GoogleAi) => {
            // Composed through the OpenAI shape; no direct table entry.
            Ok(RequestBody::Google(openai_to_google(anthropic_to_openai(
                req,
            ))))
        }
        (body, to) => Err(TranslateError::Unsupported {
            from: body.dialect(),
            to,
        }),
    }
}

fn openai_to_anthropic(req: openai::ChatCompletionRequest) -> anthropic::MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<anthropic::MessageParam> = Vec::new();

    for message in &req.messages {
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.flat_text());
                }
            }
            openai::ChatRole::User => push_merged(
                &mut messages,
                anthropic::MessageRole::User,
                openai_content_to_blocks(message.content.as_ref()),
            ),
            openai::ChatRole::Assistant => {
                let mut blocks = openai_content_to_blocks(message.content.as_ref());
                for call in message.tool_calls.iter().flatten() {
                    blocks.push(anthropic::ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::from_str(&call.function.arguments)
                            .unwrap_or(JsonValue::Null),
                    });
                }
                push_merged(&mut messages, anthropic::MessageRole::Assistant, blocks);
            }
            openai::ChatRole::Tool => {
                let block = anthropic::ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message
                        .content
                        .as_ref()
                        .map(|content| JsonValue::String(content.flat_text())),
                };
                push_merged(&mut messages, anthropic::MessageRole::User, vec![block]);
            }
        }
    }

    anthropic::MessagesRequest {
        model: req.model,
        messages,
        max_tokens: req
            .max_completion_tokens
            .or(req.max_tokens)
            .unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS),
        system: Some(anthropic::SystemPrompt::Text(system_parts.join("\n"))),
        // Anthropic temperature tops out at 1.0.
        temperature: req.temperature.map(|t| t.clamp(0.0, 1.0)),
        top_p: req.top_p,
        top_k: None,
        stop_sequences: req.stop.map(|stop| stop.into_vec()),
        stream: req.stream,
        extra: serde_json::Map::new(),
    }
}

/// Anthropic requires strict user/assistant alternation; consecutive blocks
/// with the same role are merged into one message.
fn push_merged(
    messages: &mut Vec<anthropic::MessageParam>,
    role: anthropic::MessageRole,
    blocks: Vec<anthropic::ContentBlock>,
) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut()
        && last.role == role
    {
        let existing = match &last.content {
            anthropic::MessageContent::Text(text) => vec![anthropic::ContentBlock::Text {
                text: text.clone(),
            }],
            anthropic::MessageContent::Blocks(existing) => existing.clone(),
        };
        let mut merged = existing;
        merged.extend(blocks);
        last.content = anthropic::MessageContent::Blocks(merged);
        return;
    }
    messages.push(anthropic::MessageParam {
        role,
        content: anthropic::MessageContent::Blocks(blocks),
    });
}

fn openai_content_to_blocks(
    content: Option<&openai::MessageContent>,
) -> Vec<anthropic::ContentBlock> {
    match content {
        None => Vec::new(),
        Some(openai::MessageContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![anthropic::ContentBlock::Text { text: text.clone() }]
            }
        }
        Some(openai::MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => {
                    anthropic::ContentBlock::Text { text: text.clone() }
                }
                openai::ContentPart::ImageUrl { image_url } => anthropic::ContentBlock::Image {
                    source: data_url_to_source(&image_url.url),
                },
            })
            .collect(),
    }
}

fn data_url_to_source(url: &str) -> anthropic::ImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(";base64,")
    {
        return anthropic::ImageSource::Base64 {
            media_type: meta.to_string(),
            data: data.to_string(),
        };
    }
    anthropic::ImageSource::Url {
        url: url.to_string(),
    }
}

fn anthropic_to_openai(req: anthropic::MessagesRequest) -> openai::ChatCompletionRequest {
    let mut messages: Vec<openai::ChatMessage> = Vec::new();

    if let Some(system) = &req.system {
        let text = system.flat_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::System, text));
        }
    }

    for message in &req.messages {
        match &message.content {
            anthropic::MessageContent::Text(text) => messages.push(openai::ChatMessage::text(
                map_role_to_openai(message.role),
                text.clone(),
            )),
            anthropic::MessageContent::Blocks(blocks) => {
                let mut parts: Vec<openai::ContentPart> = Vec::new();
                let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
                for block in blocks {
                    match block {
                        anthropic::ContentBlock::Text { text } => {
                            parts.push(openai::ContentPart::Text { text: text.clone() })
                        }
                        anthropic::ContentBlock::Image { source } => {
                            parts.push(openai::ContentPart::ImageUrl {
                                image_url: openai::ImageUrl {
                                    url: source_to_url(source),
                                    detail: None,
                                },
                            })
                        }
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
                        anthropic::ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => messages.push(openai::ChatMessage {
                            role: openai::ChatRole::Tool,
                            content: Some(openai::MessageContent::Text(
                                content
                                    .as_ref()
                                    .map(|value| match value {
                                        JsonValue::String(text) => text.clone(),
                                        other => other.to_string(),
                                    })
                                    .unwrap_or_default(),
                            )),
                            name: None,
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        }),
                        anthropic::ContentBlock::Thinking { .. } => {}
                    }
                }
                if !parts.is_empty() || !tool_calls.is_empty() {
                    messages.push(openai::ChatMessage {
                        role: map_role_to_openai(message.role),
                        content: (!parts.is_empty()).then(|| collapse_parts(parts)),
                        name: None,
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        tool_call_id: None,
                    });
                }
            }
        }
    }

    openai::ChatCompletionRequest {
        model: req.model,
        messages,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stop: req.stop_sequences.map(openai::StopSequences::Many),
        stream: req.stream,
        stream_options: None,
        user: None,
        extra: serde_json::Map::new(),
    }
}

/// A single text part collapses back to the plain-string content form.
fn collapse_parts(parts: Vec<openai::ContentPart>) -> openai::MessageContent {
    match parts.as_slice() {
        [openai::ContentPart::Text { text }] => openai::MessageContent::Text(text.clone()),
        _ => openai::MessageContent::Parts(parts),
    }
}

fn map_role_to_openai(role: anthropic::MessageRole) -> openai::ChatRole {
    match role {
        anthropic::MessageRole::User => openai::ChatRole::User,
        anthropic::MessageRole::Assistant => openai::ChatRole::Assistant,
    }
}

fn source_to_url(source: &anthropic::ImageSource) -> String {
    match source {
        anthropic::ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        anthropic::ImageSource::Url { url } => url.clone(),
    }
}

fn openai_to_google(req: openai::ChatCompletionRequest) -> google::GenerateContentRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<google::Content> = Vec::new();

    for message in &req.messages {
        let role = match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.flat_text());
                }
                continue;
            }
            openai::ChatRole::Assistant => google::ContentRole::Model,
            _ => google::ContentRole::User,
        };
        let parts = match &message.content {
            None => Vec::new(),
            Some(openai::MessageContent::Text(text)) => vec![google::Part::Text(text.clone())],
            Some(openai::MessageContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    openai::ContentPart::Text { text } => google::Part::Text(text.clone()),
                    openai::ContentPart::ImageUrl { image_url } => {
                        match data_url_to_source(&image_url.url) {
                            anthropic::ImageSource::Base64 { media_type, data } => {
                                google::Part::InlineData(google::Blob {
                                    mime_type: media_type,
                                    data,
                                })
                            }
                            anthropic::ImageSource::Url { url } => google::Part::Text(url),
                        }
                    }
                })
                .collect(),
        };
        if !parts.is_empty() {
            contents.push(google::Content {
                role: Some(role),
                parts,
            });
        }
    }

    google::GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| google::Content {
            role: None,
            parts: vec![google::Part::Text(system_parts.join("\n"))],
        }),
        generation_config: Some(google::GenerationConfig {
            max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            candidate_count: req.n,
            stop_sequences: req.stop.map(|stop| stop.into_vec()),
        }),
        safety_settings: None,
        tools: None,
    }
}

fn google_to_openai(req: google::GenerateContentRequest) -> openai::ChatCompletionRequest {
    let mut messages: Vec<openai::ChatMessage> = Vec::new();

    if let Some(system) = &req.system_instruction {
        let text = system.flat_text();
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::System, text));
        }
    }
    for content in &req.contents {
        let role = match content.role {
            Some(google::ContentRole::Model) => openai::ChatRole::Assistant,
            _ => openai::ChatRole::User,
        };
        messages.push(openai::ChatMessage::text(role, content.flat_text()));
    }

    let config = req.generation_config.unwrap_or_default();
    openai::ChatCompletionRequest {
        model: String::new(),
        messages,
        max_tokens: config.max_output_tokens,
        max_completion_tokens: None,
        temperature: config.temperature,
        top_p: config.top_p,
        n: config.candidate_count,
        stop: config.stop_sequences.map(openai::StopSequences::Many),
        stream: None,
        stream_options: None,
        user: None,
        extra: serde_json::Map::new(),
    }
}

fn openai_to_mistral(req: openai::ChatCompletionRequest) -> mistral::ChatCompletionRequest {
    let random_seed = req
        .extra
        .get("seed")
        .and_then(JsonValue::as_u64);
    mistral::ChatCompletionRequest {
        model: req.model,
        messages: req.messages,
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop,
        stream: req.stream,
        random_seed,
        safe_prompt: None,
        extra: serde_json::Map::new(),
    }
}

fn mistral_to_openai(req: mistral::ChatCompletionRequest) -> openai::ChatCompletionRequest {
    let mut extra = serde_json::Map::new();
    if let Some(seed) = req.random_seed {
        extra.insert("seed".to_string(), JsonValue::from(seed));
    }
    openai::ChatCompletionRequest {
        model: req.model,
        messages: req.messages,
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stop: req.stop,
        stream: req.stream,
        stream_options: None,
        user: None,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_request(messages: Vec<openai::ChatMessage>) -> openai::ChatCompletionRequest {
        openai::ChatCompletionRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages,
            max_tokens: Some(64),
            temperature: Some(1.4),
            stream: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn openai_to_anthropic_splits_system() {
        let req = openai_request(vec![
            openai::ChatMessage::text(openai::ChatRole::System, "be brief"),
            openai::ChatMessage::text(openai::ChatRole::User, "hi"),
        ]);
        let out = openai_to_anthropic(req);
        assert_eq!(
            out.system,
            Some(anthropic::SystemPrompt::Text("be brief".to_string()))
        );
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, anthropic::MessageRole::User);
        assert_eq!(out.max_tokens, 64);
        assert_eq!(out.temperature, Some(1.0));
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let req = openai_request(vec![
            openai::ChatMessage::text(openai::ChatRole::User, "one"),
            openai::ChatMessage::text(openai::ChatRole::User, "two"),
        ]);
        let out = openai_to_anthropic(req);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content.flat_text(), "one\ntwo");
    }

    #[test]
    fn round_trip_preserves_semantic_fields() {
        let req = openai_request(vec![
            openai::ChatMessage::text(openai::ChatRole::System, "sys"),
            openai::ChatMessage::text(openai::ChatRole::User, "hello"),
        ]);
        let there = translate_request(RequestBody::OpenAi(req.clone()), Dialect::AnthropicMessages)
            .unwrap();
        let back = translate_request(there, Dialect::OpenAiChat).unwrap();
        let RequestBody::OpenAi(back) = back else {
            panic!("wrong dialect");
        };
        assert_eq!(back.model, req.model);
        assert_eq!(back.max_tokens, req.max_tokens);
        assert_eq!(back.stream, req.stream);
        assert_eq!(back.messages.len(), 2);
        assert_eq!(
            back.messages[1].content.as_ref().unwrap().flat_text(),
            "hello"
        );
    }

    #[test]
    fn openai_to_google_moves_system_instruction() {
        let req = openai_request(vec![
            openai::ChatMessage::text(openai::ChatRole::System, "sys"),
            openai::ChatMessage::text(openai::ChatRole::User, "q"),
            openai::ChatMessage::text(openai::ChatRole::Assistant, "a"),
        ]);
        let out = openai_to_google(req);
        assert_eq!(
            out.system_instruction.as_ref().unwrap().flat_text(),
            "sys"
        );
        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[1].role, Some(google::ContentRole::Model));
        assert_eq!(
            out.generation_config.as_ref().unwrap().max_output_tokens,
            Some(64)
        );
    }

    #[test]
    fn mistral_seed_moves_between_dialects() {
        let mut req = openai_request(vec![openai::ChatMessage::text(
            openai::ChatRole::User,
            "hi",
        )]);
        req.extra
            .insert("seed".to_string(), JsonValue::from(7u64));
        let out = openai_to_mistral(req);
        assert_eq!(out.random_seed, Some(7));
        let back = mistral_to_openai(out);
        assert_eq!(back.extra.get("seed"), Some(&JsonValue::from(7u64)));
    }

    #[test]
    fn unsupported_pair_is_reported() {
        let req = google::GenerateContentRequest::default();
        let err = translate_request(RequestBody::Google(req), Dialect::AnthropicMessages)
            .unwrap_err();
        assert!(matches!(err, TranslateError::Unsupported { .. }));
    }
}
