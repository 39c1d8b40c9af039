use std::sync::LazyLock;

use llmux_common::Dialect;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

use crate::request::RequestBody;

/// Flat estimate added per image input, in tokens.
pub const IMAGE_TOKEN_ESTIMATE: u64 = 1200;

/// Per-message wrapper overhead in the OpenAI chat format.
const OPENAI_TOKENS_PER_MESSAGE: u64 = 4;
/// Reply priming overhead.
const OPENAI_REPLY_PRIMING: u64 = 3;

static O200K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| o200k_base().ok());
static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| cl100k_base().ok());

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    // Older chat models still use cl100k; everything current is o200k.
    if model.starts_with("gpt-3.5") || model.starts_with("gpt-4-") || model == "gpt-4" {
        CL100K.as_ref()
    } else {
        O200K.as_ref()
    }
}

fn bpe_count(model: &str, text: &str) -> u64 {
    match bpe_for_model(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        // Vocabulary failed to load; fall back to the character estimate.
        None => (text.len() as u64).div_ceil(4),
    }
}

/// Count tokens of plain text under the given dialect's tokenizer. BPE for
/// the OpenAI lineage, character-ratio estimates elsewhere. Monotonic in
/// the input, and zero for empty text.
pub fn count_text(dialect: Dialect, model: &str, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match dialect {
        Dialect::OpenAiChat | Dialect::MistralChat => bpe_count(model, text),
        // Anthropic averages ~3.5 chars/token on English text.
        Dialect::AnthropicMessages => (text.len() as u64).div_ceil(7) * 2,
        Dialect::GoogleAi => (text.len() as u64).div_ceil(4),
    }
}

/// Count the full prompt of a parsed request body, images included.
pub fn count_prompt_tokens(body: &RequestBody) -> u64 {
    match body {
        RequestBody::OpenAi(req) => {
            let mut total = OPENAI_REPLY_PRIMING;
            for message in &req.messages {
                total += OPENAI_TOKENS_PER_MESSAGE;
                if let Some(content) = &message.content {
                    let text = content.flat_text();
                    if !text.is_empty() {
                        total += bpe_count(&req.model, &text);
                    }
                    total += content.image_count() as u64 * IMAGE_TOKEN_ESTIMATE;
                }
                if let Some(name) = &message.name {
                    total += bpe_count(&req.model, name);
                }
                for call in message.tool_calls.iter().flatten() {
                    total += bpe_count(&req.model, &call.function.arguments);
                }
            }
            total
        }
        RequestBody::Mistral(req) => {
            let mut total = OPENAI_REPLY_PRIMING;
            for message in &req.messages {
                total += OPENAI_TOKENS_PER_MESSAGE;
                if let Some(content) = &message.content {
                    let text = content.flat_text();
                    if !text.is_empty() {
                        total += bpe_count(&req.model, &text);
                    }
                    total += content.image_count() as u64 * IMAGE_TOKEN_ESTIMATE;
                }
            }
            total
        }
        RequestBody::Anthropic(req) => {
            let mut total = 0;
            if let Some(system) = &req.system {
                total += count_text(Dialect::AnthropicMessages, &req.model, &system.flat_text());
            }
            for message in &req.messages {
                total += count_text(
                    Dialect::AnthropicMessages,
                    &req.model,
                    &message.content.flat_text(),
                );
                total += message.content.image_count() as u64 * IMAGE_TOKEN_ESTIMATE;
            }
            total
        }
        RequestBody::Google(req) => {
            let mut total = 0;
            if let Some(system) = &req.system_instruction {
                total += count_text(Dialect::GoogleAi, "", &system.flat_text());
            }
            for content in &req.contents {
                total += count_text(Dialect::GoogleAi, "", &content.flat_text());
                total += content.image_count() as u64 * IMAGE_TOKEN_ESTIMATE;
            }
            total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_protocol::openai::{ChatMessage, ChatRole};

    #[test]
    fn empty_counts_zero() {
        for dialect in [
            Dialect::OpenAiChat,
            Dialect::AnthropicMessages,
            Dialect::GoogleAi,
            Dialect::MistralChat,
        ] {
            assert_eq!(count_text(dialect, "gpt-4o", ""), 0);
        }
    }

    #[test]
    fn counting_is_monotonic() {
        for dialect in [
            Dialect::OpenAiChat,
            Dialect::AnthropicMessages,
            Dialect::GoogleAi,
        ] {
            let short = count_text(dialect, "gpt-4o", "hello world");
            let long = count_text(dialect, "gpt-4o", "hello world, and then some more words");
            assert!(long >= short, "{dialect:?} not monotonic");
        }
    }

    #[test]
    fn images_add_flat_estimate() {
        use llmux_protocol::openai::{ContentPart, ImageUrl, MessageContent};
        let with_image = RequestBody::OpenAi(llmux_protocol::openai::ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: Some(MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "look".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,AA==".to_string(),
                            detail: None,
                        },
                    },
                ])),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            ..Default::default()
        });
        let without_image = RequestBody::OpenAi(llmux_protocol::openai::ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::text(ChatRole::User, "look")],
            ..Default::default()
        });
        assert_eq!(
            count_prompt_tokens(&with_image),
            count_prompt_tokens(&without_image) + IMAGE_TOKEN_ESTIMATE
        );
    }
}
