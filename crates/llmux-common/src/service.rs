use serde::{Deserialize, Serialize};

/// One upstream provider API. Many credentials may exist per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google-ai")]
    GoogleAi,
    #[serde(rename = "mistral-ai")]
    MistralAi,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "gcp")]
    Gcp,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "deepseek")]
    Deepseek,
    #[serde(rename = "xai")]
    Xai,
    #[serde(rename = "cohere")]
    Cohere,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "moonshot")]
    Moonshot,
}

impl Service {
    pub const ALL: [Service; 12] = [
        Service::OpenAi,
        Service::Anthropic,
        Service::GoogleAi,
        Service::MistralAi,
        Service::Aws,
        Service::Gcp,
        Service::Azure,
        Service::Deepseek,
        Service::Xai,
        Service::Cohere,
        Service::Qwen,
        Service::Moonshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::OpenAi => "openai",
            Service::Anthropic => "anthropic",
            Service::GoogleAi => "google-ai",
            Service::MistralAi => "mistral-ai",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::Azure => "azure",
            Service::Deepseek => "deepseek",
            Service::Xai => "xai",
            Service::Cohere => "cohere",
            Service::Qwen => "qwen",
            Service::Moonshot => "moonshot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == value)
    }

    /// Environment variable holding this service's comma-separated key list.
    pub fn key_env_var(&self) -> &'static str {
        match self {
            Service::OpenAi => "OPENAI_KEY",
            Service::Anthropic => "ANTHROPIC_KEY",
            Service::GoogleAi => "GOOGLE_AI_KEY",
            Service::MistralAi => "MISTRAL_AI_KEY",
            Service::Aws => "AWS_CREDENTIALS",
            Service::Gcp => "GCP_CREDENTIALS",
            Service::Azure => "AZURE_CREDENTIALS",
            Service::Deepseek => "DEEPSEEK_KEY",
            Service::Xai => "XAI_KEY",
            Service::Cohere => "COHERE_KEY",
            Service::Qwen => "QWEN_KEY",
            Service::Moonshot => "MOONSHOT_KEY",
        }
    }

    /// The wire dialect this service's completion endpoint natively speaks.
    pub fn native_dialect(&self) -> Dialect {
        match self {
            Service::Anthropic | Service::Aws | Service::Gcp => Dialect::AnthropicMessages,
            Service::GoogleAi => Dialect::GoogleAi,
            Service::MistralAi => Dialect::MistralChat,
            _ => Dialect::OpenAiChat,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The concrete wire schema of one completion endpoint: request body,
/// response body, and SSE event shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "openai-chat")]
    OpenAiChat,
    #[serde(rename = "anthropic-messages")]
    AnthropicMessages,
    #[serde(rename = "google-ai")]
    GoogleAi,
    #[serde(rename = "mistral-chat")]
    MistralChat,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAiChat => "openai-chat",
            Dialect::AnthropicMessages => "anthropic-messages",
            Dialect::GoogleAi => "google-ai",
            Dialect::MistralChat => "mistral-chat",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_roundtrip() {
        for service in Service::ALL {
            assert_eq!(Service::parse(service.as_str()), Some(service));
        }
        assert_eq!(Service::parse("openrouter"), None);
    }

    #[test]
    fn native_dialects() {
        assert_eq!(Service::Aws.native_dialect(), Dialect::AnthropicMessages);
        assert_eq!(Service::Azure.native_dialect(), Dialect::OpenAiChat);
        assert_eq!(Service::GoogleAi.native_dialect(), Dialect::GoogleAi);
    }
}
