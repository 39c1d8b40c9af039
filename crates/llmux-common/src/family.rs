use serde::{Deserialize, Serialize};

/// Coarse grouping of models sharing billing and rate-limit characteristics.
///
/// Queue partitions and per-key usage counters are keyed by family, not by
/// the exact model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "turbo")]
    Turbo,
    #[serde(rename = "gpt4")]
    Gpt4,
    #[serde(rename = "gpt4-turbo")]
    Gpt4Turbo,
    #[serde(rename = "gpt4o")]
    Gpt4o,
    #[serde(rename = "o1")]
    O1,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "claude-opus")]
    ClaudeOpus,
    #[serde(rename = "gemini-flash")]
    GeminiFlash,
    #[serde(rename = "gemini-pro")]
    GeminiPro,
    #[serde(rename = "mistral-small")]
    MistralSmall,
    #[serde(rename = "mistral-large")]
    MistralLarge,
    #[serde(rename = "aws-claude")]
    AwsClaude,
    #[serde(rename = "aws-claude-opus")]
    AwsClaudeOpus,
    #[serde(rename = "gcp-claude")]
    GcpClaude,
    #[serde(rename = "azure-gpt4o")]
    AzureGpt4o,
    #[serde(rename = "deepseek")]
    Deepseek,
    #[serde(rename = "grok")]
    Grok,
    #[serde(rename = "command-r")]
    CommandR,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "moonshot")]
    Moonshot,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 20] = [
        ModelFamily::Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4Turbo,
        ModelFamily::Gpt4o,
        ModelFamily::O1,
        ModelFamily::Claude,
        ModelFamily::ClaudeOpus,
        ModelFamily::GeminiFlash,
        ModelFamily::GeminiPro,
        ModelFamily::MistralSmall,
        ModelFamily::MistralLarge,
        ModelFamily::AwsClaude,
        ModelFamily::AwsClaudeOpus,
        ModelFamily::GcpClaude,
        ModelFamily::AzureGpt4o,
        ModelFamily::Deepseek,
        ModelFamily::Grok,
        ModelFamily::CommandR,
        ModelFamily::Qwen,
        ModelFamily::Moonshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::O1 => "o1",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralLarge => "mistral-large",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::AwsClaudeOpus => "aws-claude-opus",
            ModelFamily::GcpClaude => "gcp-claude",
            ModelFamily::AzureGpt4o => "azure-gpt4o",
            ModelFamily::Deepseek => "deepseek",
            ModelFamily::Grok => "grok",
            ModelFamily::CommandR => "command-r",
            ModelFamily::Qwen => "qwen",
            ModelFamily::Moonshot => "moonshot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ModelFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == value)
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
