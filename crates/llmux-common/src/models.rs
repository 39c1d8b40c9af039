use std::sync::LazyLock;

use regex::Regex;

use crate::{ModelFamily, Service};

struct ModelRule {
    pattern: Regex,
    service: Service,
    family: ModelFamily,
    context_window: u64,
}

fn rule(pattern: &str, service: Service, family: ModelFamily, context_window: u64) -> ModelRule {
    ModelRule {
        // Patterns are static and vetted by the table test below.
        pattern: Regex::new(pattern).unwrap(),
        service,
        family,
        context_window,
    }
}

/// Ordered model-id rules. First match wins; service-specific rules are
/// consulted before cross-service fallbacks when a service hint is given.
pub struct ModelRegistry {
    rules: Vec<ModelRule>,
}

static REGISTRY: LazyLock<ModelRegistry> = LazyLock::new(ModelRegistry::builtin);

impl ModelRegistry {
    pub fn shared() -> &'static Self {
        &REGISTRY
    }

    fn builtin() -> Self {
        let rules = vec![
            // OpenAI
            rule("^o1", Service::OpenAi, ModelFamily::O1, 200_000),
            rule("^gpt-4o", Service::OpenAi, ModelFamily::Gpt4o, 128_000),
            rule("^chatgpt-4o", Service::OpenAi, ModelFamily::Gpt4o, 128_000),
            rule(
                "^gpt-4-turbo",
                Service::OpenAi,
                ModelFamily::Gpt4Turbo,
                128_000,
            ),
            rule(
                "^gpt-4-\\d{4}-preview",
                Service::OpenAi,
                ModelFamily::Gpt4Turbo,
                128_000,
            ),
            rule("^gpt-4", Service::OpenAi, ModelFamily::Gpt4, 8_192),
            rule("^gpt-3\\.5", Service::OpenAi, ModelFamily::Turbo, 16_385),
            // Anthropic
            rule(
                "^claude-3-opus|^claude-opus",
                Service::Anthropic,
                ModelFamily::ClaudeOpus,
                200_000,
            ),
            rule(
                "^claude-",
                Service::Anthropic,
                ModelFamily::Claude,
                200_000,
            ),
            // Google AI
            rule(
                "^gemini-.*-flash|^gemini-flash",
                Service::GoogleAi,
                ModelFamily::GeminiFlash,
                1_048_576,
            ),
            rule(
                "^gemini-",
                Service::GoogleAi,
                ModelFamily::GeminiPro,
                2_097_152,
            ),
            // Mistral
            rule(
                "^mistral-large|^mistral-medium",
                Service::MistralAi,
                ModelFamily::MistralLarge,
                128_000,
            ),
            rule(
                "^mistral-|^ministral-|^open-mistral|^open-mixtral|^codestral",
                Service::MistralAi,
                ModelFamily::MistralSmall,
                32_000,
            ),
            // AWS Bedrock (Anthropic model ids, optionally region-prefixed)
            rule(
                "^(us\\.|eu\\.|apac\\.)?anthropic\\.claude-3-opus|^(us\\.|eu\\.|apac\\.)?anthropic\\.claude-opus",
                Service::Aws,
                ModelFamily::AwsClaudeOpus,
                200_000,
            ),
            rule(
                "^(us\\.|eu\\.|apac\\.)?anthropic\\.claude",
                Service::Aws,
                ModelFamily::AwsClaude,
                200_000,
            ),
            // GCP Vertex (dated Anthropic ids with @ suffix)
            rule(
                "^claude-.*@\\d{8}$",
                Service::Gcp,
                ModelFamily::GcpClaude,
                200_000,
            ),
            // Azure deployments reuse OpenAI ids
            rule("^azure-gpt", Service::Azure, ModelFamily::AzureGpt4o, 128_000),
            // Deepseek
            rule(
                "^deepseek-",
                Service::Deepseek,
                ModelFamily::Deepseek,
                64_000,
            ),
            // xAI
            rule("^grok-", Service::Xai, ModelFamily::Grok, 131_072),
            // Cohere
            rule("^command-", Service::Cohere, ModelFamily::CommandR, 128_000),
            // Qwen
            rule("^qwen", Service::Qwen, ModelFamily::Qwen, 131_072),
            // Moonshot
            rule(
                "^moonshot-|^kimi-",
                Service::Moonshot,
                ModelFamily::Moonshot,
                128_000,
            ),
        ];
        Self { rules }
    }

    /// Resolve a model id to its service and family. A service hint scopes
    /// matching to that service's rules first, so `claude-3-5-sonnet` routed
    /// through `/aws` lands in the aws-claude family rather than claude.
    pub fn resolve(&self, model: &str, service: Option<Service>) -> Option<(Service, ModelFamily)> {
        let model = model.strip_prefix("models/").unwrap_or(model);
        if let Some(service) = service {
            if let Some(found) = self.resolve_scoped(model, service) {
                return Some((service, found));
            }
            // The service owns the route; fall back to its default family.
            return Some((service, default_family(service)));
        }
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(model))
            .map(|rule| (rule.service, rule.family))
    }

    fn resolve_scoped(&self, model: &str, service: Service) -> Option<ModelFamily> {
        self.rules
            .iter()
            .filter(|rule| rule.service == service)
            .find(|rule| rule.pattern.is_match(model))
            .map(|rule| rule.family)
            .or_else(|| match service {
                // Bedrock and Vertex accept bare Anthropic ids too.
                Service::Aws | Service::Gcp => self
                    .rules
                    .iter()
                    .filter(|rule| rule.service == Service::Anthropic)
                    .find(|rule| rule.pattern.is_match(model))
                    .map(|rule| match (service, rule.family) {
                        (Service::Aws, ModelFamily::ClaudeOpus) => ModelFamily::AwsClaudeOpus,
                        (Service::Aws, _) => ModelFamily::AwsClaude,
                        (_, _) => ModelFamily::GcpClaude,
                    }),
                // Azure deployments are addressed by OpenAI model ids.
                Service::Azure => self
                    .rules
                    .iter()
                    .filter(|rule| rule.service == Service::OpenAi)
                    .find(|rule| rule.pattern.is_match(model))
                    .map(|_| ModelFamily::AzureGpt4o),
                _ => None,
            })
    }

    /// Per-model context window, from the same rule table.
    pub fn context_window(&self, model: &str, service: Option<Service>) -> u64 {
        let model = model.strip_prefix("models/").unwrap_or(model);
        let scoped = service.and_then(|service| {
            self.rules
                .iter()
                .filter(|rule| rule.service == service)
                .find(|rule| rule.pattern.is_match(model))
        });
        scoped
            .or_else(|| self.rules.iter().find(|rule| rule.pattern.is_match(model)))
            .map(|rule| rule.context_window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

const DEFAULT_CONTEXT_WINDOW: u64 = 16_385;

fn default_family(service: Service) -> ModelFamily {
    match service {
        Service::OpenAi => ModelFamily::Turbo,
        Service::Anthropic => ModelFamily::Claude,
        Service::GoogleAi => ModelFamily::GeminiPro,
        Service::MistralAi => ModelFamily::MistralSmall,
        Service::Aws => ModelFamily::AwsClaude,
        Service::Gcp => ModelFamily::GcpClaude,
        Service::Azure => ModelFamily::AzureGpt4o,
        Service::Deepseek => ModelFamily::Deepseek,
        Service::Xai => ModelFamily::Grok,
        Service::Cohere => ModelFamily::CommandR,
        Service::Qwen => ModelFamily::Qwen,
        Service::Moonshot => ModelFamily::Moonshot,
    }
}

/// Normalize loose client-side model names to canonical provider ids.
/// Deterministic and purely a function of the input string.
pub fn maybe_reassign_model(service: Service, model: &str) -> String {
    let model = model.strip_prefix("models/").unwrap_or(model);
    match service {
        Service::Anthropic | Service::Aws | Service::Gcp => {
            let canonical = match model {
                "claude-3-5-sonnet-latest" => "claude-3-5-sonnet-20241022",
                "claude-3-5-haiku-latest" => "claude-3-5-haiku-20241022",
                "claude-3-opus-latest" => "claude-3-opus-20240229",
                "claude-3.5-sonnet" => "claude-3-5-sonnet-20241022",
                other => other,
            };
            canonical.to_string()
        }
        Service::GoogleAi => {
            let canonical = match model {
                "gemini-pro" => "gemini-1.5-pro",
                "gemini-flash" => "gemini-1.5-flash",
                other => other,
            };
            canonical.to_string()
        }
        _ => model.to_string(),
    }
}

/// USD per million tokens, used only for the info endpoint's cost readout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyCost {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl FamilyCost {
    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

pub fn family_cost(family: ModelFamily) -> FamilyCost {
    let (input_per_mtok, output_per_mtok) = match family {
        ModelFamily::Turbo => (0.5, 1.5),
        ModelFamily::Gpt4 => (30.0, 60.0),
        ModelFamily::Gpt4Turbo => (10.0, 30.0),
        ModelFamily::Gpt4o | ModelFamily::AzureGpt4o => (2.5, 10.0),
        ModelFamily::O1 => (15.0, 60.0),
        ModelFamily::Claude | ModelFamily::AwsClaude | ModelFamily::GcpClaude => (3.0, 15.0),
        ModelFamily::ClaudeOpus | ModelFamily::AwsClaudeOpus => (15.0, 75.0),
        ModelFamily::GeminiFlash => (0.075, 0.3),
        ModelFamily::GeminiPro => (1.25, 5.0),
        ModelFamily::MistralSmall => (0.2, 0.6),
        ModelFamily::MistralLarge => (2.0, 6.0),
        ModelFamily::Deepseek => (0.27, 1.1),
        ModelFamily::Grok => (2.0, 10.0),
        ModelFamily::CommandR => (0.15, 0.6),
        ModelFamily::Qwen => (0.4, 1.2),
        ModelFamily::Moonshot => (0.8, 2.4),
    };
    FamilyCost {
        input_per_mtok,
        output_per_mtok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_by_first_match() {
        let registry = ModelRegistry::shared();
        assert_eq!(
            registry.resolve("gpt-4o-2024-08-06", None),
            Some((Service::OpenAi, ModelFamily::Gpt4o))
        );
        assert_eq!(
            registry.resolve("gpt-4-0613", None),
            Some((Service::OpenAi, ModelFamily::Gpt4))
        );
        assert_eq!(
            registry.resolve("claude-3-opus-20240229", None),
            Some((Service::Anthropic, ModelFamily::ClaudeOpus))
        );
    }

    #[test]
    fn service_hint_scopes_families() {
        let registry = ModelRegistry::shared();
        assert_eq!(
            registry.resolve("claude-3-5-sonnet-20241022", Some(Service::Aws)),
            Some((Service::Aws, ModelFamily::AwsClaude))
        );
        assert_eq!(
            registry.resolve("anthropic.claude-3-opus-20240229-v1:0", Some(Service::Aws)),
            Some((Service::Aws, ModelFamily::AwsClaudeOpus))
        );
        assert_eq!(
            registry.resolve("claude-3-5-sonnet@20241022", Some(Service::Gcp)),
            Some((Service::Gcp, ModelFamily::GcpClaude))
        );
    }

    #[test]
    fn unknown_model_gets_service_default() {
        let registry = ModelRegistry::shared();
        assert_eq!(
            registry.resolve("totally-new-model", Some(Service::OpenAi)),
            Some((Service::OpenAi, ModelFamily::Turbo))
        );
        assert_eq!(registry.resolve("totally-new-model", None), None);
    }

    #[test]
    fn models_prefix_is_stripped() {
        let registry = ModelRegistry::shared();
        assert_eq!(
            registry.resolve("models/gemini-1.5-flash", None),
            Some((Service::GoogleAi, ModelFamily::GeminiFlash))
        );
    }

    #[test]
    fn reassignment_is_deterministic() {
        let a = maybe_reassign_model(Service::Anthropic, "claude-3-5-sonnet-latest");
        let b = maybe_reassign_model(Service::Anthropic, "claude-3-5-sonnet-latest");
        assert_eq!(a, b);
        assert_eq!(a, "claude-3-5-sonnet-20241022");
        assert_eq!(
            maybe_reassign_model(Service::GoogleAi, "models/gemini-pro"),
            "gemini-1.5-pro"
        );
    }

    #[test]
    fn context_windows() {
        let registry = ModelRegistry::shared();
        assert_eq!(registry.context_window("gpt-4-0613", None), 8_192);
        assert_eq!(
            registry.context_window("claude-3-5-sonnet-20241022", None),
            200_000
        );
        assert_eq!(registry.context_window("mystery", None), 16_385);
    }
}
