use llmux_common::{GlobalConfig, ModelFamily, Service};
use llmux_protocol::openai::ModelList;

/// Canonical model ids advertised per family. The list endpoint is advisory;
/// admission goes through the model registry, not this table.
fn family_models(family: ModelFamily) -> &'static [&'static str] {
    match family {
        ModelFamily::Turbo => &["gpt-3.5-turbo", "gpt-3.5-turbo-1106"],
        ModelFamily::Gpt4 => &["gpt-4", "gpt-4-0613"],
        ModelFamily::Gpt4Turbo => &["gpt-4-turbo", "gpt-4-turbo-2024-04-09"],
        ModelFamily::Gpt4o => &["gpt-4o", "gpt-4o-2024-08-06", "gpt-4o-mini"],
        ModelFamily::O1 => &["o1", "o1-mini"],
        ModelFamily::Claude => &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
        ],
        ModelFamily::ClaudeOpus => &["claude-3-opus-20240229"],
        ModelFamily::GeminiFlash => &["gemini-1.5-flash", "gemini-2.0-flash"],
        ModelFamily::GeminiPro => &["gemini-1.5-pro"],
        ModelFamily::MistralSmall => &["mistral-small-latest", "open-mistral-nemo"],
        ModelFamily::MistralLarge => &["mistral-large-latest"],
        ModelFamily::AwsClaude => &["anthropic.claude-3-5-sonnet-20241022-v2:0"],
        ModelFamily::AwsClaudeOpus => &["anthropic.claude-3-opus-20240229-v1:0"],
        ModelFamily::GcpClaude => &["claude-3-5-sonnet@20241022"],
        ModelFamily::AzureGpt4o => &["gpt-4o"],
        ModelFamily::Deepseek => &["deepseek-chat", "deepseek-reasoner"],
        ModelFamily::Grok => &["grok-2-latest", "grok-beta"],
        ModelFamily::CommandR => &["command-r-plus", "command-r"],
        ModelFamily::Qwen => &["qwen-max", "qwen3-32b"],
        ModelFamily::Moonshot => &["moonshot-v1-128k", "kimi-latest"],
    }
}

/// OpenAI-dialect model list for one service, filtered by the deployment's
/// allowed families.
pub fn visible_models(service: Service, config: &GlobalConfig) -> ModelList {
    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    let ids = service_families(service)
        .into_iter()
        .filter(|family| config.family_allowed(*family))
        .flat_map(|family| family_models(family).iter().map(|id| id.to_string()))
        .collect::<Vec<_>>();
    ModelList::new(ids, service.as_str(), created)
}

fn service_families(service: Service) -> Vec<ModelFamily> {
    ModelFamily::ALL
        .into_iter()
        .filter(|family| service_of(*family) == service)
        .collect()
}

fn service_of(family: ModelFamily) -> Service {
    match family {
        ModelFamily::Turbo
        | ModelFamily::Gpt4
        | ModelFamily::Gpt4Turbo
        | ModelFamily::Gpt4o
        | ModelFamily::O1 => Service::OpenAi,
        ModelFamily::Claude | ModelFamily::ClaudeOpus => Service::Anthropic,
        ModelFamily::GeminiFlash | ModelFamily::GeminiPro => Service::GoogleAi,
        ModelFamily::MistralSmall | ModelFamily::MistralLarge => Service::MistralAi,
        ModelFamily::AwsClaude | ModelFamily::AwsClaudeOpus => Service::Aws,
        ModelFamily::GcpClaude => Service::Gcp,
        ModelFamily::AzureGpt4o => Service::Azure,
        ModelFamily::Deepseek => Service::Deepseek,
        ModelFamily::Grok => Service::Xai,
        ModelFamily::CommandR => Service::Cohere,
        ModelFamily::Qwen => Service::Qwen,
        ModelFamily::Moonshot => Service::Moonshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_families_filter_the_listing() {
        let mut config = GlobalConfig::default();
        let all = visible_models(Service::OpenAi, &config);
        assert!(all.data.iter().any(|entry| entry.id == "gpt-4o"));

        config.allowed_model_families = Some(vec![ModelFamily::Turbo]);
        let filtered = visible_models(Service::OpenAi, &config);
        assert!(filtered.data.iter().all(|entry| entry.id.starts_with("gpt-3.5")));
        assert!(!filtered.data.is_empty());
    }

    #[test]
    fn every_family_belongs_to_its_service() {
        for family in ModelFamily::ALL {
            let service = service_of(family);
            assert!(service_families(service).contains(&family));
        }
    }
}
