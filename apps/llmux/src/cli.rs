use clap::Parser;

use llmux_common::{GlobalConfig, ModelFamily, Service};

/// Multi-provider LLM reverse-proxy gateway.
///
/// Every flag is also an environment variable; flags win when both are set.
/// Credentials are environment-only (`OPENAI_KEY`, `ANTHROPIC_KEY`, ...,
/// comma separated; AWS and GCP use `AWS_CREDENTIALS` / `GCP_CREDENTIALS`).
#[derive(Debug, Parser)]
#[command(name = "llmux", version)]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 7860)]
    pub port: u16,

    #[arg(long, env = "MAX_CONTEXT_TOKENS_OPENAI", default_value_t = 128_000)]
    pub max_context_tokens_openai: u64,

    #[arg(long, env = "MAX_CONTEXT_TOKENS_ANTHROPIC", default_value_t = 200_000)]
    pub max_context_tokens_anthropic: u64,

    /// Comma-separated family tags; unset serves everything.
    #[arg(long, env = "ALLOWED_MODEL_FAMILIES", value_delimiter = ',')]
    pub allowed_model_families: Option<Vec<String>>,

    #[arg(long, env = "CHECK_KEYS", default_value_t = false)]
    pub check_keys: bool,

    #[arg(long, env = "ALLOW_AWS_LOGGING", default_value_t = false)]
    pub allow_aws_logging: bool,

    #[arg(long, env = "GEOBLOCK_ENABLED", default_value_t = false)]
    pub geoblock_enabled: bool,

    #[arg(long, env = "GEOBLOCK_ALLOWED_COUNTRIES", value_delimiter = ',')]
    pub geoblock_allowed_countries: Option<Vec<String>>,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    pub request_timeout_secs: u64,
}

impl Cli {
    pub fn into_config(self) -> anyhow::Result<GlobalConfig> {
        let allowed_model_families = match self.allowed_model_families {
            None => None,
            Some(raw) => {
                let mut families = Vec::new();
                for tag in raw {
                    let tag = tag.trim();
                    if tag.is_empty() {
                        continue;
                    }
                    let family = ModelFamily::parse(tag)
                        .ok_or_else(|| anyhow::anyhow!("unknown model family: {tag}"))?;
                    families.push(family);
                }
                (!families.is_empty()).then_some(families)
            }
        };

        let base_urls = Service::ALL
            .into_iter()
            .filter_map(|service| {
                let var = format!(
                    "{}_BASE_URL",
                    service.as_str().to_uppercase().replace('-', "_")
                );
                std::env::var(var).ok().map(|url| (service, url))
            })
            .collect();

        Ok(GlobalConfig {
            host: self.host,
            port: self.port,
            max_context_tokens_openai: self.max_context_tokens_openai,
            max_context_tokens_anthropic: self.max_context_tokens_anthropic,
            allowed_model_families,
            check_keys: self.check_keys,
            allow_aws_logging: self.allow_aws_logging,
            geoblock_enabled: self.geoblock_enabled,
            geoblock_allowed_countries: self.geoblock_allowed_countries.unwrap_or_default(),
            max_retries: self.max_retries,
            request_timeout: std::time::Duration::from_secs(self.request_timeout_secs),
            base_urls,
        })
    }
}

/// Read each service's credential list from its environment variable. GCP
/// service-account JSON contains commas, so it splits on `|` instead.
pub fn keys_from_env() -> Vec<(Service, Vec<String>)> {
    let mut configured = Vec::new();
    for service in Service::ALL {
        let Ok(raw) = std::env::var(service.key_env_var()) else {
            continue;
        };
        let separator = if service == Service::Gcp { '|' } else { ',' };
        let keys: Vec<String> = raw
            .split(separator)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        if !keys.is_empty() {
            configured.push((service, keys));
        }
    }
    configured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_filter_parses_or_rejects() {
        let cli = Cli::parse_from([
            "llmux",
            "--allowed-model-families",
            "claude,gpt4o",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(
            config.allowed_model_families,
            Some(vec![ModelFamily::Claude, ModelFamily::Gpt4o])
        );

        let cli = Cli::parse_from(["llmux", "--allowed-model-families", "gpt5000"]);
        assert!(cli.into_config().is_err());
    }
}
