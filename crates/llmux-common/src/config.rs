use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ModelFamily, Service};

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. Assembled by the binary's cli module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Proxy-wide context cap for OpenAI-dialect services.
    pub max_context_tokens_openai: u64,
    /// Proxy-wide context cap for Anthropic-dialect services.
    pub max_context_tokens_anthropic: u64,
    /// When set, only these families are visible and dispatchable.
    pub allowed_model_families: Option<Vec<ModelFamily>>,
    /// Enable the periodic credential recheckers.
    pub check_keys: bool,
    /// Dispatch to AWS keys whose logging posture is unconfirmed.
    pub allow_aws_logging: bool,
    pub geoblock_enabled: bool,
    pub geoblock_allowed_countries: Vec<String>,
    /// Re-enqueue budget per request.
    pub max_retries: u32,
    /// End-to-end request deadline.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Per-service upstream base-URL overrides; unset services use the
    /// canonical provider endpoints.
    pub base_urls: Vec<(Service, String)>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            max_context_tokens_openai: 128_000,
            max_context_tokens_anthropic: 200_000,
            allowed_model_families: None,
            check_keys: false,
            allow_aws_logging: false,
            geoblock_enabled: false,
            geoblock_allowed_countries: Vec::new(),
            max_retries: 3,
            request_timeout: Duration::from_secs(600),
            base_urls: Vec::new(),
        }
    }
}

impl GlobalConfig {
    pub fn base_url_for(&self, service: Service) -> Option<&str> {
        self.base_urls
            .iter()
            .find(|(configured, _)| *configured == service)
            .map(|(_, url)| url.trim_end_matches('/'))
    }

    pub fn family_allowed(&self, family: ModelFamily) -> bool {
        match &self.allowed_model_families {
            Some(allowed) => allowed.contains(&family),
            None => true,
        }
    }

    /// Deployment-wide prompt+output cap for the given dialect lineage.
    pub fn proxy_max_tokens(&self, anthropic_dialect: bool) -> u64 {
        if anthropic_dialect {
            self.max_context_tokens_anthropic
        } else {
            self.max_context_tokens_openai
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
