use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use llmux_common::{ModelFamily, Service};

/// Per-family usage counters credited at postprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyUsage {
    pub input: u64,
    pub output: u64,
}

/// Credential material, per service shape. AWS and Azure keys are colon
/// packed in the environment; GCP keys are service-account JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySecret {
    Bearer {
        api_key: String,
    },
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
    Azure {
        resource_name: String,
        deployment_id: String,
        api_key: String,
    },
    GcpServiceAccount {
        project_id: String,
        client_email: String,
        private_key: String,
        region: String,
    },
}

impl KeySecret {
    /// Canonical bytes fed to the hash; never logged.
    fn hash_input(&self) -> String {
        match self {
            KeySecret::Bearer { api_key } => api_key.clone(),
            KeySecret::Aws {
                access_key_id,
                secret_access_key,
                region,
            } => format!("{access_key_id}:{secret_access_key}:{region}"),
            KeySecret::Azure {
                resource_name,
                deployment_id,
                api_key,
            } => format!("{resource_name}:{deployment_id}:{api_key}"),
            KeySecret::GcpServiceAccount {
                project_id,
                client_email,
                private_key,
                ..
            } => format!("{project_id}:{client_email}:{private_key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwsLoggingStatus {
    Unknown,
    Disabled,
    Enabled,
}

/// Service-specific key attributes, mutated by the error classifier and the
/// rechecker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyExtra {
    OpenAi {
        is_trial: bool,
        organization_id: Option<String>,
    },
    Anthropic {
        tier: Option<String>,
        is_pozzed: bool,
        allows_multimodality: bool,
        requires_preamble: bool,
    },
    Aws {
        model_ids: BTreeSet<String>,
        logging_status: AwsLoggingStatus,
    },
    GoogleAi {
        model_ids: BTreeSet<String>,
        over_quota_families: BTreeSet<ModelFamily>,
    },
    Gcp {
        region: String,
        project: String,
    },
    Plain,
}

impl KeyExtra {
    pub fn for_service(service: Service, secret: &KeySecret) -> Self {
        match service {
            Service::OpenAi => KeyExtra::OpenAi {
                is_trial: false,
                organization_id: None,
            },
            Service::Anthropic => KeyExtra::Anthropic {
                tier: None,
                is_pozzed: false,
                allows_multimodality: true,
                requires_preamble: false,
            },
            Service::Aws => KeyExtra::Aws {
                model_ids: BTreeSet::new(),
                logging_status: AwsLoggingStatus::Unknown,
            },
            Service::GoogleAi => KeyExtra::GoogleAi {
                model_ids: BTreeSet::new(),
                over_quota_families: BTreeSet::new(),
            },
            Service::Gcp => match secret {
                KeySecret::GcpServiceAccount {
                    project_id, region, ..
                } => KeyExtra::Gcp {
                    region: region.clone(),
                    project: project_id.clone(),
                },
                _ => KeyExtra::Plain,
            },
            _ => KeyExtra::Plain,
        }
    }
}

/// One pooled credential. Owned exclusively by its service pool; `get` and
/// `snapshot` hand out value copies.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub hash: String,
    pub service: Service,
    pub model_families: BTreeSet<ModelFamily>,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub is_over_quota: bool,
    pub prompt_count: u64,
    pub last_used: Option<Instant>,
    pub last_checked: Option<SystemTime>,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub token_usage: BTreeMap<ModelFamily, FamilyUsage>,
    pub secret: KeySecret,
    pub extra: KeyExtra,
}

impl KeyRecord {
    pub fn new(service: Service, secret: KeySecret) -> Self {
        let hash = hash_secret(&secret);
        let extra = KeyExtra::for_service(service, &secret);
        Self {
            hash,
            service,
            model_families: default_families(service),
            is_disabled: false,
            is_revoked: false,
            is_over_quota: false,
            prompt_count: 0,
            last_used: None,
            last_checked: None,
            rate_limited_at: None,
            rate_limited_until: None,
            token_usage: BTreeMap::new(),
            secret,
            extra,
        }
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        match self.rate_limited_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// A family the key currently serves. Google AI keys can lose a single
    /// family to quota exhaustion without losing the rest.
    pub fn serves_family(&self, family: ModelFamily) -> bool {
        if !self.model_families.contains(&family) {
            return false;
        }
        if let KeyExtra::GoogleAi {
            over_quota_families,
            ..
        } = &self.extra
        {
            return !over_quota_families.contains(&family);
        }
        true
    }

    pub fn eligible(&self, family: ModelFamily, now: Instant) -> bool {
        !self.is_disabled && !self.is_rate_limited(now) && self.serves_family(family)
    }
}

/// Derives the opaque external handle from the secret.
pub(crate) fn hash_secret(secret: &KeySecret) -> String {
    let digest = blake3::hash(secret.hash_input().as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Field-wise merge applied by `update`. Families only ever narrow here;
/// widening is the rechecker's privilege.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub remove_family: Option<ModelFamily>,
    pub add_over_quota_family: Option<ModelFamily>,
    pub remove_model_id: Option<String>,
    pub allows_multimodality: Option<bool>,
    pub requires_preamble: Option<bool>,
    pub is_pozzed: Option<bool>,
    pub tier: Option<String>,
    pub is_trial: Option<bool>,
    pub organization_id: Option<String>,
    pub aws_logging_status: Option<AwsLoggingStatus>,
    pub last_checked: Option<SystemTime>,
}

impl KeyPatch {
    pub fn apply(&self, record: &mut KeyRecord) {
        if let Some(family) = self.remove_family {
            record.model_families.remove(&family);
        }
        if let Some(checked) = self.last_checked {
            record.last_checked = Some(checked);
        }
        match &mut record.extra {
            KeyExtra::OpenAi {
                is_trial,
                organization_id,
            } => {
                if let Some(value) = self.is_trial {
                    *is_trial = value;
                }
                if let Some(value) = &self.organization_id {
                    *organization_id = Some(value.clone());
                }
            }
            KeyExtra::Anthropic {
                tier,
                is_pozzed,
                allows_multimodality,
                requires_preamble,
            } => {
                if let Some(value) = &self.tier {
                    *tier = Some(value.clone());
                }
                if let Some(value) = self.is_pozzed {
                    *is_pozzed = value;
                }
                if let Some(value) = self.allows_multimodality {
                    *allows_multimodality = value;
                }
                if let Some(value) = self.requires_preamble {
                    *requires_preamble = value;
                }
            }
            KeyExtra::Aws {
                model_ids,
                logging_status,
            } => {
                if let Some(id) = &self.remove_model_id {
                    model_ids.remove(id);
                }
                if let Some(value) = self.aws_logging_status {
                    *logging_status = value;
                }
            }
            KeyExtra::GoogleAi {
                model_ids,
                over_quota_families,
            } => {
                if let Some(id) = &self.remove_model_id {
                    model_ids.remove(id);
                }
                if let Some(family) = self.add_over_quota_family {
                    over_quota_families.insert(family);
                }
            }
            KeyExtra::Gcp { .. } | KeyExtra::Plain => {}
        }
    }
}

/// Families a fresh credential of this service is assumed to serve until an
/// upstream response narrows them.
pub fn default_families(service: Service) -> BTreeSet<ModelFamily> {
    let families: &[ModelFamily] = match service {
        Service::OpenAi => &[
            ModelFamily::Turbo,
            ModelFamily::Gpt4,
            ModelFamily::Gpt4Turbo,
            ModelFamily::Gpt4o,
            ModelFamily::O1,
        ],
        Service::Anthropic => &[ModelFamily::Claude, ModelFamily::ClaudeOpus],
        Service::GoogleAi => &[ModelFamily::GeminiFlash, ModelFamily::GeminiPro],
        Service::MistralAi => &[ModelFamily::MistralSmall, ModelFamily::MistralLarge],
        Service::Aws => &[ModelFamily::AwsClaude, ModelFamily::AwsClaudeOpus],
        Service::Gcp => &[ModelFamily::GcpClaude],
        Service::Azure => &[ModelFamily::AzureGpt4o],
        Service::Deepseek => &[ModelFamily::Deepseek],
        Service::Xai => &[ModelFamily::Grok],
        Service::Cohere => &[ModelFamily::CommandR],
        Service::Qwen => &[ModelFamily::Qwen],
        Service::Moonshot => &[ModelFamily::Moonshot],
    };
    families.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_opaque() {
        let secret = KeySecret::Bearer {
            api_key: "sk-test-12345".to_string(),
        };
        let a = hash_secret(&secret);
        let b = hash_secret(&secret);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(!a.contains("sk-test"));
    }

    #[test]
    fn patch_is_idempotent() {
        let mut record = KeyRecord::new(
            Service::Anthropic,
            KeySecret::Bearer {
                api_key: "sk-ant".to_string(),
            },
        );
        let patch = KeyPatch {
            requires_preamble: Some(true),
            remove_family: Some(ModelFamily::ClaudeOpus),
            ..Default::default()
        };
        patch.apply(&mut record);
        let once = record.clone();
        patch.apply(&mut record);
        assert_eq!(record.model_families, once.model_families);
        assert_eq!(record.extra, once.extra);
    }

    #[test]
    fn google_family_quota_is_per_family() {
        let mut record = KeyRecord::new(
            Service::GoogleAi,
            KeySecret::Bearer {
                api_key: "aiza-x".to_string(),
            },
        );
        KeyPatch {
            add_over_quota_family: Some(ModelFamily::GeminiPro),
            ..Default::default()
        }
        .apply(&mut record);
        assert!(!record.serves_family(ModelFamily::GeminiPro));
        assert!(record.serves_family(ModelFamily::GeminiFlash));
    }
}
