use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value as JsonValue;
use wreq::Method;

use llmux_common::{ProxyError, Service};
use llmux_keypool::{KeyExtra, KeyRecord, KeySecret};

use crate::upstream::{Headers, UpstreamBody, UpstreamClient, UpstreamHttpRequest};

/// Revertable log of per-attempt mutations. The pristine body is captured
/// once at preprocess; `revert` restores it before a re-enqueue so signing
/// and path rewriting never accumulate across attempts.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    pristine: Bytes,
    entries: Vec<&'static str>,
}

impl ChangeLog {
    pub fn new(pristine: Bytes) -> Self {
        Self {
            pristine,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, label: &'static str) {
        self.entries.push(label);
    }

    pub fn entries(&self) -> &[&'static str] {
        &self.entries
    }

    pub fn revert(&mut self) -> Bytes {
        self.entries.clear();
        self.pristine.clone()
    }
}

/// What the signer chain needs to finalize one attempt.
pub struct SignInput<'a> {
    pub service: Service,
    pub model: &'a str,
    pub is_streaming: bool,
    pub body: Bytes,
    pub base_url_override: Option<&'a str>,
}

/// Produce the finalized upstream request for the attempt: URL, auth
/// headers, and any provider-mandated body rewrites, each recorded in the
/// change log.
pub async fn sign_request(
    input: SignInput<'_>,
    key: &KeyRecord,
    changes: &mut ChangeLog,
    client: &dyn UpstreamClient,
) -> Result<UpstreamHttpRequest, ProxyError> {
    let mut headers: Headers = vec![("content-type".to_string(), "application/json".to_string())];
    let mut body = input.body;
    let base = input
        .base_url_override
        .map(str::to_string)
        .unwrap_or_else(|| default_base_url(input.service, key));

    let url = match input.service {
        Service::OpenAi
        | Service::MistralAi
        | Service::Deepseek
        | Service::Xai
        | Service::Cohere
        | Service::Qwen
        | Service::Moonshot => {
            add_bearer(&mut headers, key)?;
            changes.record("auth:bearer");
            format!("{base}/v1/chat/completions")
        }
        Service::Anthropic => {
            let api_key = bearer_secret(key)?;
            headers.push(("x-api-key".to_string(), api_key.to_string()));
            headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
            changes.record("auth:x-api-key");
            format!("{base}/v1/messages")
        }
        Service::GoogleAi => {
            let api_key = bearer_secret(key)?;
            changes.record("auth:query-key");
            let action = if input.is_streaming {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            let stream_suffix = if input.is_streaming { "&alt=sse" } else { "" };
            format!(
                "{base}/v1beta/models/{model}:{action}?key={api_key}{stream_suffix}",
                model = input.model
            )
        }
        Service::Azure => {
            let KeySecret::Azure {
                resource_name,
                deployment_id,
                api_key,
            } = &key.secret
            else {
                return Err(ProxyError::InternalError(
                    "azure key has wrong secret shape".to_string(),
                ));
            };
            headers.push(("api-key".to_string(), api_key.clone()));
            changes.record("auth:api-key");
            changes.record("path:azure-deployment");
            format!(
                "https://{resource_name}.openai.azure.com/openai/deployments/{deployment_id}/chat/completions?api-version=2024-06-01"
            )
        }
        Service::Aws => {
            body = bedrock_body(body, changes)?;
            let action = if input.is_streaming {
                "invoke-with-response-stream"
            } else {
                "invoke"
            };
            let url = format!("{base}/model/{model}/{action}", model = input.model);
            sign_aws(&url, &mut headers, &body, key, changes)?;
            url
        }
        Service::Gcp => {
            body = vertex_body(body, changes)?;
            let KeyExtra::Gcp { region, project } = &key.extra else {
                return Err(ProxyError::InternalError(
                    "gcp key has wrong extra shape".to_string(),
                ));
            };
            let token = gcp_access_token(key, client).await?;
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
            changes.record("auth:gcp-oauth");
            let action = if input.is_streaming {
                "streamRawPredict"
            } else {
                "rawPredict"
            };
            format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/anthropic/models/{model}:{action}",
                model = input.model
            )
        }
    };

    Ok(UpstreamHttpRequest {
        method: Method::POST,
        url,
        headers,
        body: Some(body),
        is_stream: input.is_streaming,
    })
}

fn bearer_secret(key: &KeyRecord) -> Result<&str, ProxyError> {
    match &key.secret {
        KeySecret::Bearer { api_key } => Ok(api_key.as_str()),
        _ => Err(ProxyError::InternalError(
            "expected bearer credential".to_string(),
        )),
    }
}

fn add_bearer(headers: &mut Headers, key: &KeyRecord) -> Result<(), ProxyError> {
    let api_key = bearer_secret(key)?;
    headers.push(("authorization".to_string(), format!("Bearer {api_key}")));
    Ok(())
}

pub fn default_base_url(service: Service, key: &KeyRecord) -> String {
    match service {
        Service::OpenAi => "https://api.openai.com".to_string(),
        Service::Anthropic => "https://api.anthropic.com".to_string(),
        Service::GoogleAi => "https://generativelanguage.googleapis.com".to_string(),
        Service::MistralAi => "https://api.mistral.ai".to_string(),
        Service::Aws => match &key.secret {
            KeySecret::Aws { region, .. } => {
                format!("https://bedrock-runtime.{region}.amazonaws.com")
            }
            _ => "https://bedrock-runtime.us-east-1.amazonaws.com".to_string(),
        },
        // GCP and Azure URLs are fully derived from the key.
        Service::Gcp | Service::Azure => String::new(),
        Service::Deepseek => "https://api.deepseek.com".to_string(),
        Service::Xai => "https://api.x.ai".to_string(),
        Service::Cohere => "https://api.cohere.ai/compatibility".to_string(),
        Service::Qwen => "https://dashscope.aliyuncs.com/compatible-mode".to_string(),
        Service::Moonshot => "https://api.moonshot.ai".to_string(),
    }
}

/// Bedrock takes the Anthropic body with an `anthropic_version` pin and no
/// `model`/`stream` members (both travel in the URL).
fn bedrock_body(body: Bytes, changes: &mut ChangeLog) -> Result<Bytes, ProxyError> {
    let mut value: JsonValue = serde_json::from_slice(&body)
        .map_err(|err| ProxyError::InternalError(format!("signed body not json: {err}")))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("model");
        map.remove("stream");
        map.insert(
            "anthropic_version".to_string(),
            JsonValue::String("bedrock-2023-05-31".to_string()),
        );
    }
    changes.record("body:bedrock-envelope");
    Ok(Bytes::from(serde_json::to_vec(&value).map_err(|err| {
        ProxyError::InternalError(err.to_string())
    })?))
}

/// Vertex is the same envelope with its own version pin.
fn vertex_body(body: Bytes, changes: &mut ChangeLog) -> Result<Bytes, ProxyError> {
    let mut value: JsonValue = serde_json::from_slice(&body)
        .map_err(|err| ProxyError::InternalError(format!("signed body not json: {err}")))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("model");
        map.insert(
            "anthropic_version".to_string(),
            JsonValue::String("vertex-2023-10-16".to_string()),
        );
    }
    changes.record("body:vertex-envelope");
    Ok(Bytes::from(serde_json::to_vec(&value).map_err(|err| {
        ProxyError::InternalError(err.to_string())
    })?))
}

fn sign_aws(
    url: &str,
    headers: &mut Headers,
    body: &Bytes,
    key: &KeyRecord,
    changes: &mut ChangeLog,
) -> Result<(), ProxyError> {
    use aws_credential_types::Credentials;
    use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
    use aws_sigv4::sign::v4::SigningParams;

    let KeySecret::Aws {
        access_key_id,
        secret_access_key,
        region,
    } = &key.secret
    else {
        return Err(ProxyError::InternalError(
            "aws key has wrong secret shape".to_string(),
        ));
    };

    let identity =
        Credentials::new(access_key_id, secret_access_key, None, None, "llmux").into();
    let signing_params = SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("bedrock")
        .time(SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|err| ProxyError::InternalError(format!("sigv4 params: {err}")))?
        .into();

    let signable = SignableRequest::new(
        "POST",
        url,
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
        SignableBody::Bytes(body),
    )
    .map_err(|err| ProxyError::InternalError(format!("sigv4 request: {err}")))?;

    let (instructions, _signature) = sign(signable, &signing_params)
        .map_err(|err| ProxyError::InternalError(format!("sigv4 sign: {err}")))?
        .into_parts();

    let mut request = http::Request::builder()
        .method("POST")
        .uri(url)
        .body(())
        .map_err(|err| ProxyError::InternalError(err.to_string()))?;
    instructions.apply_to_request_http1x(&mut request);
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.push((name.as_str().to_string(), value.to_string()));
        }
    }
    changes.record("auth:sigv4");
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct GcpJwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, serde::Deserialize)]
struct GcpTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

const GCP_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const GCP_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Service-account JWT exchange, with a per-email cache so a busy key does
/// not mint a token per request.
async fn gcp_access_token(
    key: &KeyRecord,
    client: &dyn UpstreamClient,
) -> Result<String, ProxyError> {
    let KeySecret::GcpServiceAccount {
        client_email,
        private_key,
        ..
    } = &key.secret
    else {
        return Err(ProxyError::InternalError(
            "gcp key has wrong secret shape".to_string(),
        ));
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| ProxyError::InternalError(err.to_string()))?
        .as_secs() as i64;

    static CACHE: OnceLock<Mutex<HashMap<String, (String, i64)>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    {
        let guard = cache
            .lock()
            .map_err(|_| ProxyError::InternalError("token cache lock failed".to_string()))?;
        if let Some((token, expires_at)) = guard.get(client_email)
            && now + 60 < *expires_at
        {
            return Ok(token.clone());
        }
    }

    let expires_at = now + 3600;
    let claims = GcpJwtClaims {
        iss: client_email,
        scope: GCP_SCOPE,
        aud: GCP_TOKEN_URI,
        exp: expires_at,
        iat: now,
    };
    let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())
        .map_err(|err| ProxyError::InternalError(format!("bad gcp private key: {err}")))?;
    let assertion = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &claims,
        &encoding_key,
    )
    .map_err(|err| ProxyError::InternalError(format!("jwt encode: {err}")))?;

    let form = format!(
        "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion={assertion}"
    );
    let response = client
        .send(UpstreamHttpRequest {
            method: Method::POST,
            url: GCP_TOKEN_URI.to_string(),
            headers: vec![(
                "content-type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(Bytes::from(form)),
            is_stream: false,
        })
        .await
        .map_err(|_| ProxyError::UpstreamUnavailable("gcp token exchange failed".to_string()))?;

    let UpstreamBody::Bytes(body) = response.body else {
        return Err(ProxyError::InternalError(
            "gcp token exchange returned a stream".to_string(),
        ));
    };
    let token: GcpTokenResponse = serde_json::from_slice(&body)
        .map_err(|err| ProxyError::InternalError(format!("gcp token body: {err}")))?;
    let expires_at = now + token.expires_in.unwrap_or(3600);

    let mut guard = cache
        .lock()
        .map_err(|_| ProxyError::InternalError("token cache lock failed".to_string()))?;
    guard.insert(
        client_email.clone(),
        (token.access_token.clone(), expires_at),
    );
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_log_revert_restores_pristine_body() {
        let mut changes = ChangeLog::new(Bytes::from_static(b"{\"a\":1}"));
        changes.record("auth:bearer");
        changes.record("body:bedrock-envelope");
        assert_eq!(changes.entries().len(), 2);
        let body = changes.revert();
        assert_eq!(&body[..], b"{\"a\":1}");
        assert!(changes.entries().is_empty());
    }

    #[test]
    fn bedrock_body_strips_routing_fields() {
        let mut changes = ChangeLog::new(Bytes::new());
        let body = Bytes::from_static(
            b"{\"model\":\"claude-3\",\"stream\":true,\"max_tokens\":64,\"messages\":[]}",
        );
        let out = bedrock_body(body, &mut changes).unwrap();
        let value: JsonValue = serde_json::from_slice(&out).unwrap();
        assert!(value.get("model").is_none());
        assert!(value.get("stream").is_none());
        assert_eq!(value["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(value["max_tokens"], 64);
    }
}
