use bytes::Bytes;
use serde_json::Value as JsonValue;

use llmux_common::{Dialect, GlobalConfig, ModelFamily, ModelRegistry, ProxyError, Service,
    maybe_reassign_model};
use llmux_translate::request::{RequestBody, translate_request};
use llmux_translate::response::ResponseMeta;
use llmux_translate::tokens::count_prompt_tokens;

/// Everything the pipeline needs about one request after preprocess. The
/// `body` is the translated, serialized upstream body in its pristine form;
/// per-attempt mutations run on copies tracked by the change log.
#[derive(Debug)]
pub struct PreparedRequest {
    pub request_id: String,
    pub service: Service,
    pub family: ModelFamily,
    pub model: String,
    pub in_dialect: Dialect,
    pub out_dialect: Dialect,
    pub body: Bytes,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub is_streaming: bool,
}

impl PreparedRequest {
    pub fn response_meta(&self) -> ResponseMeta {
        ResponseMeta {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            created: now_unix(),
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Output budget when the client does not state one.
fn default_output_tokens(family: ModelFamily) -> u64 {
    match family {
        ModelFamily::O1 => 32_768,
        ModelFamily::Claude
        | ModelFamily::ClaudeOpus
        | ModelFamily::AwsClaude
        | ModelFamily::AwsClaudeOpus
        | ModelFamily::GcpClaude => 8_192,
        _ => 4_096,
    }
}

pub struct InboundParts {
    pub service: Service,
    pub dialect: Dialect,
    pub body: Bytes,
    /// Google carries the model in the URL path.
    pub model_from_path: Option<String>,
    /// Set for `:streamGenerateContent`.
    pub stream_hint: bool,
}

/// Stages 1-2 of the pipeline: parse, normalize the model, translate to the
/// upstream dialect, apply service tweaks, count tokens, validate context.
pub fn preprocess(
    config: &GlobalConfig,
    inbound: InboundParts,
) -> Result<PreparedRequest, ProxyError> {
    let mut parsed = RequestBody::parse(inbound.dialect, &inbound.body)
        .map_err(|err| ProxyError::BadRequest(err.to_string()))?;

    let raw_model = inbound
        .model_from_path
        .clone()
        .unwrap_or_else(|| parsed.model().to_string());
    if raw_model.is_empty() {
        return Err(ProxyError::BadRequest("missing model".to_string()));
    }
    let model = maybe_reassign_model(inbound.service, &raw_model);
    parsed.set_model(&model);

    let registry = ModelRegistry::shared();
    let (service, family) = registry
        .resolve(&model, Some(inbound.service))
        .ok_or_else(|| ProxyError::BadRequest(format!("unknown model {model}")))?;
    if !config.family_allowed(family) {
        return Err(ProxyError::BadRequest(format!(
            "model family {family} is not served here"
        )));
    }

    let is_streaming = inbound.stream_hint || parsed.is_streaming();
    let requested_output = parsed.output_tokens();

    let out_dialect = service.native_dialect();
    let mut translated = translate_request(parsed, out_dialect).map_err(|err| match err {
        err @ llmux_translate::TranslateError::Schema(_) => ProxyError::BadRequest(err.to_string()),
        err => ProxyError::InternalError(err.to_string()),
    })?;
    apply_service_tweaks(service, &model, &mut translated);

    let prompt_tokens = count_prompt_tokens(&translated);
    let output_tokens = requested_output.unwrap_or_else(|| default_output_tokens(family));

    let model_max = registry.context_window(&model, Some(service));
    let proxy_max = config.proxy_max_tokens(out_dialect == Dialect::AnthropicMessages);
    let limit = model_max.min(proxy_max);
    if prompt_tokens + output_tokens > limit {
        return Err(ProxyError::ContextTooLarge(format!(
            "prompt ({prompt_tokens}) + max output ({output_tokens}) exceeds the {limit}-token limit"
        )));
    }

    let body = Bytes::from(
        translated
            .to_bytes()
            .map_err(|err| ProxyError::InternalError(err.to_string()))?,
    );

    Ok(PreparedRequest {
        request_id: uuid::Uuid::new_v4().simple().to_string(),
        service,
        family,
        model,
        in_dialect: inbound.dialect,
        out_dialect,
        body,
        prompt_tokens,
        output_tokens,
        is_streaming,
    })
}

/// Provider quirks applied after translation, before token counting.
fn apply_service_tweaks(service: Service, model: &str, body: &mut RequestBody) {
    match (service, body) {
        // Qwen3 models think by default; the toggle must be explicit.
        (Service::Qwen, RequestBody::OpenAi(req)) => {
            req.extra.insert(
                "enable_thinking".to_string(),
                JsonValue::Bool(model.contains("thinking")),
            );
        }
        _ => {}
    }
}
