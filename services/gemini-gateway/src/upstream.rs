//! Gemini `generateContent` caller
//!
//! One call per dispatcher attempt: the credential goes into the
//! `x-goog-api-key` header, the caller's request JSON is forwarded with
//! output-modality defaults filled in for image and speech operations.

use key_pool::{Credential, OperationClass};
use provider::ProviderError;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::config::ModelsConfig;

/// Header carrying the API key on every upstream request.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Issues `generateContent` requests against the configured upstream.
#[derive(Clone)]
pub struct GeminiCaller {
    client: reqwest::Client,
    upstream_url: String,
    models: ModelsConfig,
}

impl GeminiCaller {
    pub fn new(client: reqwest::Client, upstream_url: &str, models: ModelsConfig) -> Self {
        Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            models,
        }
    }

    pub fn endpoint(&self, operation: OperationClass) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.upstream_url,
            self.models.model_for(operation)
        )
    }

    /// Run one attempt of `operation` with `credential`.
    #[instrument(skip_all, fields(operation = %operation, credential_index = credential.index()))]
    pub async fn call(
        &self,
        operation: OperationClass,
        credential: &Credential,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let mut body = body.clone();
        prepare_body(operation, &self.models, &mut body);

        let key = HeaderValue::from_str(credential.expose())
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid api key header: {e}")))?;

        let response = self
            .client
            .post(self.endpoint(operation))
            .header(API_KEY_HEADER, key)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            debug!(status = status.as_u16(), "upstream returned error status");
            return Err(ProviderError::from_response(status.as_u16(), &text));
        }

        parse_generate_response(&text)
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Validate a 2xx body: it must be JSON carrying at least one candidate.
pub fn parse_generate_response(text: &str) -> Result<Value, ProviderError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProviderError::InvalidResponse(format!("response is not JSON: {e}")))?;
    match value.get("candidates").and_then(Value::as_array) {
        Some(candidates) if !candidates.is_empty() => Ok(value),
        _ => {
            let reason = value
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .map(|r| format!("response has no candidates (blocked: {r})"))
                .unwrap_or_else(|| "response has no candidates".to_string());
            Err(ProviderError::InvalidResponse(reason))
        }
    }
}

/// Fill in `generationConfig` defaults the operation needs, keeping any the
/// caller already set.
pub fn prepare_body(operation: OperationClass, models: &ModelsConfig, body: &mut Value) {
    let defaults = match operation {
        OperationClass::GenerateImage => json!({
            "responseModalities": ["TEXT", "IMAGE"],
        }),
        OperationClass::GenerateAudio => json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": models.voice },
                },
            },
        }),
        _ => return,
    };

    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let config = obj
        .entry("generationConfig")
        .or_insert_with(|| Value::Object(Default::default()));
    let (Some(config), Value::Object(defaults)) = (config.as_object_mut(), defaults) else {
        return;
    };
    for (key, value) in defaults {
        config.entry(key).or_insert(value);
    }
}
