//! Google Gemini adapter.
//!
//! Talks to the native `generateContent` endpoint first and falls back to
//! the OpenAI-compatible `chat/completions` shape when the native call
//! fails, which keeps third-party proxies that only speak the compat
//! protocol working. The two attempts are one logical call: the caller
//! sees a single success or a single failure.

use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};

use crate::error::GenError;
use crate::keypool::Credential;

use super::{
    build_data_url, classify_error_response, sniff_image_mime, validate_prompt,
    GenerationRequest, MediaKind, MediaPayload, ProviderId, ProviderOutput,
};

/// Default base URL for the Gemini API.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Default model for image generation.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp-image-generation";

/// Model family prefix that accepts imageSize/aspectRatio configuration.
const HIGH_RES_MODEL_PREFIX: &str = "gemini-3";

/// Settings for one Gemini adapter instance.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub base_url: String,
    pub model: String,
    /// "1K", "2K" or "4K"; only honoured by the gemini-3 family.
    pub image_size: String,
    pub aspect_ratio: String,
    pub request_timeout: Duration,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            base_url: GEMINI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            image_size: "1K".to_string(),
            aspect_ratio: "1:1".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct GeminiAdapter {
    settings: GeminiSettings,
    http_client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(settings: GeminiSettings) -> Result<Self, GenError> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(GenError::Http)?;
        Ok(Self {
            settings,
            http_client,
        })
    }

    fn model_for(&self, request: &GenerationRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone())
    }

    fn is_high_res_model(model: &str) -> bool {
        model.to_lowercase().contains(HIGH_RES_MODEL_PREFIX)
    }

    pub async fn generate_image(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<ProviderOutput, GenError> {
        validate_prompt(&request.prompt)?;

        let model = self.model_for(request);
        let size = request
            .resolution
            .as_deref()
            .map(|r| r.to_uppercase())
            .unwrap_or_else(|| self.settings.image_size.clone());

        // Only gemini-3 understands imageConfig; for older models the
        // aspect ratio rides along as a prompt suffix instead.
        let prompt = if !Self::is_high_res_model(&model) && !self.settings.aspect_ratio.is_empty()
        {
            format!(
                "{}\n\n[Output: {} aspect ratio image]",
                request.prompt, self.settings.aspect_ratio
            )
        } else {
            request.prompt.clone()
        };

        let data = match self
            .generate_native(&prompt, &model, &size, request, credential)
            .await
        {
            Ok(data) => data,
            Err(err) => {
                log::warn!("gemini native endpoint failed: {err}, trying compat endpoint");
                self.generate_compat(&prompt, &model, request, credential)
                    .await?
            }
        };

        let content_type = Some(sniff_image_mime(&data).to_string());
        Ok(ProviderOutput {
            payload: MediaPayload::Bytes { data, content_type },
            kind: MediaKind::Image,
            provider: ProviderId::Gemini,
            model,
        })
    }

    /// Native `generateContent` call, authenticated via `x-goog-api-key`.
    async fn generate_native(
        &self,
        prompt: &str,
        model: &str,
        size: &str,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<Vec<u8>, GenError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url, model
        );

        let mut parts = vec![json!({"text": prompt})];
        for image in &request.reference_images {
            parts.push(json!({
                "inlineData": {
                    "mimeType": sniff_image_mime(image),
                    "data": base64::engine::general_purpose::STANDARD.encode(image),
                }
            }));
        }

        let modalities = if request.reference_images.is_empty() {
            json!(["IMAGE"])
        } else {
            json!(["IMAGE", "TEXT"])
        };
        let mut generation_config = json!({"responseModalities": modalities});
        if Self::is_high_res_model(model) {
            generation_config["imageConfig"] = json!({
                "imageSize": size,
                "aspectRatio": self.settings.aspect_ratio,
            });
        }

        let body = json!({
            "contents": [{"parts": parts}],
            "generationConfig": generation_config,
            "safetySettings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"},
            ],
        });

        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", credential.secret())
            .json(&body)
            .send()
            .await
            .map_err(GenError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(classify_error_response(ProviderId::Gemini, response).await);
        }

        let data: Value = response.json().await.map_err(GenError::from_reqwest)?;
        parse_native_response(&data)
    }

    /// OpenAI-compatible `chat/completions` call with Bearer auth.
    async fn generate_compat(
        &self,
        prompt: &str,
        model: &str,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<Vec<u8>, GenError> {
        let url = format!("{}/v1/chat/completions", self.settings.base_url);

        let mut content = vec![json!({"type": "text", "text": prompt})];
        for image in &request.reference_images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": build_data_url(image)},
            }));
        }

        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": content}],
            "max_tokens": 4096,
        });

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(credential.secret())
            .json(&body)
            .send()
            .await
            .map_err(GenError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(classify_error_response(ProviderId::Gemini, response).await);
        }

        let data: Value = response.json().await.map_err(GenError::from_reqwest)?;
        parse_compat_response(&data)
    }
}

/// Pull image bytes out of a native `generateContent` response. When
/// several images come back (reference-image mode) the last one is the
/// final render.
fn parse_native_response(data: &Value) -> Result<Vec<u8>, GenError> {
    let candidates = data
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            if let Some(reason) = data
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
            {
                GenError::ContentPolicy {
                    message: format!("prompt blocked: {reason}"),
                }
            } else {
                GenError::Api {
                    message: "gemini returned no candidates".into(),
                }
            }
        })?;

    let first = &candidates[0];
    if let Some(finish) = first.get("finishReason").and_then(Value::as_str) {
        if finish != "STOP" {
            let detail = first
                .get("finishMessage")
                .and_then(Value::as_str)
                .unwrap_or(finish);
            return Err(GenError::Api {
                message: format!("gemini generation stopped: {detail}"),
            });
        }
    }

    let mut last_image = None;
    for candidate in candidates {
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array);
        for part in parts.into_iter().flatten() {
            let mime = part
                .pointer("/inlineData/mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/");
            if !mime.starts_with("image/") {
                continue;
            }
            if let Some(b64) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                last_image = Some(b64);
            }
        }
    }

    let b64 = last_image.ok_or_else(|| GenError::Api {
        message: "gemini response contained no image data".into(),
    })?;
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| GenError::Api {
            message: format!("gemini returned invalid base64: {e}"),
        })
}

/// Pull image bytes out of an OpenAI-shaped chat response. Handles both
/// `image_url` data URLs and the `inlineData` shape some proxies emit.
fn parse_compat_response(data: &Value) -> Result<Vec<u8>, GenError> {
    let content = data
        .pointer("/choices/0/message/content")
        .ok_or_else(|| GenError::Api {
            message: "gemini compat response missing choices".into(),
        })?;

    let items = content.as_array().ok_or_else(|| GenError::Api {
        message: "gemini compat response content is not structured".into(),
    })?;

    for item in items {
        if item.get("type").and_then(Value::as_str) == Some("image_url") {
            if let Some(url) = item.pointer("/image_url/url").and_then(Value::as_str) {
                if let Some((_, b64)) = url.split_once(',') {
                    if url.starts_with("data:image") {
                        return base64::engine::general_purpose::STANDARD
                            .decode(b64)
                            .map_err(|e| GenError::Api {
                                message: format!("gemini returned invalid base64: {e}"),
                            });
                    }
                }
            }
        }
        if let Some(b64) = item.pointer("/inlineData/data").and_then(Value::as_str) {
            return base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| GenError::Api {
                    message: format!("gemini returned invalid base64: {e}"),
                });
        }
    }

    Err(GenError::Api {
        message: "gemini compat response contained no image data".into(),
    })
}
