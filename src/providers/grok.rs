//! Grok (x.ai) adapter.
//!
//! Text-only image requests go to the images API, which accepts an explicit
//! size. Requests carrying reference images go through chat completions,
//! where the rendered image comes back as a URL embedded in the assistant
//! message (markdown, an HTML img tag, or a bare link, depending on which
//! proxy is in front of the API). Some proxies also stream SSE even when
//! `stream` is false, so the chat path coalesces chunked responses before
//! parsing.

use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};

use crate::error::GenError;
use crate::keypool::Credential;

use super::{
    build_data_url, classify_error_response, validate_prompt, GenerationRequest, MediaKind,
    MediaPayload, ProviderId, ProviderOutput,
};

/// Default base URL for the x.ai API.
pub const GROK_BASE_URL: &str = "https://api.x.ai";

/// Default model for image generation.
pub const DEFAULT_IMAGE_MODEL: &str = "grok-2-image";

/// Default model for video generation.
pub const DEFAULT_VIDEO_MODEL: &str = "grok-2-video";

/// Maximum reference images accepted by the chat endpoint.
const MAX_REFERENCE_IMAGES: usize = 4;

/// Settings for one Grok adapter instance.
#[derive(Debug, Clone)]
pub struct GrokSettings {
    pub base_url: String,
    pub image_model: String,
    pub video_model: String,
    pub default_size: String,
    pub request_timeout: Duration,
}

impl Default for GrokSettings {
    fn default() -> Self {
        Self {
            base_url: GROK_BASE_URL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            default_size: "1024x1024".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct GrokAdapter {
    settings: GrokSettings,
    http_client: reqwest::Client,
}

impl GrokAdapter {
    pub fn new(settings: GrokSettings) -> Result<Self, GenError> {
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

    fn origin(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    fn effective_size(&self, request: &GenerationRequest) -> String {
        if let Some(size) = &request.size {
            return size.clone();
        }
        match request.resolution.as_deref().map(str::to_uppercase).as_deref() {
            Some("1K") => "1024x1024".into(),
            Some("2K") => "2048x2048".into(),
            Some("4K") => "4096x4096".into(),
            _ => self.settings.default_size.clone(),
        }
    }

    pub async fn generate_image(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<ProviderOutput, GenError> {
        validate_prompt(&request.prompt)?;

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.image_model.clone());

        let payload = if request.reference_images.is_empty() {
            self.generate_via_images_api(request, &model, credential)
                .await?
        } else {
            self.generate_via_chat(request, &model, credential).await?
        };

        Ok(ProviderOutput {
            payload,
            kind: MediaKind::Image,
            provider: ProviderId::Grok,
            model,
        })
    }

    /// Video generation through the videos endpoint, same response shape as
    /// the images API.
    pub async fn generate_video(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<ProviderOutput, GenError> {
        validate_prompt(&request.prompt)?;

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.video_model.clone());
        let url = format!("{}/v1/videos/generations", self.origin());
        let body = json!({
            "model": model,
            "prompt": request.prompt,
            "n": 1,
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
            return Err(classify_error_response(ProviderId::Grok, response).await);
        }

        let data: Value = response.json().await.map_err(GenError::from_reqwest)?;
        let video_url = data
            .pointer("/data/0/url")
            .and_then(Value::as_str)
            .ok_or_else(|| GenError::Api {
                message: "grok returned no video url".into(),
            })?;

        Ok(ProviderOutput {
            payload: MediaPayload::RemoteUrl(video_url.to_string()),
            kind: MediaKind::Video,
            provider: ProviderId::Grok,
            model,
        })
    }

    async fn generate_via_images_api(
        &self,
        request: &GenerationRequest,
        model: &str,
        credential: &Credential,
    ) -> Result<MediaPayload, GenError> {
        let url = format!("{}/v1/images/generations", self.origin());
        let body = json!({
            "model": model,
            "prompt": request.prompt,
            "n": 1,
            "size": self.effective_size(request),
            "response_format": "url",
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
            return Err(classify_error_response(ProviderId::Grok, response).await);
        }

        let data: Value = response.json().await.map_err(GenError::from_reqwest)?;
        if let Some(url) = data.pointer("/data/0/url").and_then(Value::as_str) {
            return self.payload_from_ref(url);
        }
        if let Some(b64) = data.pointer("/data/0/b64_json").and_then(Value::as_str) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| GenError::Api {
                    message: format!("grok returned invalid base64: {e}"),
                })?;
            return Ok(MediaPayload::Bytes {
                data: bytes,
                content_type: None,
            });
        }
        Err(GenError::Api {
            message: "grok images response contained no image".into(),
        })
    }

    async fn generate_via_chat(
        &self,
        request: &GenerationRequest,
        model: &str,
        credential: &Credential,
    ) -> Result<MediaPayload, GenError> {
        let url = format!("{}/v1/chat/completions", self.origin());

        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        for image in request.reference_images.iter().take(MAX_REFERENCE_IMAGES) {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": build_data_url(image)},
            }));
        }

        let body = json!({
            "model": model,
            "stream": false,
            "messages": [{"role": "user", "content": content}],
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
            return Err(classify_error_response(ProviderId::Grok, response).await);
        }

        let text = response.text().await.map_err(GenError::from_reqwest)?;
        let data = if text.trim_start().starts_with("data:") {
            log::debug!("grok chat endpoint streamed SSE, coalescing");
            coalesce_sse(&text)
        } else {
            serde_json::from_str(&text).map_err(|e| GenError::Api {
                message: format!("grok response is not valid JSON: {e}"),
            })?
        };

        let message = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| GenError::Api {
                message: "grok chat response missing message content".into(),
            })?;

        let image_ref = extract_image_url(message).ok_or_else(|| GenError::Api {
            message: "grok chat response contained no image url".into(),
        })?;
        self.payload_from_ref(&image_ref)
    }

    /// Turn an image reference from the API into a payload: inline data
    /// URLs decode to bytes, absolute URLs pass through for the safe
    /// download path, relative paths resolve against the API origin.
    fn payload_from_ref(&self, image_ref: &str) -> Result<MediaPayload, GenError> {
        let image_ref = image_ref.trim();
        if image_ref.is_empty() {
            return Err(GenError::Api {
                message: "grok returned an empty image reference".into(),
            });
        }
        if let Some(rest) = image_ref.strip_prefix("data:image/") {
            let b64 = rest.split_once(',').map(|(_, b)| b).ok_or_else(|| {
                GenError::Api {
                    message: "grok data url has no base64 payload".into(),
                }
            })?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| GenError::Api {
                    message: format!("grok returned invalid base64: {e}"),
                })?;
            return Ok(MediaPayload::Bytes {
                data: bytes,
                content_type: None,
            });
        }
        if image_ref.starts_with("http://") || image_ref.starts_with("https://") {
            return Ok(MediaPayload::RemoteUrl(image_ref.to_string()));
        }
        Ok(MediaPayload::RemoteUrl(format!(
            "{}/{}",
            self.origin(),
            image_ref.trim_start_matches('/')
        )))
    }
}

/// Merge an SSE stream into one chat-completion document by concatenating
/// every `delta.content` fragment.
fn coalesce_sse(text: &str) -> Value {
    let mut accumulated = String::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if let Some(content) = chunk.pointer("/choices/0/delta/content").and_then(Value::as_str)
        {
            accumulated.push_str(content);
        }
    }
    json!({
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": accumulated},
            "finish_reason": "stop",
        }],
    })
}

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp"];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov"];

fn is_valid_image_url(url: &str, from_markup: bool) -> bool {
    let url = url.trim();
    if url.len() < 10 || !(url.starts_with("http://") || url.starts_with("https://")) {
        return false;
    }
    if url.contains(['<', '>', '"', '\'', '\n', '\r', '\t']) {
        return false;
    }
    let lowered = url.to_lowercase();
    if VIDEO_EXTENSIONS.iter().any(|e| lowered.contains(e)) {
        return false;
    }
    if IMAGE_EXTENSIONS.iter().any(|e| lowered.contains(e)) {
        return true;
    }
    // Markup-sourced URLs are trusted even without an extension, as are
    // obvious generated-image paths from proxies.
    from_markup || lowered.contains("generated_image") || lowered.contains("/image")
}

/// Find a candidate URL between `open` and `close` after `anchor`.
fn delimited_after<'a>(
    content: &'a str,
    anchor: &str,
    open: char,
    close: char,
) -> Option<&'a str> {
    let pos = content.find(anchor)? + anchor.len();
    let rest = &content[pos..];
    let start = rest.find(open)? + open.len_utf8();
    let rest = &rest[start..];
    let end = rest.find(close)?;
    Some(&rest[..end])
}

/// Extract an image URL from assistant message text. Tries an HTML img
/// tag, then markdown image syntax, then a bare URL with an image
/// extension.
pub(crate) fn extract_image_url(content: &str) -> Option<String> {
    if content.is_empty() {
        return None;
    }

    // <img src="...">
    if content.contains("<img") {
        for quote in ['"', '\''] {
            if let Some(url) = delimited_after(content, "src=", quote, quote) {
                if is_valid_image_url(url, true) {
                    return Some(url.trim().to_string());
                }
            }
        }
    }

    // ![alt](url)
    if let Some(url) = delimited_after(content, "![", '(', ')') {
        let url = url.split_whitespace().next().unwrap_or("");
        if is_valid_image_url(url, true) {
            return Some(url.to_string());
        }
    }

    // Bare URL anywhere in the text.
    for scheme in ["https://", "http://"] {
        let mut search = content;
        while let Some(pos) = search.find(scheme) {
            let tail = &search[pos..];
            let end = tail
                .find(|c: char| c.is_whitespace() || "<>\"'".contains(c))
                .unwrap_or(tail.len());
            let url = &tail[..end];
            let lowered = url.to_lowercase();
            if is_valid_image_url(url, false) {
                return Some(url.to_string());
            }
            // Loose match for proxies serving from an /images/ path with
            // no file extension.
            if lowered.contains("/images/") && is_valid_image_url(url, true) {
                return Some(url.to_string());
            }
            search = &tail[scheme.len()..];
        }
    }

    None
}
