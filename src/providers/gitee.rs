//! Gitee AI adapter (OpenAI-shaped images API).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GenError;
use crate::keypool::Credential;

use super::{
    classify_error_response, validate_prompt, GenerationRequest, MediaKind, MediaPayload,
    ProviderId, ProviderOutput,
};

/// Default base URL for the Gitee AI API.
pub const GITEE_BASE_URL: &str = "https://ai.gitee.com/v1";

/// Default model for image generation.
pub const DEFAULT_MODEL: &str = "z-image-turbo";

/// Models that reject a `negative_prompt` parameter.
const MODELS_WITHOUT_NEGATIVE_PROMPT: &[&str] = &[
    "z-image-turbo",
    "z-image-base",
    "flux.1-dev",
    "flux.1-schnell",
];

/// All sizes the backend accepts: squares, then landscape, then portrait.
const SUPPORTED_SIZES: &[(u32, u32)] = &[
    (256, 256),
    (512, 512),
    (1024, 1024),
    (2048, 2048),
    (1152, 896),
    (2048, 1536),
    (2048, 1360),
    (1024, 576),
    (2048, 1152),
    (768, 1024),
    (1536, 2048),
    (1360, 2048),
    (576, 1024),
    (1152, 2048),
];

/// Map an arbitrary requested size onto the closest supported one, scoring
/// aspect-ratio distance double against normalized area distance.
fn find_closest_size(width: u32, height: u32) -> String {
    let target_ratio = width as f64 / height as f64;
    let target_area = (width as f64) * (height as f64);

    let mut best = (1024u32, 1024u32);
    let mut best_score = f64::INFINITY;
    for &(w, h) in SUPPORTED_SIZES {
        let ratio_diff = (w as f64 / h as f64 - target_ratio).abs();
        let area_diff = ((w as f64) * (h as f64) - target_area).abs() / target_area;
        let score = ratio_diff * 2.0 + area_diff;
        if score < best_score {
            best_score = score;
            best = (w, h);
        }
    }
    format!("{}x{}", best.0, best.1)
}

/// Normalize a size or resolution string ("1K", "2K", "4K", "WxH") into a
/// supported size. Returns `None` for empty or "auto" input.
pub fn resolution_to_size(resolution: &str) -> Option<String> {
    let r = resolution.trim().to_uppercase();
    if r.is_empty() || r == "AUTO" {
        return None;
    }
    match r.as_str() {
        "1K" | "1024" => return Some("1024x1024".into()),
        "2K" | "2048" => return Some("2048x2048".into()),
        // 2048 is the backend's ceiling, 4K degrades to it.
        "4K" | "4096" => return Some("2048x2048".into()),
        _ => {}
    }
    let (w, h) = r.split_once('X')?;
    let (w, h) = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
    if SUPPORTED_SIZES.contains(&(w, h)) {
        Some(format!("{w}x{h}"))
    } else {
        Some(find_closest_size(w, h))
    }
}

#[derive(Debug, Serialize)]
struct ImagesRequest {
    model: String,
    prompt: String,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_inference_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

/// Settings for one Gitee adapter instance.
#[derive(Debug, Clone)]
pub struct GiteeSettings {
    pub base_url: String,
    pub model: String,
    pub default_size: String,
    pub num_inference_steps: Option<u32>,
    pub negative_prompt: Option<String>,
    pub request_timeout: Duration,
}

impl Default for GiteeSettings {
    fn default() -> Self {
        Self {
            base_url: GITEE_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            default_size: "1024x1024".to_string(),
            num_inference_steps: Some(9),
            negative_prompt: None,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Adapter for the Gitee AI images endpoint. Image-only; reference images
/// and video are not supported by this backend.
#[derive(Debug)]
pub struct GiteeAdapter {
    settings: GiteeSettings,
    http_client: reqwest::Client,
}

impl GiteeAdapter {
    pub fn new(settings: GiteeSettings) -> Result<Self, GenError> {
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

    fn effective_size(&self, request: &GenerationRequest) -> String {
        request
            .size
            .as_deref()
            .and_then(resolution_to_size)
            .or_else(|| request.resolution.as_deref().and_then(resolution_to_size))
            .unwrap_or_else(|| self.settings.default_size.clone())
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
            .unwrap_or_else(|| self.settings.model.clone());
        let negative = request
            .negative_prompt
            .clone()
            .or_else(|| self.settings.negative_prompt.clone())
            .filter(|n| !n.is_empty())
            .filter(|_| {
                !MODELS_WITHOUT_NEGATIVE_PROMPT.contains(&model.to_lowercase().as_str())
            });

        let body = ImagesRequest {
            model: model.clone(),
            prompt: request.prompt.clone(),
            size: self.effective_size(request),
            num_inference_steps: self.settings.num_inference_steps,
            negative_prompt: negative,
        };

        let url = format!("{}/images/generations", self.settings.base_url);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(credential.secret())
            .json(&body)
            .send()
            .await
            .map_err(GenError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(classify_error_response(ProviderId::Gitee, response).await);
        }

        let parsed: ImagesResponse = response.json().await.map_err(GenError::from_reqwest)?;
        let first = parsed.data.into_iter().next().ok_or_else(|| GenError::Api {
            message: "gitee returned no image data".into(),
        })?;

        let payload = if let Some(url) = first.url {
            MediaPayload::RemoteUrl(url)
        } else if let Some(b64) = first.b64_json {
            use base64::Engine;
            let data = base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .map_err(|e| GenError::Api {
                    message: format!("gitee returned invalid base64: {e}"),
                })?;
            MediaPayload::Bytes {
                data,
                content_type: None,
            }
        } else {
            return Err(GenError::Api {
                message: "gitee image entry has neither url nor b64_json".into(),
            });
        };

        Ok(ProviderOutput {
            payload,
            kind: MediaKind::Image,
            provider: ProviderId::Gitee,
            model,
        })
    }
}
