//! Provider adapters for remote media generation backends.
//!
//! Each adapter translates a [`GenerationRequest`] into one backend's wire
//! format and normalizes the response into a [`ProviderOutput`]. Adapters
//! never hold credentials; the caller draws one from the pool per call and
//! passes it in. Error responses are mapped into the shared `GenError`
//! taxonomy so retry and failover logic can treat all backends uniformly.

pub mod gemini;
pub mod gitee;
pub mod grok;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GenError;
use crate::keypool::Credential;

pub use gemini::GeminiAdapter;
pub use gitee::GiteeAdapter;
pub use grok::GrokAdapter;

/// HTTP status code for rate limiting.
const HTTP_STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// HTTP status code for bad request (often content policy).
const HTTP_STATUS_BAD_REQUEST: u16 = 400;

/// HTTP status code for forbidden (content policy violation).
const HTTP_STATUS_FORBIDDEN: u16 = 403;

/// Keywords that indicate a content policy violation in error messages.
const CONTENT_POLICY_KEYWORDS: &[&str] = &[
    "content policy",
    "policy violation",
    "inappropriate",
    "not allowed",
    "prohibited",
    "blocked",
    "unsafe",
    "violates",
    "moderation",
    "nsfw",
];

/// Identifies one remote generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Gitee,
    Gemini,
    Grok,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Gitee => "gitee",
            ProviderId::Gemini => "gemini",
            ProviderId::Grok => "grok",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gitee" => Ok(ProviderId::Gitee),
            "gemini" => Ok(ProviderId::Gemini),
            "grok" => Ok(ProviderId::Grok),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// The class of media being generated or stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => f.write_str("image"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// One generation request, immutable once submitted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub kind: MediaKind,
    /// Raw bytes of reference images for identity-consistent generation.
    pub reference_images: Vec<Vec<u8>>,
    /// Explicit size such as "1024x1024". Takes precedence over `resolution`.
    pub size: Option<String>,
    /// Resolution shorthand: "1K", "2K" or "4K".
    pub resolution: Option<String>,
    /// Model override; each adapter falls back to its configured default.
    pub model: Option<String>,
    pub negative_prompt: Option<String>,
    /// Preferred backend, tried before the configured primary.
    pub preference: Option<ProviderId>,
}

impl GenerationRequest {
    pub fn image(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            kind: MediaKind::Image,
            reference_images: Vec::new(),
            size: None,
            resolution: None,
            model: None,
            negative_prompt: None,
            preference: None,
        }
    }

    pub fn video(prompt: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            ..Self::image(prompt)
        }
    }
}

/// Validate a prompt before sending it to any backend.
pub fn validate_prompt(prompt: &str) -> Result<(), GenError> {
    if prompt.trim().is_empty() {
        return Err(GenError::InvalidRequest {
            message: "empty prompt".into(),
        });
    }
    Ok(())
}

/// The media a provider handed back: either inline bytes or a URL that
/// still needs to be fetched through the safe download path.
#[derive(Debug, Clone)]
pub enum MediaPayload {
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    RemoteUrl(String),
}

/// Normalized successful response from one adapter call.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub payload: MediaPayload,
    pub kind: MediaKind,
    pub provider: ProviderId,
    pub model: String,
}

/// One configured backend. The failover controller only sees this enum,
/// never a concrete adapter type.
#[derive(Debug)]
pub enum Provider {
    Gitee(GiteeAdapter),
    Gemini(GeminiAdapter),
    Grok(GrokAdapter),
}

impl Provider {
    pub fn id(&self) -> ProviderId {
        match self {
            Provider::Gitee(_) => ProviderId::Gitee,
            Provider::Gemini(_) => ProviderId::Gemini,
            Provider::Grok(_) => ProviderId::Grok,
        }
    }

    /// Whether this backend can serve video requests.
    pub fn supports_video(&self) -> bool {
        matches!(self, Provider::Grok(_))
    }

    pub async fn generate_image(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<ProviderOutput, GenError> {
        match self {
            Provider::Gitee(a) => a.generate_image(request, credential).await,
            Provider::Gemini(a) => a.generate_image(request, credential).await,
            Provider::Grok(a) => a.generate_image(request, credential).await,
        }
    }

    pub async fn generate_video(
        &self,
        request: &GenerationRequest,
        credential: &Credential,
    ) -> Result<ProviderOutput, GenError> {
        match self {
            Provider::Grok(a) => a.generate_video(request, credential).await,
            other => Err(GenError::InvalidRequest {
                message: format!("provider {} does not support video", other.id()),
            }),
        }
    }
}

/// Check if an error message indicates a content policy violation.
fn is_content_policy_error(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    CONTENT_POLICY_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Map a non-success HTTP response into the shared failure taxonomy.
///
/// Consumes the response body, so callers must have already checked the
/// status is not a success.
pub(crate) async fn classify_error_response(
    provider: ProviderId,
    response: reqwest::Response,
) -> GenError {
    let status = response.status();
    let retry_after = crate::net::retry::parse_retry_after(&response);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());

    if status.as_u16() == 401 {
        return GenError::Unauthorized {
            provider,
            message: truncate(&body, 300),
        };
    }
    if status.as_u16() == HTTP_STATUS_TOO_MANY_REQUESTS {
        log::warn!("{provider} rate limited, Retry-After: {retry_after:?}");
        return GenError::RateLimited {
            message: truncate(&body, 300),
            retry_after_secs: retry_after,
        };
    }
    if status.is_server_error() {
        return GenError::Transient {
            message: format!("{provider} returned HTTP {status}: {}", truncate(&body, 300)),
        };
    }
    if (status.as_u16() == HTTP_STATUS_BAD_REQUEST || status.as_u16() == HTTP_STATUS_FORBIDDEN)
        && is_content_policy_error(&body)
    {
        log::warn!("{provider} rejected prompt for content policy");
        return GenError::ContentPolicy {
            message: truncate(&body, 300),
        };
    }
    GenError::Api {
        message: format!("{provider} request failed with HTTP {status}: {}", truncate(&body, 300)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Guess a MIME type from leading magic bytes. Defaults to JPEG, which is
/// what most backends return when undeclared.
pub fn sniff_image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Encode image bytes as a data URL for OpenAI-shaped chat payloads.
pub(crate) fn build_data_url(data: &[u8]) -> String {
    use base64::Engine;
    let mime = sniff_image_mime(data);
    let b64 = base64::engine::general_purpose::STANDARD.encode(data);
    format!("data:{mime};base64,{b64}")
}
