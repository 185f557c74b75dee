//! Shared failure taxonomy for generation, fetching, and caching.
//!
//! Retryability is an explicit property of the classification
//! (`GenError::is_retryable`), not something inferred from the error
//! source; the retry executor's decision logic is a pure function of it.

use crate::providers::ProviderId;

/// Errors that can occur anywhere in the generation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GenError {
    /// The provider rejected the credential. Not retryable.
    #[error("{provider}: credential rejected: {message}")]
    Unauthorized {
        provider: ProviderId,
        message: String,
    },

    /// HTTP 429. Retryable with backoff, honouring Retry-After when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Retry-After header value in seconds, if the provider sent one.
        retry_after_secs: Option<u64>,
    },

    /// Server-side 5xx, connection reset, or similar temporary failure.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Deadline exceeded. Retryable, consuming retry budget.
    #[error("operation timed out")]
    Timeout,

    /// The provider refused the prompt on content-policy grounds. Not retryable.
    #[error("content policy rejection: {message}")]
    ContentPolicy { message: String },

    /// Malformed or unsupported request (empty prompt, bad parameters).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The provider answered but the response could not be used.
    #[error("provider error: {message}")]
    Api { message: String },

    /// Outbound URL failed SSRF validation. Always fatal to the call.
    #[error("unsafe target {url}: {reason}")]
    UnsafeTarget { url: String, reason: String },

    /// A download would exceed the configured byte ceiling.
    #[error("payload exceeds {limit_bytes} byte limit")]
    PayloadTooLarge { limit_bytes: u64 },

    /// The credential pool for this provider is empty.
    #[error("no credential available for provider {provider}")]
    NoCredentialAvailable { provider: ProviderId },

    /// The retry executor spent its whole budget on one operation.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<GenError> },

    /// Every failover candidate was tried and failed.
    #[error("all providers exhausted ({attempted} attempted): {last}")]
    AllProvidersExhausted { attempted: u32, last: Box<GenError> },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Cache/disk errors surface immediately and are never retried;
    /// they indicate an environment problem needing intervention.
    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),
}

impl GenError {
    /// Classify a transport error, folding client-side deadline hits into
    /// [`GenError::Timeout`].
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenError::Timeout
        } else {
            GenError::Http(err)
        }
    }

    /// Whether the retry executor may re-run the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenError::RateLimited { .. } | GenError::Transient { .. } | GenError::Timeout => true,
            GenError::Http(err) => is_transient_network_error(err),
            _ => false,
        }
    }
}

/// Determine if a reqwest error is a transient network error worth retrying.
///
/// Connection failures, timeouts, and mid-body drops usually resolve on
/// retry; everything else does not.
pub fn is_transient_network_error(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() || error.is_body() {
        return true;
    }
    if let Some(status) = error.status() {
        return status.is_server_error();
    }
    false
}
