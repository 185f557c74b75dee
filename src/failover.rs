//! Failover controller: orchestrates primary-plus-fallback generation.
//!
//! Candidates are tried strictly in order, never in parallel, because
//! concurrent billable calls to paid backends are a cost hazard. Each
//! candidate gets a full retry budget through the executor; a fresh
//! credential is drawn from the pool for every attempt so key rotation
//! spreads load even within one logical request. On success the media is
//! materialized (downloading through the SSRF-safe path when the provider
//! returned a URL) and committed to the artifact store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{Artifact, ArtifactStore};
use crate::error::GenError;
use crate::keypool::KeyPool;
use crate::net::{retry, RetryPolicy, SafeFetcher};
use crate::providers::{GenerationRequest, MediaKind, MediaPayload, Provider, ProviderId};

/// Fallback configuration: the candidate order, primary first.
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub enabled: bool,
    pub order: Vec<ProviderId>,
}

impl FailoverPolicy {
    pub fn single(primary: ProviderId) -> Self {
        Self {
            enabled: false,
            order: vec![primary],
        }
    }
}

/// Terminal success: the stored artifact plus which provider served it.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub artifact: Artifact,
    pub provider: ProviderId,
}

pub struct FailoverController {
    providers: HashMap<ProviderId, Provider>,
    policy: FailoverPolicy,
    pool: Arc<KeyPool>,
    fetcher: SafeFetcher,
    retry_policy: RetryPolicy,
    store: Arc<ArtifactStore>,
}

impl FailoverController {
    pub fn new(
        providers: Vec<Provider>,
        policy: FailoverPolicy,
        pool: Arc<KeyPool>,
        fetcher: SafeFetcher,
        retry_policy: RetryPolicy,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id(), p)).collect(),
            policy,
            pool,
            fetcher,
            retry_policy,
            store,
        }
    }

    /// Candidate list for one request: the request's preferred backend
    /// (when set), then the configured order; fallbacks only when
    /// enabled. Non-capable providers are skipped for video without
    /// counting as attempts.
    fn candidates(&self, request: &GenerationRequest) -> Vec<&Provider> {
        let mut order: Vec<ProviderId> = Vec::new();
        if let Some(preferred) = request.preference {
            order.push(preferred);
        }
        for id in &self.policy.order {
            if !order.contains(id) {
                order.push(*id);
            }
        }
        if !self.policy.enabled {
            order.truncate(1);
        }
        order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .filter(|p| request.kind != MediaKind::Video || p.supports_video())
            .collect()
    }

    /// Run a generation request to terminal success or aggregate failure.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenError> {
        let candidates = self.candidates(request);
        if candidates.is_empty() {
            return Err(GenError::InvalidRequest {
                message: format!("no configured provider supports {} requests", request.kind),
            });
        }

        let mut attempted = 0u32;
        let mut last_error: Option<GenError> = None;
        for provider in candidates {
            let id = provider.id();
            attempted += 1;
            log::info!("attempting {} generation via {id}", request.kind);

            // Copy-capture references so the per-attempt future owns
            // everything it needs; a fresh credential is drawn from the
            // rotating pool on every attempt.
            let pool = self.pool.as_ref();
            let result = retry::execute(&self.retry_policy, move || async move {
                let credential = pool.next(id)?;
                match request.kind {
                    MediaKind::Image => provider.generate_image(request, &credential).await,
                    MediaKind::Video => provider.generate_video(request, &credential).await,
                }
            })
            .await;

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    log::warn!("{id} failed: {err}, advancing to next candidate");
                    last_error = Some(err);
                    continue;
                }
            };

            // Materialization and storage failures are environment
            // problems, not provider problems: surface them instead of
            // burning through the remaining candidates.
            let bytes = self.materialize(output.payload).await?;
            let artifact = self
                .store
                .store(bytes, output.kind, id, &output.model, &request.prompt)
                .await?;
            log::info!("generation served by {id} as artifact {}", artifact.id);
            return Ok(GenerationOutcome {
                artifact,
                provider: id,
            });
        }

        // At least one candidate ran, so last_error is always populated.
        let last = last_error.unwrap_or(GenError::InvalidRequest {
            message: "no candidate attempted".into(),
        });
        Err(GenError::AllProvidersExhausted {
            attempted,
            last: Box::new(last),
        })
    }

    /// Resolve a payload into raw bytes, downloading remote URLs through
    /// the SSRF-safe fetcher with the same retry treatment as generation.
    async fn materialize(&self, payload: MediaPayload) -> Result<Vec<u8>, GenError> {
        match payload {
            MediaPayload::Bytes { data, .. } => Ok(data),
            MediaPayload::RemoteUrl(url) => {
                let fetcher = &self.fetcher;
                let target = url.as_str();
                let fetched =
                    retry::execute(&self.retry_policy, move || fetcher.fetch(target)).await?;
                Ok(fetched.bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::net::fetch::NetworkConfig;
    use crate::providers::gitee::{GiteeAdapter, GiteeSettings};
    use crate::providers::grok::{GrokAdapter, GrokSettings};
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_retry_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn test_fetcher() -> SafeFetcher {
        SafeFetcher::new(&NetworkConfig {
            trusted_hosts: vec!["127.0.0.1".into(), "localhost".into()],
            ..NetworkConfig::default()
        })
        .unwrap()
    }

    async fn test_store(dir: &TempDir) -> Arc<ArtifactStore> {
        Arc::new(
            ArtifactStore::open(dir.path(), CacheLimits::unlimited())
                .await
                .unwrap(),
        )
    }

    fn pool_with_keys() -> Arc<KeyPool> {
        let pool = KeyPool::new();
        pool.seed(ProviderId::Gitee, &["k-gitee".to_string()]);
        pool.seed(ProviderId::Grok, &["k-grok".to_string()]);
        pool.seed(ProviderId::Gemini, &["k-gemini".to_string()]);
        Arc::new(pool)
    }

    fn gitee_on(server: &MockServer) -> Provider {
        Provider::Gitee(
            GiteeAdapter::new(GiteeSettings {
                base_url: server.uri(),
                ..GiteeSettings::default()
            })
            .unwrap(),
        )
    }

    fn grok_on(server: &MockServer) -> Provider {
        Provider::Grok(
            GrokAdapter::new(GrokSettings {
                base_url: server.uri(),
                ..GrokSettings::default()
            })
            .unwrap(),
        )
    }

    fn png_body() -> Vec<u8> {
        b"\x89PNG\r\n\x1a\nfailover".to_vec()
    }

    #[tokio::test]
    async fn transient_primary_fails_over_after_full_retry_budget() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&primary)
            .await;

        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/media/img.png", fallback.uri())}]
            })))
            .mount(&fallback)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_body()))
            .mount(&fallback)
            .await;

        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&primary), grok_on(&fallback)],
            FailoverPolicy {
                enabled: true,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let outcome = controller
            .generate(&GenerationRequest::image("a fox"))
            .await
            .unwrap();
        // Success is attributed to the fallback and the primary was
        // attempted exactly max_attempts times (asserted by expect(3)).
        assert_eq!(outcome.provider, ProviderId::Grok);
        assert_eq!(outcome.artifact.provider, ProviderId::Grok);
    }

    #[tokio::test]
    async fn exhausted_candidates_yield_aggregate_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&server), grok_on(&server)],
            FailoverPolicy {
                enabled: true,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let err = controller
            .generate(&GenerationRequest::image("a fox"))
            .await
            .unwrap_err();
        match err {
            GenError::AllProvidersExhausted { attempted, last } => {
                assert_eq!(attempted, 2);
                assert!(matches!(*last, GenError::RetriesExhausted { .. }));
            }
            other => panic!("expected AllProvidersExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn fallback_disabled_stops_at_primary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&server), grok_on(&server)],
            FailoverPolicy {
                enabled: false,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let err = controller
            .generate(&GenerationRequest::image("a fox"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GenError::AllProvidersExhausted { attempted: 1, .. }
        ));
    }

    #[tokio::test]
    async fn video_requests_skip_non_capable_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/videos/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/media/clip.mp4", server.uri())}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(b"\x00\x00\x00\x18ftypisomclip".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        // Gitee comes first in the order but cannot do video; the request
        // must route straight to grok without an error.
        let controller = FailoverController::new(
            vec![gitee_on(&server), grok_on(&server)],
            FailoverPolicy {
                enabled: true,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let outcome = controller
            .generate(&GenerationRequest::video("waves"))
            .await
            .unwrap();
        assert_eq!(outcome.provider, ProviderId::Grok);
        assert_eq!(outcome.artifact.ext, "mp4");
    }

    #[tokio::test]
    async fn request_preference_jumps_the_configured_order() {
        let gitee_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&gitee_server)
            .await;

        let grok_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/img.png", grok_server.uri())}]
            })))
            .mount(&grok_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_body()))
            .mount(&grok_server)
            .await;

        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&gitee_server), grok_on(&grok_server)],
            FailoverPolicy {
                enabled: true,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let mut request = GenerationRequest::image("a fox");
        request.preference = Some(ProviderId::Grok);
        let outcome = controller.generate(&request).await.unwrap();
        assert_eq!(outcome.provider, ProviderId::Grok);
    }

    #[tokio::test]
    async fn non_retryable_rejection_advances_without_retrying() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("prompt blocked by content policy"),
            )
            .expect(1)
            .mount(&primary)
            .await;

        let fallback = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/img.png", fallback.uri())}]
            })))
            .mount(&fallback)
            .await;
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_body()))
            .mount(&fallback)
            .await;

        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&primary), grok_on(&fallback)],
            FailoverPolicy {
                enabled: true,
                order: vec![ProviderId::Gitee, ProviderId::Grok],
            },
            pool_with_keys(),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let outcome = controller
            .generate(&GenerationRequest::image("a fox"))
            .await
            .unwrap();
        assert_eq!(outcome.provider, ProviderId::Grok);
    }

    #[tokio::test]
    async fn empty_key_pool_fails_closed() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            vec![gitee_on(&server)],
            FailoverPolicy::single(ProviderId::Gitee),
            Arc::new(KeyPool::new()),
            test_fetcher(),
            test_retry_policy(),
            test_store(&dir).await,
        );

        let err = controller
            .generate(&GenerationRequest::image("a fox"))
            .await
            .unwrap_err();
        match err {
            GenError::AllProvidersExhausted { last, .. } => {
                assert!(matches!(*last, GenError::NoCredentialAvailable { .. }));
            }
            other => panic!("expected AllProvidersExhausted, got {other}"),
        }
    }
}
