//! End-to-end generation pipeline tests against mock providers.
//!
//! Exercises the public crate surface: pool -> controller -> adapter ->
//! safe fetch -> artifact store, with wiremock standing in for the
//! remote backends.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mediaforge::cache::{ArtifactStore, CacheLimits, ListFilter};
use mediaforge::error::GenError;
use mediaforge::failover::{FailoverController, FailoverPolicy};
use mediaforge::keypool::KeyPool;
use mediaforge::net::fetch::NetworkConfig;
use mediaforge::net::{RetryPolicy, SafeFetcher};
use mediaforge::providers::gitee::{GiteeAdapter, GiteeSettings};
use mediaforge::providers::grok::{GrokAdapter, GrokSettings};
use mediaforge::providers::{GenerationRequest, Provider, ProviderId};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\nend-to-end";

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
    }
}

fn fetcher() -> SafeFetcher {
    SafeFetcher::new(&NetworkConfig {
        trusted_hosts: vec!["127.0.0.1".into(), "localhost".into()],
        ..NetworkConfig::default()
    })
    .unwrap()
}

async fn store_in(dir: &TempDir, limits: CacheLimits) -> Arc<ArtifactStore> {
    Arc::new(ArtifactStore::open(dir.path(), limits).await.unwrap())
}

fn pool() -> Arc<KeyPool> {
    let pool = KeyPool::new();
    pool.seed(ProviderId::Gitee, &["kg-1".to_string(), "kg-2".to_string()]);
    pool.seed(ProviderId::Grok, &["kx-1".to_string()]);
    Arc::new(pool)
}

fn controller(
    providers: Vec<Provider>,
    order: Vec<ProviderId>,
    store: Arc<ArtifactStore>,
) -> FailoverController {
    FailoverController::new(
        providers,
        FailoverPolicy {
            enabled: true,
            order,
        },
        pool(),
        fetcher(),
        retry_policy(),
        store,
    )
}

#[tokio::test]
async fn generated_media_lands_in_the_store_with_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": format!("{}/files/out.png", server.uri())}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/out.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG.to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, CacheLimits::unlimited()).await;
    let gitee = Provider::Gitee(
        GiteeAdapter::new(GiteeSettings {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap(),
    );
    let controller = controller(vec![gitee], vec![ProviderId::Gitee], store.clone());

    let outcome = controller
        .generate(&GenerationRequest::image("a red fox"))
        .await
        .unwrap();
    assert_eq!(outcome.provider, ProviderId::Gitee);
    assert_eq!(outcome.artifact.provider, ProviderId::Gitee);
    assert_eq!(outcome.artifact.prompt, "a red fox");
    assert_eq!(outcome.artifact.ext, "png");

    let bytes = store.read_bytes(&outcome.artifact.id).await.unwrap().unwrap();
    assert_eq!(bytes, PNG);
    let listed = store.list(ListFilter::default()).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, outcome.artifact.id);
}

#[tokio::test]
async fn repeat_generation_of_identical_bytes_dedups() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": format!("{}/files/same.png", server.uri())}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/same.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG.to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, CacheLimits::unlimited()).await;
    let gitee = Provider::Gitee(
        GiteeAdapter::new(GiteeSettings {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap(),
    );
    let controller = controller(vec![gitee], vec![ProviderId::Gitee], store.clone());

    let first = controller
        .generate(&GenerationRequest::image("a red fox"))
        .await
        .unwrap();
    let second = controller
        .generate(&GenerationRequest::image("a red fox"))
        .await
        .unwrap();
    assert_eq!(first.artifact.id, second.artifact.id);
    assert_eq!(store.list(ListFilter::default()).await.len(), 1);
}

#[tokio::test]
async fn primary_retry_budget_is_spent_before_failover() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2) // retry_policy().max_attempts
        .mount(&primary)
        .await;

    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": format!("{}/ok.png", fallback.uri())}]
        })))
        .mount(&fallback)
        .await;
    Mock::given(method("GET"))
        .and(path("/ok.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG.to_vec()))
        .mount(&fallback)
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, CacheLimits::unlimited()).await;
    let providers = vec![
        Provider::Gitee(
            GiteeAdapter::new(GiteeSettings {
                base_url: primary.uri(),
                ..Default::default()
            })
            .unwrap(),
        ),
        Provider::Grok(
            GrokAdapter::new(GrokSettings {
                base_url: fallback.uri(),
                ..Default::default()
            })
            .unwrap(),
        ),
    ];
    let controller = controller(
        providers,
        vec![ProviderId::Gitee, ProviderId::Grok],
        store,
    );

    let outcome = controller
        .generate(&GenerationRequest::image("a red fox"))
        .await
        .unwrap();
    assert_eq!(outcome.provider, ProviderId::Grok);
}

#[tokio::test]
async fn unsafe_download_target_is_fatal() {
    // Provider answers with a URL pointing into a private range; the
    // materialization step must refuse to connect.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"url": "http://10.0.0.8/internal.png"}]
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, CacheLimits::unlimited()).await;
    let gitee = Provider::Gitee(
        GiteeAdapter::new(GiteeSettings {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap(),
    );
    let controller = controller(vec![gitee], vec![ProviderId::Gitee], store.clone());

    let err = controller
        .generate(&GenerationRequest::image("a red fox"))
        .await
        .unwrap_err();
    assert!(matches!(err, GenError::UnsafeTarget { .. }), "got {err}");
    assert!(store.list(ListFilter::default()).await.is_empty());
}

#[tokio::test]
async fn eviction_applies_after_generated_inserts() {
    let server = MockServer::start().await;
    // Distinct bodies per call so dedup does not collapse them.
    for i in 0..4u8 {
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/img-{i}.png", server.uri())}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/img-{i}.png")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes([b"\x89PNG\r\n\x1a\n".as_slice(), &[i]].concat()),
            )
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let store = store_in(
        &dir,
        CacheLimits {
            max_bytes: 0,
            max_count: 2,
        },
    )
    .await;
    let gitee = Provider::Gitee(
        GiteeAdapter::new(GiteeSettings {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap(),
    );
    let controller = controller(vec![gitee], vec![ProviderId::Gitee], store.clone());

    for _ in 0..4 {
        controller
            .generate(&GenerationRequest::image("a red fox"))
            .await
            .unwrap();
    }
    let listed = store.list(ListFilter::default()).await;
    assert_eq!(listed.len(), 2);
    // Newest-first ordering after eviction of the two oldest.
    assert!(listed[0].created_at > listed[1].created_at);
}
