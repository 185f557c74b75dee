//! Administrative HTTP surface.
//!
//! Thin axum router over the artifact store and reference library. Every
//! endpoint requires the bearer token (header or `?token=` query),
//! compared in constant time. Binding off-loopback without a configured
//! token gets an auto-generated random one so the surface is never open
//! to a network unauthenticated.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use rand::Rng;
use serde::Serialize;

use crate::cache::{Artifact, ArtifactStore, CacheStats, ListFilter};
use crate::config::Config;
use crate::error::GenError;
use crate::failover::FailoverController;
use crate::providers::{self, GenerationRequest, MediaKind, ProviderId};
use crate::refs::{RefLibrary, MAX_REF_FILE_BYTES};

/// Reference images attached per generation when `use_refs` is set.
const MAX_REQUEST_REFS: usize = 4;

/// Request-body ceiling for multipart uploads; headroom over the per-file
/// cap covers the multipart framing.
const UPLOAD_BODY_LIMIT: usize = MAX_REF_FILE_BYTES as usize + 64 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub refs: Arc<RefLibrary>,
    pub controller: Arc<FailoverController>,
    token: String,
    config_summary: ConfigSummary,
}

/// Redacted configuration view for the admin frontend. Never carries
/// credential material, only per-provider key counts.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub providers: Vec<ProviderSummary>,
    pub fallback_order: Vec<ProviderId>,
    pub fallback_enabled: bool,
    pub cache_max_bytes: u64,
    pub cache_max_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: ProviderId,
    pub key_count: usize,
    pub model: Option<String>,
}

impl ConfigSummary {
    pub fn from_config(config: &Config) -> Self {
        let providers = [
            (ProviderId::Gitee, config.gitee.model.clone()),
            (ProviderId::Gemini, config.gemini.model.clone()),
            (ProviderId::Grok, config.grok.image_model.clone()),
        ]
        .into_iter()
        .map(|(id, model)| ProviderSummary {
            id,
            key_count: config.api_keys(id).len(),
            model,
        })
        .collect();
        Self {
            providers,
            fallback_order: config.fallback.provider_order(),
            fallback_enabled: config.fallback.enabled,
            cache_max_bytes: config.cache.max_bytes,
            cache_max_count: config.cache.max_count,
        }
    }
}

/// Resolve the effective admin token. Off-loopback binds without a
/// configured token get a generated one, printed once to the log so the
/// operator can copy it.
pub fn resolve_token(host: &str, configured: Option<&str>) -> String {
    if let Some(token) = configured {
        let token = token.trim();
        if !token.is_empty() {
            return token.to_string();
        }
    }
    let token: String = {
        let mut rng = rand::thread_rng();
        (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
    };
    if is_loopback_host(host) {
        log::info!("admin token not configured, generated one for this run");
    } else {
        log::warn!("binding admin surface to {host} without a configured token");
    }
    log::info!("admin token: {token}");
    token
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host
            .trim_matches(['[', ']'])
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Constant-time equality over byte strings. Length differences still
/// return early, which leaks only the token length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/artifacts", get(list_artifacts))
        .route("/api/artifacts/:id/favorite", post(toggle_favorite))
        .route("/api/artifacts/:id", delete(delete_artifact))
        .route("/api/stats", get(cache_stats))
        .route("/api/config", get(config_summary))
        .route("/api/refs", get(list_refs).post(upload_refs))
        .route("/api/refs/:name", delete(delete_ref))
        .route("/media/:id", get(serve_media))
        .route("/refs/:name", get(serve_ref))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

/// Start the admin server. Returns the bound address (useful when the
/// configured port is 0).
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
) -> Result<SocketAddr, GenError> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| GenError::InvalidRequest {
            message: format!("invalid bind address {host}:{port}: {e}"),
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    log::info!("admin surface listening on {actual_addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::warn!("admin server exited: {e}");
        }
    });

    Ok(actual_addr)
}

pub fn new_state(
    store: Arc<ArtifactStore>,
    refs: Arc<RefLibrary>,
    controller: Arc<FailoverController>,
    token: String,
    config_summary: ConfigSummary,
) -> Arc<AppState> {
    Arc::new(AppState {
        store,
        refs,
        controller,
        token,
        config_summary,
    })
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let presented = bearer_from_header(&req).or_else(|| token_from_query(&req));
    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), state.token.as_bytes()) => {
            next.run(req).await
        }
        _ => json_error(StatusCode::UNAUTHORIZED, "missing or invalid token"),
    }
}

fn bearer_from_header(req: &Request) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn token_from_query(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn error_to_response(err: GenError) -> Response {
    let status = match &err {
        GenError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        GenError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        GenError::ContentPolicy { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GenError::AllProvidersExhausted { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, &err.to_string())
}

#[derive(serde::Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default = "default_media_kind")]
    kind: MediaKind,
    #[serde(default)]
    provider: Option<ProviderId>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    negative_prompt: Option<String>,
    /// Attach stored reference images to the request.
    #[serde(default)]
    use_refs: bool,
}

fn default_media_kind() -> MediaKind {
    MediaKind::Image
}

#[derive(Serialize)]
struct GenerateResponse {
    provider: ProviderId,
    artifact: Artifact,
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Response {
    if let Err(e) = providers::validate_prompt(&body.prompt) {
        return error_to_response(e);
    }

    let mut request = match body.kind {
        MediaKind::Image => GenerationRequest::image(&body.prompt),
        MediaKind::Video => GenerationRequest::video(&body.prompt),
    };
    request.preference = body.provider;
    request.size = body.size;
    request.resolution = body.resolution;
    request.model = body.model;
    request.negative_prompt = body.negative_prompt;
    if body.use_refs && body.kind == MediaKind::Image {
        match state.refs.load_all(MAX_REQUEST_REFS).await {
            Ok(images) => request.reference_images = images,
            Err(e) => return error_to_response(e),
        }
    }

    match state.controller.generate(&request).await {
        Ok(outcome) => Json(GenerateResponse {
            provider: outcome.provider,
            artifact: outcome.artifact,
        })
        .into_response(),
        Err(e) => error_to_response(e),
    }
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ListFilter>,
) -> Response {
    Json(state.store.list(filter).await).into_response()
}

async fn toggle_favorite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.toggle_favorite(&id).await {
        Ok(Some(artifact)) => Json(artifact).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "unknown artifact"),
        Err(e) => error_to_response(e),
    }
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn delete_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    // Idempotent: deleting an unknown id reports deleted=false with 200.
    match state.store.delete(&id).await {
        Ok(deleted) => Json(DeleteResponse { deleted }).into_response(),
        Err(e) => error_to_response(e),
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Response {
    Json::<CacheStats>(state.store.stats().await).into_response()
}

async fn config_summary(State(state): State<Arc<AppState>>) -> Response {
    Json(state.config_summary.clone()).into_response()
}

async fn list_refs(State(state): State<Arc<AppState>>) -> Response {
    match state.refs.list().await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_to_response(e),
    }
}

#[derive(Serialize)]
struct UploadResponse {
    uploaded: Vec<String>,
}

/// Accept one or more `files` form fields and store each under a
/// generated name. Any rejected file fails the whole request.
async fn upload_refs(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut uploaded = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("files") {
                    continue;
                }
                let file_name = field.file_name().unwrap_or("").to_string();
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return json_error(
                            StatusCode::BAD_REQUEST,
                            &format!("reading upload failed: {e}"),
                        )
                    }
                };
                match state.refs.save(&file_name, bytes.to_vec()).await {
                    Ok(stored) => uploaded.push(stored),
                    Err(e) => return error_to_response(e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("reading form failed: {e}"))
            }
        }
    }
    if uploaded.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "no files in upload");
    }
    Json(UploadResponse { uploaded }).into_response()
}

async fn delete_ref(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.refs.delete(&name).await {
        Ok(deleted) => Json(DeleteResponse { deleted }).into_response(),
        Err(e) => error_to_response(e),
    }
}

async fn serve_media(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(artifact) = state.store.get(&id).await else {
        return json_error(StatusCode::NOT_FOUND, "unknown artifact");
    };
    match state.store.read_bytes(&id).await {
        Ok(Some(bytes)) => media_response(bytes, content_type_for(&artifact.ext)),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "unknown artifact"),
        Err(e) => error_to_response(e),
    }
}

async fn serve_ref(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.refs.read(&name).await {
        Ok(bytes) => {
            let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("png");
            media_response(bytes, content_type_for(ext))
        }
        Err(GenError::Cache(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            json_error(StatusCode::NOT_FOUND, "unknown reference image")
        }
        Err(e) => error_to_response(e),
    }
}

/// Media bytes with a no-referrer policy so a token-bearing admin page
/// URL never leaks through the Referer header of embedded media.
fn media_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    let mut response = (StatusCode::OK, bytes).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.headers_mut().insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::providers::MediaKind;
    use tempfile::TempDir;

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"tok", b"tok"));
        assert!(!constant_time_eq(b"tok", b"toX"));
        assert!(!constant_time_eq(b"tok", b"token"));
    }

    #[test]
    fn configured_token_wins_over_generation() {
        assert_eq!(resolve_token("0.0.0.0", Some("abc")), "abc");
    }

    #[test]
    fn blank_token_gets_generated() {
        let token = resolve_token("0.0.0.0", Some("  "));
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("[::1]"));
        assert!(!is_loopback_host("0.0.0.0"));
        assert!(!is_loopback_host("192.168.1.5"));
    }

    fn test_controller(
        providers: Vec<crate::providers::Provider>,
        order: Vec<ProviderId>,
        store: Arc<ArtifactStore>,
    ) -> Arc<FailoverController> {
        let pool = crate::keypool::KeyPool::new();
        for id in &order {
            pool.seed(*id, &["test-key".to_string()]);
        }
        let fetcher = crate::net::SafeFetcher::new(&crate::net::fetch::NetworkConfig {
            trusted_hosts: vec!["127.0.0.1".into(), "localhost".into()],
            ..Default::default()
        })
        .unwrap();
        Arc::new(FailoverController::new(
            providers,
            crate::failover::FailoverPolicy {
                enabled: true,
                order,
            },
            Arc::new(pool),
            fetcher,
            crate::net::RetryPolicy::with_max_attempts(1),
            store,
        ))
    }

    async fn spawn_test_server_with(
        token: &str,
        providers: Vec<crate::providers::Provider>,
        order: Vec<ProviderId>,
    ) -> (SocketAddr, Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ArtifactStore::open(dir.path().join("cache"), CacheLimits::unlimited())
                .await
                .unwrap(),
        );
        let refs = Arc::new(
            RefLibrary::open(dir.path().join("refs")).await.unwrap(),
        );
        let controller = test_controller(providers, order, store.clone());
        let summary = ConfigSummary::from_config(&Config::default());
        let state = new_state(store, refs, controller, token.to_string(), summary);
        let addr = start_server(state.clone(), "127.0.0.1", 0).await.unwrap();
        (addr, state, dir)
    }

    async fn spawn_test_server(token: &str) -> (SocketAddr, Arc<AppState>, TempDir) {
        spawn_test_server_with(token, Vec::new(), vec![ProviderId::Gitee]).await
    }

    #[tokio::test]
    async fn requests_without_token_are_rejected() {
        let (addr, _state, _dir) = spawn_test_server("tok-1").await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/api/artifacts"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let resp = client
            .get(format!("http://{addr}/api/artifacts?token=wrong"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn bearer_and_query_tokens_are_accepted() {
        let (addr, _state, _dir) = spawn_test_server("tok-2").await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/api/artifacts"))
            .bearer_auth("tok-2")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client
            .get(format!("http://{addr}/api/artifacts?token=tok-2"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn media_endpoint_sets_no_referrer_policy() {
        let (addr, state, _dir) = spawn_test_server("tok-3").await;
        let artifact = state
            .store
            .store(
                b"\x89PNG\r\n\x1a\nweb".to_vec(),
                MediaKind::Image,
                ProviderId::Gitee,
                "z-image-turbo",
                "a fox",
            )
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/media/{}", artifact.id))
            .bearer_auth("tok-3")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("referrer-policy").unwrap(),
            "no-referrer"
        );
        assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"\x89PNG\r\n\x1a\nweb");
    }

    #[test]
    fn config_summary_never_contains_keys() {
        std::env::set_var("MEDIAFORGE_GITEE_API_KEY", "sk-super-secret");
        let mut config = Config::default();
        config.gemini.api_keys = vec!["gm-secret".to_string()];
        let summary = ConfigSummary::from_config(&config);
        std::env::remove_var("MEDIAFORGE_GITEE_API_KEY");

        let rendered = serde_json::to_string(&summary).unwrap();
        assert!(!rendered.contains("sk-super-secret"));
        assert!(!rendered.contains("gm-secret"));
        let gemini = summary
            .providers
            .iter()
            .find(|p| p.id == ProviderId::Gemini)
            .unwrap();
        assert_eq!(gemini.key_count, 1);
    }

    #[tokio::test]
    async fn generate_rejects_empty_prompt() {
        let (addr, _state, _dir) = spawn_test_server("tok-g1").await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/api/generate"))
            .bearer_auth("tok-g1")
            .json(&serde_json::json!({"prompt": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn generate_end_to_end_stores_an_artifact() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"url": format!("{}/out.png", server.uri())}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/out.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(b"\x89PNG\r\n\x1a\ngen".to_vec()),
            )
            .mount(&server)
            .await;

        let grok = crate::providers::Provider::Grok(
            crate::providers::grok::GrokAdapter::new(crate::providers::grok::GrokSettings {
                base_url: server.uri(),
                ..Default::default()
            })
            .unwrap(),
        );
        let (addr, state, _dir) =
            spawn_test_server_with("tok-g2", vec![grok], vec![ProviderId::Grok]).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/api/generate"))
            .bearer_auth("tok-g2")
            .json(&serde_json::json!({"prompt": "a fox", "provider": "grok"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["provider"], serde_json::json!("grok"));
        let id = body["artifact"]["id"].as_str().unwrap();
        assert!(state.store.get(id).await.is_some());
    }

    fn multipart_body(file_name: &str, bytes: &[u8]) -> (String, Vec<u8>) {
        let boundary = "xxxxboundaryxxxx";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={boundary}"), body)
    }

    #[tokio::test]
    async fn reference_upload_stores_under_a_generated_name() {
        let (addr, state, _dir) = spawn_test_server("tok-5").await;
        let client = reqwest::Client::new();
        let (content_type, body) = multipart_body("me.png", b"\x89PNG\r\n\x1a\nref");
        let resp = client
            .post(format!("http://{addr}/api/refs"))
            .bearer_auth("tok-5")
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        let stored = json["uploaded"][0].as_str().unwrap();
        // The stored name is generated, never the uploader's.
        assert!(stored.starts_with("ref_") && stored.ends_with(".png"));
        assert_ne!(stored, "me.png");
        assert_eq!(
            state.refs.read(stored).await.unwrap(),
            b"\x89PNG\r\n\x1a\nref"
        );
    }

    #[tokio::test]
    async fn reference_upload_rejects_non_image_files() {
        let (addr, state, _dir) = spawn_test_server("tok-6").await;
        let client = reqwest::Client::new();
        let (content_type, body) = multipart_body("notes.txt", b"plain text");
        let resp = client
            .post(format!("http://{addr}/api/refs"))
            .bearer_auth("tok-6")
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(state.refs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn favorite_and_delete_round_trip_over_http() {
        let (addr, state, _dir) = spawn_test_server("tok-4").await;
        let artifact = state
            .store
            .store(
                b"\x89PNG\r\n\x1a\nfav".to_vec(),
                MediaKind::Image,
                ProviderId::Grok,
                "grok-2-image",
                "a cat",
            )
            .await
            .unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/artifacts/{}/favorite", artifact.id))
            .bearer_auth("tok-4")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let updated: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(updated["favorite"], serde_json::json!(true));

        let resp = client
            .delete(format!("http://{addr}/api/artifacts/{}", artifact.id))
            .bearer_auth("tok-4")
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["deleted"], serde_json::json!(true));

        // Second delete is an idempotent no-op.
        let resp = client
            .delete(format!("http://{addr}/api/artifacts/{}", artifact.id))
            .bearer_auth("tok-4")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["deleted"], serde_json::json!(false));
    }
}
