//! mediaforge service binary.
//!
//! Loads configuration, builds the credential pool, provider adapters,
//! artifact store, and failover controller, then hosts the admin surface
//! and the background maintenance task until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use mediaforge::cache::{ArtifactStore, CacheLimits};
use mediaforge::config::Config;
use mediaforge::failover::{FailoverController, FailoverPolicy};
use mediaforge::keypool::KeyPool;
use mediaforge::maintenance::MaintenanceTask;
use mediaforge::net::SafeFetcher;
use mediaforge::providers::gemini::{GeminiAdapter, GeminiSettings};
use mediaforge::providers::gitee::{GiteeAdapter, GiteeSettings};
use mediaforge::providers::grok::{GrokAdapter, GrokSettings};
use mediaforge::providers::{Provider, ProviderId};
use mediaforge::refs::RefLibrary;
use mediaforge::web::{self, ConfigSummary};

#[derive(Parser, Debug)]
#[command(name = "mediaforge", about = "Media generation orchestrator and artifact cache")]
struct Args {
    /// Path to config file (default: ~/.config/mediaforge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the admin surface bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the admin surface bind port
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_providers(config: &Config) -> Result<Vec<Provider>, Box<dyn std::error::Error>> {
    let mut gitee = GiteeSettings::default();
    if let Some(url) = &config.gitee.base_url {
        gitee.base_url = url.clone();
    }
    if let Some(model) = &config.gitee.model {
        gitee.model = model.clone();
    }
    if let Some(size) = &config.gitee.default_size {
        gitee.default_size = size.clone();
    }
    if let Some(steps) = config.gitee.num_inference_steps {
        gitee.num_inference_steps = Some(steps);
    }
    if let Some(np) = &config.gitee.negative_prompt {
        gitee.negative_prompt = Some(np.clone());
    }

    let mut gemini = GeminiSettings::default();
    if let Some(url) = &config.gemini.base_url {
        gemini.base_url = url.clone();
    }
    if let Some(model) = &config.gemini.model {
        gemini.model = model.clone();
    }
    if let Some(size) = &config.gemini.image_size {
        gemini.image_size = size.clone();
    }
    if let Some(ratio) = &config.gemini.aspect_ratio {
        gemini.aspect_ratio = ratio.clone();
    }

    let mut grok = GrokSettings::default();
    if let Some(url) = &config.grok.base_url {
        grok.base_url = url.clone();
    }
    if let Some(model) = &config.grok.image_model {
        grok.image_model = model.clone();
    }
    if let Some(model) = &config.grok.video_model {
        grok.video_model = model.clone();
    }
    if let Some(size) = &config.grok.default_size {
        grok.default_size = size.clone();
    }

    Ok(vec![
        Provider::Gitee(GiteeAdapter::new(gitee)?),
        Provider::Gemini(GeminiAdapter::new(gemini)?),
        Provider::Grok(GrokAdapter::new(grok)?),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging(args.debug);

    let config = Config::load(args.config.as_deref())?;

    let pool = Arc::new(KeyPool::new());
    for id in [ProviderId::Gitee, ProviderId::Gemini, ProviderId::Grok] {
        let keys = config.api_keys(id);
        if keys.is_empty() {
            log::warn!("no API keys configured for {id}");
        }
        pool.seed(id, &keys);
    }

    let fetcher = SafeFetcher::new(&config.network.fetch_config())?;
    let providers = build_providers(&config)?;

    let cache_dir = config.cache_dir();
    let limits = CacheLimits {
        max_bytes: config.cache.max_bytes,
        max_count: config.cache.max_count as u64,
    };
    let store = Arc::new(ArtifactStore::open(cache_dir.join("artifacts"), limits).await?);
    let refs = Arc::new(RefLibrary::open(cache_dir.join("refs")).await?);

    let controller = Arc::new(FailoverController::new(
        providers,
        FailoverPolicy {
            enabled: config.fallback.enabled,
            order: config.fallback.provider_order(),
        },
        pool,
        fetcher,
        config.network.retry_policy(),
        store.clone(),
    ));

    let host = args.host.unwrap_or_else(|| config.webui.host.clone());
    let port = args.port.unwrap_or(config.webui.port);
    let token = web::resolve_token(&host, config.webui.token.as_deref());
    let summary = ConfigSummary::from_config(&config);
    let state = web::new_state(store.clone(), refs, controller, token, summary);
    web::start_server(state, &host, port).await?;

    let maintenance = MaintenanceTask::spawn(
        store,
        Duration::from_secs(config.cache.maintenance_interval_secs.max(60)),
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    maintenance.stop().await;
    Ok(())
}
