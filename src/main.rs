use clap::Parser;
use sitesmith::constants::DB_CLEANUP_RETENTION_DAYS;
use sitesmith::db::{cleanup_old_data, init_db, SqliteStore};
use sitesmith::hardening::ProviderBreakers;
use sitesmith::logging::RedactingMakeWriter;
use sitesmith::metrics::MetricsAggregator;
use sitesmith::providers::Credentials;
use sitesmith::sandbox::docker::DockerSandboxProvider;
use sitesmith::sandbox::SandboxProvider;
use sitesmith::streaming::ProviderClient;
use sitesmith::{api, AppState, Args};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "sitesmith=debug,tower_http=info".into(),
    };

    // JSON lines on disk, secrets scrubbed before they hit the file
    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "sitesmith.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(RedactingMakeWriter::new(non_blocking))
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    sitesmith::logging::setup_panic_hook();

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    {
        let pool = db.clone();
        tokio::spawn(async move {
            if let Err(e) = cleanup_old_data(&pool, DB_CLEANUP_RETENTION_DAYS).await {
                tracing::warn!("Retention cleanup failed: {}", e);
            }
        });
    }

    let credentials = Credentials::from_env();
    if credentials.is_empty() {
        tracing::warn!(
            "No provider API keys found in the environment. Requests must carry apiKey and baseUrl."
        );
    } else {
        tracing::info!("Configured providers: {}", credentials.configured().join(", "));
    }

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let sandboxes = match DockerSandboxProvider::connect(args.docker_config()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!("Failed to connect to Docker: {}", e);
            std::process::exit(1);
        }
    };

    {
        let sweeper = sandboxes.clone();
        let max_age = args.sandbox_max_age();
        tokio::spawn(async move {
            match sweeper.sweep_expired(max_age).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed {} stale sandboxes", n),
                Err(e) => tracing::warn!("Sandbox sweep failed: {}", e),
            }
        });
    }

    let metrics = Arc::new(MetricsAggregator::new());
    let state = Arc::new(AppState {
        store: Arc::new(SqliteStore::new(db)),
        credentials: Arc::new(credentials),
        breakers: Arc::new(ProviderBreakers::new(
            args.circuit_breaker_threshold,
            args.breaker_recovery(),
        )),
        metrics: metrics.clone(),
        completions: Arc::new(ProviderClient::new(client, metrics)),
        sandboxes,
        args: args.clone(),
    });

    let app = api::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Sitesmith listening on {}", addr);
    use futures_util::FutureExt;

    let server_future = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    };

    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(result) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
        }
    }
}
