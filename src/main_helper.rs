use crate::db::FragmentStore;
use crate::fallback::FallbackChain;
use crate::hardening::ProviderBreakers;
use crate::metrics::MetricsAggregator;
use crate::pipeline::GenerationPipeline;
use crate::providers::Credentials;
use crate::sandbox::docker::DockerSandboxConfig;
use crate::sandbox::{SandboxConfig, SandboxProvider};
use crate::streaming::CompletionClient;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "sitesmith.db")]
    pub database: String,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 60)]
    pub circuit_breaker_recovery_secs: u64,
    /// Image the preview container is created from
    #[arg(long, default_value = crate::constants::DEFAULT_SANDBOX_TEMPLATE)]
    pub sandbox_template: String,
    #[arg(long, default_value_t = crate::constants::DEFAULT_SANDBOX_PORT)]
    pub sandbox_port: u16,
    #[arg(long, default_value_t = 600)]
    pub sandbox_timeout_secs: u64,
    #[arg(long, default_value_t = 1500)]
    pub server_settle_ms: u64,
    #[arg(long, default_value_t = 1500)]
    pub server_recheck_ms: u64,
    #[arg(long, default_value = crate::constants::SITE_ROOT)]
    pub site_root: String,
    /// Hostname put in preview URLs
    #[arg(long, default_value = "localhost")]
    pub preview_host: String,
}

impl Default for Args {
    fn default() -> Self {
        Args::parse_from(["sitesmith"])
    }
}

impl Args {
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            template: self.sandbox_template.clone(),
            port: self.sandbox_port,
            timeout: Duration::from_secs(self.sandbox_timeout_secs),
            settle_delay: Duration::from_millis(self.server_settle_ms),
            recheck_delay: Duration::from_millis(self.server_recheck_ms),
            site_root: self.site_root.clone(),
            url_scheme: "http".to_string(),
        }
    }

    pub fn docker_config(&self) -> DockerSandboxConfig {
        DockerSandboxConfig {
            port: self.sandbox_port,
            site_root: self.site_root.clone(),
            preview_host: self.preview_host.clone(),
        }
    }

    /// Containers older than this are swept at startup.
    pub fn sandbox_max_age(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs.saturating_mul(2))
    }

    pub fn breaker_recovery(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_recovery_secs)
    }
}

/// Cross-request stores, built once in `main` and shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FragmentStore>,
    pub credentials: Arc<Credentials>,
    pub breakers: Arc<ProviderBreakers>,
    pub metrics: Arc<MetricsAggregator>,
    pub completions: Arc<dyn CompletionClient>,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn pipeline(&self) -> GenerationPipeline {
        let chain = FallbackChain::new(
            self.completions.clone(),
            self.credentials.clone(),
            self.breakers.clone(),
            self.metrics.clone(),
        );
        GenerationPipeline::new(
            chain,
            self.store.clone(),
            self.sandboxes.clone(),
            self.args.sandbox_config(),
        )
    }
}
