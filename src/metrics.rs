//! Per-provider attempt counters.
//!
//! Aggregates attempts, outcomes, skipped stream lines and breaker skips per provider
//! so the fallback behaviour can be inspected at `/debug/providers` without log diving.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped_lines: u64,
    pub breaker_skips: u64,
    pub last_error: Option<String>,
}

pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ProviderMetrics>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record_attempt(&self, provider: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.attempts += 1;
    }

    pub async fn record_success(&self, provider: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.successes += 1;
    }

    pub async fn record_failure(&self, provider: &str, reason: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.failures += 1;
        entry.last_error = Some(crate::str_utils::prefix_chars(reason, 300).to_string());
    }

    /// A data line that could not be parsed and was skipped.
    pub async fn record_skipped_line(&self, provider: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.skipped_lines += 1;
    }

    pub async fn record_breaker_skip(&self, provider: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(provider.to_string()).or_default();
        entry.breaker_skips += 1;
    }

    pub async fn get_metrics(&self, provider: &str) -> Option<ProviderMetrics> {
        self.metrics.read().await.get(provider).cloned()
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, ProviderMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn log_summary(&self) {
        let metrics = self.metrics.read().await;
        if metrics.is_empty() {
            return;
        }

        tracing::info!("=== PROVIDER METRICS ===");
        for (provider, m) in metrics.iter() {
            let failure_rate = if m.attempts > 0 {
                (m.failures as f64 / m.attempts as f64) * 100.0
            } else {
                0.0
            };
            tracing::info!(
                "Provider {}: {} attempts | {} ok | {} failed ({:.1}%) | {} skipped lines | {} breaker skips",
                provider,
                m.attempts,
                m.successes,
                m.failures,
                failure_rate,
                m.skipped_lines,
                m.breaker_skips
            );
        }
        tracing::info!("========================");
    }

    pub async fn reset(&self) {
        self.metrics.write().await.clear();
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
