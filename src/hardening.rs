use crate::providers::ProviderKind;
use crate::types::{Result, SitesmithError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    name: String,
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
        }
    }

    /// Errors while the breaker is open. After the recovery timeout one probe is let through.
    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == CircuitState::Open {
            let last_failure = *self.last_failure_time.read().await;
            if let Some(last) = last_failure {
                if last.elapsed() > self.recovery_timeout {
                    tracing::info!("Circuit breaker for {} transitioning to Half-Open", self.name);
                    *state = CircuitState::HalfOpen;
                    return Ok(());
                }
            }

            return Err(SitesmithError::provider(self.name.clone(), "circuit breaker is open").into());
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker for {} transitioning to CLOSED", self.name);
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        // A failed half-open probe reopens immediately
        let reopen = *state == CircuitState::HalfOpen;
        if (failures >= self.failure_threshold || reopen) && *state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker for {} transitioning to OPEN ({} consecutive failures)",
                self.name,
                failures
            );
            *state = CircuitState::Open;
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// One breaker per known provider, shared across requests.
pub struct ProviderBreakers {
    breakers: HashMap<ProviderKind, CircuitBreaker>,
}

impl ProviderBreakers {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let breakers = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    CircuitBreaker::new(kind.name(), failure_threshold, recovery_timeout),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&CircuitBreaker> {
        self.breakers.get(&kind)
    }

    pub async fn allows(&self, kind: ProviderKind) -> bool {
        match self.get(kind) {
            Some(b) => b.check().await.is_ok(),
            None => true,
        }
    }

    pub async fn record_success(&self, kind: ProviderKind) {
        if let Some(b) = self.get(kind) {
            b.record_success().await;
        }
    }

    pub async fn record_failure(&self, kind: ProviderKind) {
        if let Some(b) = self.get(kind) {
            b.record_failure().await;
        }
    }

    pub async fn snapshot(&self) -> HashMap<&'static str, CircuitState> {
        let mut out = HashMap::new();
        for kind in ProviderKind::ALL {
            if let Some(b) = self.get(kind) {
                out.insert(kind.name(), b.state().await);
            }
        }
        out
    }
}
