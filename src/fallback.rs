use std::sync::Arc;

use crate::emitter::StreamEmitter;
use crate::hardening::ProviderBreakers;
use crate::metrics::MetricsAggregator;
use crate::providers::{CredentialSource, Credentials, ProviderKind, ProviderTarget};
use crate::specs::openai::ChatMessage;
use crate::streaming::CompletionClient;
use crate::types::{AttemptOutcome, GenerationRequest, ProviderAttempt, Result, SitesmithError};

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub text: String,
    pub provider: ProviderKind,
    pub model: String,
    pub attempts: Vec<ProviderAttempt>,
}

/// Sequential provider fallback for one request.
///
/// The request's own provider goes first when it carries both a key and an endpoint.
/// After that every known provider with a server-side credential is tried once, in
/// `ProviderKind::ALL` order. The first full stream wins. Caller-supplied keys never
/// touch the shared breakers, so a bad key only fails its own request.
pub struct FallbackChain {
    client: Arc<dyn CompletionClient>,
    credentials: Arc<Credentials>,
    breakers: Arc<ProviderBreakers>,
    metrics: Arc<MetricsAggregator>,
}

impl FallbackChain {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        credentials: Arc<Credentials>,
        breakers: Arc<ProviderBreakers>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            client,
            credentials,
            breakers,
            metrics,
        }
    }

    /// Ordered attempt list. No provider appears twice.
    pub fn plan(&self, request: &GenerationRequest) -> Vec<ProviderTarget> {
        let requested = ProviderKind::parse(&request.provider);
        let requested_model = Some(request.model.trim()).filter(|m| !m.is_empty());
        let mut targets = Vec::with_capacity(ProviderKind::ALL.len());

        let primary_key = request.api_key.as_deref().filter(|k| !k.trim().is_empty());
        let primary_url = request.base_url.as_deref().filter(|u| !u.trim().is_empty());
        if let (Some(kind), Some(key), Some(url)) = (requested, primary_key, primary_url) {
            targets.push(ProviderTarget {
                kind,
                base_url: url.to_string(),
                model: requested_model
                    .unwrap_or(kind.descriptor().default_model)
                    .to_string(),
                credential: key.to_string(),
                source: CredentialSource::Request,
            });
        }

        for kind in ProviderKind::ALL {
            if targets.iter().any(|t| t.kind == kind) {
                continue;
            }
            let Some(mut target) = self.credentials.target(kind) else {
                tracing::debug!("[CHAIN] Skipping {}: no {} configured", kind, kind.descriptor().credential_env);
                continue;
            };
            if Some(kind) == requested {
                if let Some(model) = requested_model {
                    target.model = model.to_string();
                }
            }
            targets.push(target);
        }

        targets
    }

    pub async fn run(
        &self,
        request: &GenerationRequest,
        messages: &[ChatMessage],
        emitter: &mut StreamEmitter,
    ) -> Result<ChainOutcome> {
        let targets = self.plan(request);
        let mut attempts: Vec<ProviderAttempt> = Vec::with_capacity(targets.len());

        if targets.is_empty() {
            tracing::error!("[CHAIN] No provider has a credential; failing without a network call");
            return Err(SitesmithError::ChainExhausted { attempts: 0 }.into());
        }

        for target in targets {
            let name = target.kind.name();

            let shared = target.uses_shared_breaker();
            if shared && !self.breakers.allows(target.kind).await {
                tracing::warn!("[CHAIN] Skipping {}: circuit breaker open", name);
                self.metrics.record_breaker_skip(name).await;
                continue;
            }

            emitter
                .status(format!("Generating with {} ({})...", name, target.model))
                .await?;
            self.metrics.record_attempt(name).await;
            tracing::info!("[CHAIN] Attempt {} -> {} ({})", attempts.len() + 1, name, target.model);

            let result = self
                .client
                .stream(&target, messages, request.resume_seed(), emitter)
                .await;

            match result {
                Ok(text) => {
                    if shared {
                        self.breakers.record_success(target.kind).await;
                    }
                    self.metrics.record_success(name).await;
                    attempts.push(ProviderAttempt {
                        provider: name.to_string(),
                        model: target.model.clone(),
                        outcome: AttemptOutcome::Success,
                    });
                    tracing::info!("[CHAIN] {} completed with {} chars", name, text.len());
                    return Ok(ChainOutcome {
                        text,
                        provider: target.kind,
                        model: target.model,
                        attempts,
                    });
                }
                Err(e) if matches!(e.inner, SitesmithError::ClientDisconnected) => {
                    tracing::info!("[CHAIN] Client went away during {}; not advancing", name);
                    return Err(e);
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!("[CHAIN] {} failed: {}", name, reason);
                    if shared {
                        self.breakers.record_failure(target.kind).await;
                    }
                    self.metrics.record_failure(name, &reason).await;
                    attempts.push(ProviderAttempt {
                        provider: name.to_string(),
                        model: target.model.clone(),
                        outcome: AttemptOutcome::Failure { reason },
                    });
                }
            }
        }

        tracing::error!("[CHAIN] All providers failed after {} attempts", attempts.len());
        Err(SitesmithError::ChainExhausted {
            attempts: attempts.len(),
        }
        .into())
    }
}
