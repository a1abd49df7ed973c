use std::sync::Arc;
use std::time::Instant;

use crate::constants::{MAX_HISTORY_MESSAGES, SYSTEM_PROMPT};
use crate::db::{FragmentStore, MessageKind, NewFragment, StoredMessage};
use crate::emitter::StreamEmitter;
use crate::extract::extract_with_tier;
use crate::fallback::FallbackChain;
use crate::sandbox::{SandboxConfig, SandboxManager, SandboxProvider};
use crate::specs::openai::ChatMessage;
use crate::types::{GenerationRequest, GenerationResult, Result, Role, SitesmithError};

/// Drives one request from prompt to preview.
///
/// Exactly one terminal event is emitted per run: `complete` on success, `error` on any
/// fatal path. A sandbox that was created is torn down before the `error` goes out.
pub struct GenerationPipeline {
    chain: FallbackChain,
    store: Arc<dyn FragmentStore>,
    sandboxes: Arc<dyn SandboxProvider>,
    sandbox_config: SandboxConfig,
}

impl GenerationPipeline {
    pub fn new(
        chain: FallbackChain,
        store: Arc<dyn FragmentStore>,
        sandboxes: Arc<dyn SandboxProvider>,
        sandbox_config: SandboxConfig,
    ) -> Self {
        Self {
            chain,
            store,
            sandboxes,
            sandbox_config,
        }
    }

    pub async fn run(
        &self,
        request: GenerationRequest,
        emitter: &mut StreamEmitter,
    ) -> Option<GenerationResult> {
        let start = Instant::now();
        let mut sandbox = SandboxManager::new(self.sandboxes.clone(), self.sandbox_config.clone());

        let outcome = self.drive(&request, emitter, &mut sandbox).await;

        // An undeliverable `complete` counts as a disconnect: the sandbox goes with the request
        let outcome = match outcome {
            Ok(result) => emitter
                .complete(
                    result.files.clone(),
                    result.preview_url.clone(),
                    result.sandbox_id.clone(),
                    result.provider.clone(),
                    result.model.clone(),
                    Some(result.fragment_id.clone()),
                )
                .await
                .map(|_| result),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    "[PIPELINE] Complete for project {} via {} in {:?} ({} files, {:?})",
                    request.project_id,
                    result.provider,
                    start.elapsed(),
                    result.files.len(),
                    result.server_health
                );
                Some(result)
            }
            Err(e) => {
                if sandbox.teardown().await {
                    tracing::info!("[PIPELINE] Sandbox released after failure");
                }
                match &e.inner {
                    SitesmithError::ClientDisconnected => {
                        tracing::info!("[PIPELINE] Client disconnected after {:?}; stopping", start.elapsed());
                    }
                    inner => {
                        tracing::error!("[PIPELINE] Failed after {:?}: {}", start.elapsed(), inner);
                        if let Err(send_err) = emitter.error(inner.user_message()).await {
                            tracing::debug!("[PIPELINE] Could not deliver error event: {}", send_err);
                        }
                    }
                }
                None
            }
        }
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        emitter: &mut StreamEmitter,
        sandbox: &mut SandboxManager,
    ) -> Result<GenerationResult> {
        emitter.status("Loading project history...").await?;
        let messages = self.build_messages(request).await?;

        let chain = self.chain.run(request, &messages, emitter).await?;

        emitter.status("Extracting files...").await?;
        let (files, tier) = extract_with_tier(&chain.text);
        tracing::info!(
            "[PIPELINE] Extracted {} files ({} bytes) using the {} strategy",
            files.len(),
            files.total_bytes(),
            tier.as_str()
        );

        emitter.status("Creating sandbox...").await?;
        sandbox.create(&self.sandbox_config.template).await?;

        emitter.status(format!("Writing {} files...", files.len())).await?;
        sandbox.write_all(&files).await?;

        emitter.status("Starting preview server...").await?;
        let server_health = sandbox.start().await?;
        let preview_url = sandbox.public_url(self.sandbox_config.port).await?;
        let sandbox_id = match sandbox.sandbox_id() {
            Some(id) => id.to_string(),
            None => return Err(SitesmithError::internal("sandbox vanished before persistence").into()),
        };

        emitter.status("Saving...").await?;
        let summary = format!(
            "Generated {} file(s): {}",
            files.len(),
            files.paths().collect::<Vec<_>>().join(", ")
        );
        let message = self
            .store
            .create_message(&request.project_id, Role::Assistant, MessageKind::Result, &summary)
            .await
            .map_err(|e| SitesmithError::Persistence(e.inner.to_string()))?;

        let provider = chain.provider.name().to_string();
        let fragment = self
            .store
            .create_fragment(NewFragment {
                project_id: &request.project_id,
                message_id: &message.id,
                raw_content: &chain.text,
                files: &files,
                sandbox_url: &preview_url,
                sandbox_id: &sandbox_id,
                provider: &provider,
                model: &chain.model,
            })
            .await
            .map_err(|e| SitesmithError::Persistence(e.inner.to_string()))?;

        Ok(GenerationResult {
            files,
            preview_url,
            sandbox_id,
            raw_text: chain.text,
            provider,
            model: chain.model,
            attempts: chain.attempts,
            fragment_id: fragment.id,
            server_health,
        })
    }

    /// System prompt, prior turns, then the new prompt if one was sent.
    async fn build_messages(&self, request: &GenerationRequest) -> Result<Vec<ChatMessage>> {
        let prompt = request
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        let history = match self
            .store
            .load_history(&request.project_id, MAX_HISTORY_MESSAGES)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("[PIPELINE] Could not load history, continuing without it: {}", e);
                Vec::new()
            }
        };

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        messages.extend(history.iter().filter_map(history_message));

        if let Some(prompt) = prompt {
            // A retry after a failed run: the prompt is already the newest stored turn
            let retried = history
                .last()
                .map(|m| m.role == Role::User && m.content == prompt)
                .unwrap_or(false);
            if retried {
                tracing::debug!("[PIPELINE] Prompt already stored for {}; not saving again", request.project_id);
            } else {
                if let Err(e) = self
                    .store
                    .create_message(&request.project_id, Role::User, MessageKind::Text, prompt)
                    .await
                {
                    tracing::warn!("[PIPELINE] Could not save prompt: {}", e);
                }
                messages.push(ChatMessage::user(prompt));
            }
        }

        if !messages.iter().any(|m| m.role == Role::User) {
            return Err(SitesmithError::InvalidRequest(
                "Nothing to generate: send a prompt to start this project".into(),
            )
            .into());
        }
        Ok(messages)
    }
}

fn history_message(message: &StoredMessage) -> Option<ChatMessage> {
    match &message.role {
        Role::System => None,
        role => Some(ChatMessage {
            role: role.clone(),
            content: message.content.clone(),
        }),
    }
}
