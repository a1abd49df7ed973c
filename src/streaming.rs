use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::constants::{CONTINUE_INSTRUCTION, MAX_STREAM_LINES};
use crate::logging::StreamMetric;
use crate::metrics::MetricsAggregator;
use crate::providers::ProviderTarget;
use crate::specs::openai::{ChatCompletionRequest, ChatMessage};
use crate::sse::{classify_line, SseLine, SseLineBuffer};
use crate::str_utils::prefix_chars;
use crate::types::{parse_provider_line, LineEvent, Result, SitesmithError};

/// Receives the cumulative text after every non-empty delta.
#[async_trait]
pub trait DeltaSink: Send {
    async fn on_delta(&mut self, cumulative: &str) -> Result<()>;
}

/// One streamed completion against one provider.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the full text, seeded with `partial_code` when resuming.
    async fn stream(
        &self,
        target: &ProviderTarget,
        messages: &[ChatMessage],
        partial_code: Option<&str>,
        sink: &mut dyn DeltaSink,
    ) -> Result<String>;
}

/// Appends the continuation turns when resuming from earlier output.
pub fn build_messages(messages: &[ChatMessage], partial_code: Option<&str>) -> Vec<ChatMessage> {
    let mut out = messages.to_vec();
    if let Some(partial) = partial_code.filter(|p| !p.is_empty()) {
        out.push(ChatMessage::assistant(partial));
        out.push(ChatMessage::user(CONTINUE_INSTRUCTION));
    }
    out
}

pub struct ProviderClient {
    http: reqwest::Client,
    metrics: Arc<MetricsAggregator>,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, metrics: Arc<MetricsAggregator>) -> Self {
        Self { http, metrics }
    }
}

#[async_trait]
impl CompletionClient for ProviderClient {
    async fn stream(
        &self,
        target: &ProviderTarget,
        messages: &[ChatMessage],
        partial_code: Option<&str>,
        sink: &mut dyn DeltaSink,
    ) -> Result<String> {
        let provider = target.kind.name();
        let body = ChatCompletionRequest::streaming(&target.model, build_messages(messages, partial_code));

        tracing::info!(
            "[⚙️  -> ☁️ ] {} model={} messages={} resume={}",
            provider,
            target.model,
            body.messages.len(),
            partial_code.map(|p| !p.is_empty()).unwrap_or(false)
        );

        let request = target
            .auth()
            .apply(self.http.post(target.endpoint()), &target.credential)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return Err(SitesmithError::provider(provider, format!("transport error: {}", e)).into())
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                "[☁️  -> ⚙️ ] {} returned HTTP {}: {}",
                provider,
                status,
                prefix_chars(&text, 300)
            );
            return Err(SitesmithError::provider(
                provider,
                format!("HTTP {}: {}", status.as_u16(), prefix_chars(&text, 300)),
            )
            .into());
        }

        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut lines = FramedRead::new(StreamReader::new(byte_stream), SseLineBuffer::default());

        let seed = partial_code.unwrap_or("");
        let mut text = seed.to_string();
        let mut metric = StreamMetric::new();
        let mut line_count = 0usize;
        let mut saw_done = false;

        while let Some(line_result) = lines.next().await {
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                tracing::error!(
                    "[☁️  -> ⚙️ ] {} stream exceeded max line limit ({})",
                    provider,
                    MAX_STREAM_LINES
                );
                return Err(SitesmithError::provider(provider, "stream exceeded max line limit").into());
            }

            let line = match line_result {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] {} stream read error: {}", provider, e);
                    return Err(SitesmithError::provider(provider, format!("stream read failed: {}", e)).into());
                }
            };

            match classify_line(&line) {
                SseLine::Blank | SseLine::Ignored => continue,
                SseLine::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                    saw_done = true;
                    break;
                }
                SseLine::Data(data) => match parse_provider_line(data) {
                    LineEvent::Delta(chunk) => {
                        metric.record_chunk(&chunk);
                        let delta = chunk.text();
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        sink.on_delta(&text).await?;
                    }
                    LineEvent::Error(err) => {
                        tracing::warn!("[☁️  -> ⚙️ ] {} sent an error line: {}", provider, err.error.message);
                        return Err(SitesmithError::provider(provider, err.error.message).into());
                    }
                    LineEvent::Unknown(_) => {
                        metric.record_skipped();
                        self.metrics.record_skipped_line(provider).await;
                    }
                },
            }
        }

        metric.log_summary(provider, &target.model);

        if text.len() == seed.len() {
            return Err(SitesmithError::provider(provider, "stream produced no new text").into());
        }
        if !saw_done {
            tracing::warn!("[☁️  -> ⚙️ ] {} stream ended without [DONE]; keeping accumulated text", provider);
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_build_messages_without_resume() {
        let base = vec![ChatMessage::system("sys"), ChatMessage::user("make a page")];
        assert_eq!(build_messages(&base, None), base);
        assert_eq!(build_messages(&base, Some("")), base);
    }

    #[test]
    fn test_build_messages_with_resume() {
        let base = vec![ChatMessage::system("sys"), ChatMessage::user("make a page")];
        let out = build_messages(&base, Some("FILE: index.html"));
        assert_eq!(out.len(), 4);
        assert_eq!(out[2].role, Role::Assistant);
        assert_eq!(out[2].content, "FILE: index.html");
        assert_eq!(out[3].role, Role::User);
        assert_eq!(out[3].content, CONTINUE_INSTRUCTION);
    }
}
