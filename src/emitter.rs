use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::streaming::DeltaSink;
use crate::types::{FileSet, Result, SitesmithError, StreamEvent};

/// Forward-only event channel for one request.
///
/// Events reach the consumer in call order. After `error` or `complete` the emitter is
/// closed and every further emission fails; the same happens once the receiving side
/// has gone away.
pub struct StreamEmitter {
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
    disconnected: bool,
    emitted: usize,
}

impl StreamEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            terminated: false,
            disconnected: false,
            emitted: 0,
        }
    }

    /// Emitter plus the receiving end, with room for `buffer` undelivered events.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn status(&mut self, message: impl Into<String>) -> Result<()> {
        self.emit(StreamEvent::Status {
            message: message.into(),
        })
        .await
    }

    pub async fn content(&mut self, cumulative: &str) -> Result<()> {
        self.emit(StreamEvent::Content {
            content: cumulative.to_string(),
        })
        .await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> Result<()> {
        self.emit(StreamEvent::Error {
            message: message.into(),
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &mut self,
        files: FileSet,
        preview_url: String,
        sandbox_id: String,
        provider: String,
        model: String,
        fragment_id: Option<String>,
    ) -> Result<()> {
        self.emit(StreamEvent::Complete {
            files,
            preview_url,
            sandbox_id,
            provider,
            model,
            fragment_id,
        })
        .await
    }

    pub async fn emit(&mut self, event: StreamEvent) -> Result<()> {
        if self.terminated {
            return Err(SitesmithError::internal(format!(
                "emitter closed; dropped {} event",
                event.kind()
            ))
            .into());
        }
        if self.is_disconnected() {
            return Err(SitesmithError::ClientDisconnected.into());
        }

        let terminal = event.is_terminal();
        if terminal {
            self.terminated = true;
        }

        if self.tx.send(event).await.is_err() {
            tracing::debug!("Client disconnected, stopping stream");
            self.disconnected = true;
            return Err(SitesmithError::ClientDisconnected.into());
        }
        self.emitted += 1;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.terminated
    }

    /// True once the consumer dropped its receiver.
    pub fn is_disconnected(&mut self) -> bool {
        if !self.disconnected && self.tx.is_closed() {
            self.disconnected = true;
        }
        self.disconnected
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

#[async_trait]
impl DeltaSink for StreamEmitter {
    async fn on_delta(&mut self, cumulative: &str) -> Result<()> {
        self.content(cumulative).await
    }
}
