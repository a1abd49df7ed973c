//! Ephemeral preview sandboxes.
//!
//! `SandboxProvider` provisions units and `SandboxSession` drives one of them. The
//! `SandboxManager` owns a single session for one request and walks it through
//! create -> write -> start, tearing it down at most once if anything after creation fails.

pub mod docker;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_SANDBOX_PORT, DEFAULT_SANDBOX_TEMPLATE, DEFAULT_SANDBOX_TIMEOUT, DEFAULT_SERVER_RECHECK,
    DEFAULT_SERVER_SETTLE, SITE_ROOT,
};
use crate::types::{FileSet, Result, ServerHealth, SitesmithError};

/// Output of one command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provision one unit from `template`.
    async fn create(&self, template: &str) -> Result<Box<dyn SandboxSession>>;

    /// Removes managed units older than `max_age`. Returns how many were removed.
    async fn sweep_expired(&self, _max_age: Duration) -> Result<usize> {
        Ok(0)
    }
}

#[async_trait]
pub trait SandboxSession: Send + Sync {
    fn id(&self) -> &str;

    /// (Re)arms the unit's lifetime; it is destroyed when the timeout elapses.
    async fn set_timeout(&self, timeout: Duration) -> Result<()>;

    /// Writes `content` to `path` relative to the site root.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Runs a shell command. Background commands return as soon as they are launched.
    async fn run_command(&self, command: &str, background: bool) -> Result<CommandOutput>;

    /// Externally routable `host[:port]` for a port inside the unit.
    async fn host(&self, port: u16) -> Result<String>;

    async fn kill(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Uncreated,
    Created,
    FilesWritten,
    ServerStarting,
    ServerReady,
    ServerDegraded,
    TornDown,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub template: String,
    pub port: u16,
    pub timeout: Duration,
    pub settle_delay: Duration,
    pub recheck_delay: Duration,
    pub site_root: String,
    pub url_scheme: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_SANDBOX_TEMPLATE.to_string(),
            port: DEFAULT_SANDBOX_PORT,
            timeout: DEFAULT_SANDBOX_TIMEOUT,
            settle_delay: DEFAULT_SERVER_SETTLE,
            recheck_delay: DEFAULT_SERVER_RECHECK,
            site_root: SITE_ROOT.to_string(),
            url_scheme: "http".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn server_command(&self) -> String {
        format!(
            "cd {} && python3 -m http.server {} --bind 0.0.0.0",
            self.site_root, self.port
        )
    }

    pub fn probe_command(&self) -> String {
        format!(
            "python3 -c \"import urllib.request; urllib.request.urlopen('http://127.0.0.1:{}/', timeout=3)\"",
            self.port
        )
    }
}

/// Drives one request's sandbox.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    session: Option<Box<dyn SandboxSession>>,
    state: SandboxState,
    teardown_attempted: bool,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        Self {
            provider,
            config,
            session: None,
            state: SandboxState::Uncreated,
            teardown_attempted: false,
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Provisions a unit and arms its timeout.
    ///
    /// A provisioning failure leaves nothing behind. If the timeout cannot be set the new
    /// unit is torn down before the error is returned.
    pub async fn create(&mut self, template: &str) -> Result<()> {
        if self.state != SandboxState::Uncreated {
            return Err(SitesmithError::internal("sandbox already created for this request").into());
        }

        let session = match self.provider.create(template).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("[SANDBOX] {} could not provision {}: {}", self.provider.name(), template, e);
                return Err(SitesmithError::SandboxProvision(e.inner.to_string()).into());
            }
        };
        tracing::info!("[SANDBOX] Created {} from {}", session.id(), template);
        self.session = Some(session);
        self.state = SandboxState::Created;

        let armed = self.session()?.set_timeout(self.config.timeout).await;
        if let Err(e) = armed {
            tracing::error!("[SANDBOX] Failed to set timeout: {}", e);
            self.teardown().await;
            return Err(SitesmithError::SandboxProvision(format!(
                "could not set sandbox timeout: {}",
                e.inner
            ))
            .into());
        }
        Ok(())
    }

    /// Writes every file in key order. Stops at the first failure.
    pub async fn write_all(&mut self, files: &FileSet) -> Result<()> {
        let session = self.session()?;
        for (path, content) in files.iter() {
            if let Err(e) = session.write_file(path, content).await {
                tracing::error!("[SANDBOX] Write of {} failed: {}", path, e);
                return Err(SitesmithError::FileWrite {
                    path: path.to_string(),
                    message: e.inner.to_string(),
                }
                .into());
            }
            tracing::debug!("[SANDBOX] Wrote {} ({} bytes)", path, content.len());
        }
        self.state = SandboxState::FilesWritten;
        Ok(())
    }

    /// Launches the static server and probes it once after the settle delay.
    ///
    /// A failed probe is not fatal: after one more fixed wait the sandbox is reported as
    /// degraded without probing again.
    pub async fn start(&mut self) -> Result<ServerHealth> {
        let command = self.config.server_command();
        let launch = self.session()?.run_command(&command, true).await;
        match launch {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Err(SitesmithError::ServerStart(format!(
                    "server command exited with {}: {}",
                    out.exit_code,
                    crate::str_utils::prefix_chars(&out.stderr, 300)
                ))
                .into())
            }
            Err(e) => return Err(SitesmithError::ServerStart(e.inner.to_string()).into()),
        }
        self.state = SandboxState::ServerStarting;

        tokio::time::sleep(self.config.settle_delay).await;

        let probe = self.session()?.run_command(&self.config.probe_command(), false).await;
        let ready = matches!(&probe, Ok(out) if out.success());
        if ready {
            self.state = SandboxState::ServerReady;
            tracing::info!("[SANDBOX] Server ready on port {}", self.config.port);
            return Ok(ServerHealth::Ready);
        }

        match probe {
            Ok(out) => tracing::warn!(
                "[SANDBOX] Liveness probe failed (exit {}): {}",
                out.exit_code,
                crate::str_utils::prefix_chars(&out.stderr, 200)
            ),
            Err(e) => tracing::warn!("[SANDBOX] Liveness probe errored: {}", e),
        }
        tokio::time::sleep(self.config.recheck_delay).await;
        self.state = SandboxState::ServerDegraded;
        Ok(ServerHealth::Degraded)
    }

    pub async fn public_url(&self, port: u16) -> Result<String> {
        let host = self.session()?.host(port).await?;
        Ok(format!("{}://{}", self.config.url_scheme, host))
    }

    /// Best-effort kill. Runs at most once per session; errors are logged and swallowed.
    /// Returns whether a kill was attempted by this call.
    pub async fn teardown(&mut self) -> bool {
        if self.teardown_attempted {
            return false;
        }
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        self.teardown_attempted = true;
        self.state = SandboxState::TornDown;

        match session.kill().await {
            Ok(()) => tracing::info!("[SANDBOX] Torn down {}", session.id()),
            Err(e) => tracing::warn!("[SANDBOX] Teardown of {} failed: {}", session.id(), e),
        }
        true
    }

    fn session(&self) -> Result<&dyn SandboxSession> {
        match &self.session {
            Some(s) => Ok(s.as_ref()),
            None => Err(SitesmithError::internal("no sandbox session").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        kills: AtomicUsize,
        writes: Mutex<Vec<String>>,
        commands: Mutex<Vec<(String, bool)>>,
    }

    struct FakeSession {
        calls: Arc<Calls>,
        fail_write_on: Option<String>,
        probe_ok: bool,
    }

    #[async_trait]
    impl SandboxSession for FakeSession {
        fn id(&self) -> &str {
            "fake-1"
        }
        async fn set_timeout(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        async fn write_file(&self, path: &str, _content: &str) -> Result<()> {
            if self.fail_write_on.as_deref() == Some(path) {
                return Err(SitesmithError::internal("disk full").into());
            }
            self.calls.writes.lock().unwrap().push(path.to_string());
            Ok(())
        }
        async fn run_command(&self, command: &str, background: bool) -> Result<CommandOutput> {
            self.calls
                .commands
                .lock()
                .unwrap()
                .push((command.to_string(), background));
            let exit_code = if background || self.probe_ok { 0 } else { 1 };
            Ok(CommandOutput {
                exit_code,
                ..Default::default()
            })
        }
        async fn host(&self, port: u16) -> Result<String> {
            Ok(format!("localhost:{}", 40000 + port))
        }
        async fn kill(&self) -> Result<()> {
            self.calls.kills.fetch_add(1, Ordering::SeqCst);
            Err(SitesmithError::internal("already gone").into())
        }
    }

    struct FakeProvider {
        calls: Arc<Calls>,
        fail_write_on: Option<String>,
        probe_ok: bool,
    }

    #[async_trait]
    impl SandboxProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn create(&self, _template: &str) -> Result<Box<dyn SandboxSession>> {
            Ok(Box::new(FakeSession {
                calls: self.calls.clone(),
                fail_write_on: self.fail_write_on.clone(),
                probe_ok: self.probe_ok,
            }))
        }
    }

    fn fast_config() -> SandboxConfig {
        SandboxConfig {
            settle_delay: Duration::from_millis(1),
            recheck_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn manager(calls: &Arc<Calls>, fail_write_on: Option<&str>, probe_ok: bool) -> SandboxManager {
        let provider = FakeProvider {
            calls: calls.clone(),
            fail_write_on: fail_write_on.map(String::from),
            probe_ok,
        };
        SandboxManager::new(Arc::new(provider), fast_config())
    }

    fn files() -> FileSet {
        let mut f = FileSet::new();
        f.insert("script.js", "x");
        f.insert("index.html", "<p>hi</p>");
        f.insert("styles.css", "y");
        f
    }

    #[tokio::test]
    async fn test_happy_path_states() {
        let calls = Arc::new(Calls::default());
        let mut mgr = manager(&calls, None, true);
        mgr.create("python:3.12-alpine").await.unwrap();
        assert_eq!(mgr.state(), SandboxState::Created);
        mgr.write_all(&files()).await.unwrap();
        assert_eq!(mgr.state(), SandboxState::FilesWritten);
        assert_eq!(mgr.start().await.unwrap(), ServerHealth::Ready);
        assert_eq!(mgr.state(), SandboxState::ServerReady);
        assert_eq!(mgr.public_url(8000).await.unwrap(), "http://localhost:48000");

        let writes = calls.writes.lock().unwrap().clone();
        assert_eq!(writes, vec!["index.html", "script.js", "styles.css"]);
        let commands = calls.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].1, "server launch must be backgrounded");
        assert!(!commands[1].1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_degraded_not_fatal() {
        let calls = Arc::new(Calls::default());
        let mut mgr = manager(&calls, None, false);
        mgr.create("t").await.unwrap();
        mgr.write_all(&files()).await.unwrap();
        assert_eq!(mgr.start().await.unwrap(), ServerHealth::Degraded);
        assert_eq!(mgr.state(), SandboxState::ServerDegraded);
        // exactly one probe
        assert_eq!(calls.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_stops_and_teardown_runs_once() {
        let calls = Arc::new(Calls::default());
        let mut mgr = manager(&calls, Some("script.js"), true);
        mgr.create("t").await.unwrap();
        match mgr.write_all(&files()).await {
            Err(e) => match e.inner {
                SitesmithError::FileWrite { path, .. } => assert_eq!(path, "script.js"),
                other => panic!("unexpected error {:?}", other),
            },
            Ok(_) => panic!("write should fail"),
        }
        assert_eq!(calls.writes.lock().unwrap().len(), 1);

        assert!(mgr.teardown().await);
        assert!(!mgr.teardown().await);
        assert_eq!(calls.kills.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), SandboxState::TornDown);
    }

    #[tokio::test]
    async fn test_teardown_without_session_is_noop() {
        let calls = Arc::new(Calls::default());
        let mut mgr = manager(&calls, None, true);
        assert!(!mgr.teardown().await);
        assert_eq!(calls.kills.load(Ordering::SeqCst), 0);
    }
}
