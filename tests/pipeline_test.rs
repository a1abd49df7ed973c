use async_trait::async_trait;
use sitesmith::db::{init_db, FragmentStore, MessageKind, NewFragment, SqliteStore, StoredFragment, StoredMessage};
use sitesmith::emitter::StreamEmitter;
use sitesmith::fallback::FallbackChain;
use sitesmith::hardening::ProviderBreakers;
use sitesmith::metrics::MetricsAggregator;
use sitesmith::pipeline::GenerationPipeline;
use sitesmith::providers::{Credentials, ProviderKind, ProviderTarget};
use sitesmith::sandbox::{CommandOutput, SandboxConfig, SandboxProvider, SandboxSession};
use sitesmith::specs::openai::ChatMessage;
use sitesmith::streaming::{CompletionClient, DeltaSink};
use sitesmith::types::{
    GenerationRequest, ProjectId, Result, Role, SitesmithError, StreamEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const MODEL_OUTPUT: &str = "Here is your site.\n\nFILE: index.html\n```html\n<!DOCTYPE html><html><body><h1>Bakery</h1></body></html>\n```\n\nFILE: styles.css\n```css\nh1 { color: brown; }\n```\n";

struct CannedClient {
    calls: AtomicUsize,
    seen_messages: Mutex<Vec<ChatMessage>>,
}

impl CannedClient {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen_messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionClient for CannedClient {
    async fn stream(
        &self,
        _target: &ProviderTarget,
        messages: &[ChatMessage],
        _partial_code: Option<&str>,
        sink: &mut dyn DeltaSink,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_messages.lock().unwrap() = messages.to_vec();
        let (head, _) = MODEL_OUTPUT.split_at(40);
        sink.on_delta(head).await?;
        sink.on_delta(MODEL_OUTPUT).await?;
        Ok(MODEL_OUTPUT.to_string())
    }
}

#[derive(Default)]
struct SandboxCalls {
    creates: AtomicUsize,
    kills: AtomicUsize,
    writes: Mutex<Vec<String>>,
}

#[derive(Clone, Copy, Default)]
enum SandboxFault {
    #[default]
    None,
    Provision,
    Timeout,
    Write,
}

struct FakeSandboxes {
    calls: Arc<SandboxCalls>,
    fault: SandboxFault,
}

struct FakeSession {
    calls: Arc<SandboxCalls>,
    fault: SandboxFault,
}

#[async_trait]
impl SandboxProvider for FakeSandboxes {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _template: &str) -> Result<Box<dyn SandboxSession>> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fault, SandboxFault::Provision) {
            return Err(SitesmithError::internal("quota exceeded").into());
        }
        Ok(Box::new(FakeSession {
            calls: self.calls.clone(),
            fault: self.fault,
        }))
    }
}

#[async_trait]
impl SandboxSession for FakeSession {
    fn id(&self) -> &str {
        "sbx-42"
    }

    async fn set_timeout(&self, _timeout: Duration) -> Result<()> {
        if matches!(self.fault, SandboxFault::Timeout) {
            return Err(SitesmithError::internal("timeout api unavailable").into());
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, _content: &str) -> Result<()> {
        if matches!(self.fault, SandboxFault::Write) {
            return Err(SitesmithError::internal("read-only filesystem").into());
        }
        self.calls.writes.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn run_command(&self, _command: &str, _background: bool) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }

    async fn host(&self, port: u16) -> Result<String> {
        Ok(format!("{}-sbx-42.preview.test", port))
    }

    async fn kill(&self) -> Result<()> {
        self.calls.kills.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fault, SandboxFault::Timeout) {
            return Err(SitesmithError::internal("sandbox already gone").into());
        }
        Ok(())
    }
}

/// Delegates to SQLite but refuses to store fragments.
struct FragmentlessStore {
    inner: SqliteStore,
}

#[async_trait]
impl FragmentStore for FragmentlessStore {
    async fn create_message(
        &self,
        project_id: &ProjectId,
        role: Role,
        kind: MessageKind,
        content: &str,
    ) -> Result<StoredMessage> {
        self.inner.create_message(project_id, role, kind, content).await
    }

    async fn create_fragment(&self, _fragment: NewFragment<'_>) -> Result<StoredFragment> {
        Err(SitesmithError::internal("disk I/O error").into())
    }

    async fn load_history(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredMessage>> {
        self.inner.load_history(project_id, limit).await
    }

    async fn latest_fragments(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredFragment>> {
        self.inner.latest_fragments(project_id, limit).await
    }

    async fn fragment(&self, id: &str) -> Result<Option<StoredFragment>> {
        self.inner.fragment(id).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    client: Arc<CannedClient>,
    sandbox_calls: Arc<SandboxCalls>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_db(dir.path().join("pipeline.db")).await.unwrap();
    Harness {
        _dir: dir,
        store: Arc::new(SqliteStore::new(pool)),
        client: Arc::new(CannedClient::new()),
        sandbox_calls: Arc::new(SandboxCalls::default()),
    }
}

impl Harness {
    fn pipeline(
        &self,
        credentials: Credentials,
        store: Arc<dyn FragmentStore>,
        fault: SandboxFault,
    ) -> GenerationPipeline {
        let chain = FallbackChain::new(
            self.client.clone(),
            Arc::new(credentials),
            Arc::new(ProviderBreakers::new(3, Duration::from_secs(60))),
            Arc::new(MetricsAggregator::new()),
        );
        let sandboxes = Arc::new(FakeSandboxes {
            calls: self.sandbox_calls.clone(),
            fault,
        });
        let config = SandboxConfig {
            settle_delay: Duration::from_millis(1),
            recheck_delay: Duration::from_millis(1),
            ..Default::default()
        };
        GenerationPipeline::new(chain, store, sandboxes, config)
    }

    fn kills(&self) -> usize {
        self.sandbox_calls.kills.load(Ordering::SeqCst)
    }
}

fn openai() -> Credentials {
    Credentials::empty().with(ProviderKind::OpenAi, "sk-server", None)
}

fn request(prompt: Option<&str>) -> GenerationRequest {
    GenerationRequest {
        project_id: ProjectId("bakery".to_string()),
        provider: "openai".to_string(),
        model: String::new(),
        api_key: None,
        base_url: None,
        partial_code: None,
        prompt: prompt.map(String::from),
    }
}

async fn run_collect(pipeline: &GenerationPipeline, req: GenerationRequest) -> Vec<StreamEvent> {
    let (mut emitter, mut rx) = StreamEmitter::channel(256);
    pipeline.run(req, &mut emitter).await;
    drop(emitter);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn test_happy_path_ends_with_complete() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::None);

    let events = run_collect(&pipeline, request(Some("a bakery landing page"))).await;

    assert_eq!(terminal_count(&events), 1);
    let Some(StreamEvent::Complete {
        files,
        preview_url,
        sandbox_id,
        provider,
        fragment_id,
        ..
    }) = events.last()
    else {
        panic!("last event should be complete: {:?}", events.last());
    };
    assert_eq!(files.len(), 2);
    assert!(files.get("index.html").unwrap().contains("Bakery"));
    assert_eq!(preview_url, "http://8000-sbx-42.preview.test");
    assert_eq!(sandbox_id, "sbx-42");
    assert_eq!(provider, "openai");

    // Content events carry cumulative text, in order
    let contents: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { content } => Some(content),
            _ => None,
        })
        .collect();
    assert_eq!(contents.len(), 2);
    assert!(contents[1].starts_with(contents[0].as_str()));

    let fragment = h
        .store
        .fragment(fragment_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fragment.sandbox_id, "sbx-42");
    assert_eq!(fragment.raw_content, MODEL_OUTPUT);
    assert_eq!(&fragment.files, files);

    let history = h
        .store
        .load_history(&ProjectId("bakery".to_string()), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].kind, MessageKind::Result);

    assert_eq!(h.kills(), 0);
    assert_eq!(
        h.sandbox_calls.writes.lock().unwrap().clone(),
        vec!["index.html".to_string(), "styles.css".to_string()]
    );
}

#[tokio::test]
async fn test_history_is_replayed_on_next_turn() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::None);

    run_collect(&pipeline, request(Some("a bakery landing page"))).await;
    run_collect(&pipeline, request(Some("make the heading blue"))).await;

    let sent = h.client.seen_messages.lock().unwrap().clone();
    assert_eq!(sent[0].role, Role::System);
    let users: Vec<&str> = sent
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["a bakery landing page", "make the heading blue"]);
    assert_eq!(sent.last().unwrap().content, "make the heading blue");
}

#[tokio::test]
async fn test_write_failure_tears_down_once() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::Write);

    let events = run_collect(&pipeline, request(Some("a page"))).await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert_eq!(h.kills(), 1);
    assert!(h
        .store
        .latest_fragments(&ProjectId("bakery".to_string()), 5)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_persistence_failure_tears_down() {
    let h = harness().await;
    let store = Arc::new(FragmentlessStore {
        inner: SqliteStore::new(h.store.pool().clone()),
    });
    let pipeline = h.pipeline(openai(), store, SandboxFault::None);

    let events = run_collect(&pipeline, request(Some("a page"))).await;

    match events.last() {
        Some(StreamEvent::Error { message }) => assert!(message.contains("could not be saved")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Complete { .. })));
    assert_eq!(h.kills(), 1);
}

#[tokio::test]
async fn test_provision_failure_has_nothing_to_tear_down() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::Provision);

    let events = run_collect(&pipeline, request(Some("a page"))).await;

    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert_eq!(h.sandbox_calls.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.kills(), 0);
}

#[tokio::test]
async fn test_timeout_failure_kills_once_even_when_kill_fails() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::Timeout);

    let events = run_collect(&pipeline, request(Some("a page"))).await;

    assert_eq!(terminal_count(&events), 1);
    match events.last() {
        Some(StreamEvent::Error { message }) => assert!(message.contains("timeout")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Complete { .. })));
    assert_eq!(h.sandbox_calls.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.kills(), 1);
    assert!(h.sandbox_calls.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_zero_credentials_fails_without_sandbox() {
    let h = harness().await;
    let pipeline = h.pipeline(Credentials::empty(), h.store.clone(), SandboxFault::None);

    let events = run_collect(&pipeline, request(Some("a page"))).await;

    let errors: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Content { .. })));
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sandbox_calls.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retried_prompt_is_stored_once() {
    let h = harness().await;
    let failing = h.pipeline(Credentials::empty(), h.store.clone(), SandboxFault::None);
    run_collect(&failing, request(Some("a bakery landing page"))).await;

    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::None);
    let events = run_collect(&pipeline, request(Some("a bakery landing page"))).await;
    assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));

    let sent = h.client.seen_messages.lock().unwrap().clone();
    let users: Vec<&str> = sent
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["a bakery landing page"]);

    let history = h
        .store
        .load_history(&ProjectId("bakery".to_string()), 10)
        .await
        .unwrap();
    let stored_users = history.iter().filter(|m| m.role == Role::User).count();
    assert_eq!(stored_users, 1);
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_missing_prompt_on_new_project_is_rejected() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::None);

    let events = run_collect(&pipeline, request(None)).await;

    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_releases_sandbox() {
    let h = harness().await;
    let pipeline = h.pipeline(openai(), h.store.clone(), SandboxFault::None);

    // Room for one event, so the run cannot get ahead of the client
    let (mut emitter, mut rx) = StreamEmitter::channel(1);
    let client = async move {
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Status { message } = &event {
                if message.starts_with("Writing") {
                    break;
                }
            }
        }
        // rx dropped here: the client hangs up
    };

    let (result, _) = tokio::join!(pipeline.run(request(Some("a page")), &mut emitter), client);

    assert!(result.is_none());
    assert!(emitter.is_disconnected());
    assert_eq!(h.kills(), 1);
}
