use crate::constants::{DB_CLEANUP_RETENTION_DAYS, DB_PRAGMAS};
use crate::types::{FileSet, ProjectId, Result, Role, SitesmithError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(SitesmithError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(SitesmithError::Database(e).into()),
    };

    configure_db(&pool).await?;
    migrate(&pool).await?;
    verify_schema_version(&pool).await;

    if let Err(e) = cleanup_old_data(&pool, DB_CLEANUP_RETENTION_DAYS).await {
        tracing::warn!("Database cleanup failed: {}", e);
    }

    Ok(pool)
}

pub async fn migrate(pool: &DbPool) -> Result<()> {
    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        return Err(SitesmithError::internal(format!("Migration failed: {}", e)).into());
    }
    Ok(())
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(SitesmithError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Drops fragments past retention, then messages no fragment points at any more.
pub async fn cleanup_old_data(
    pool: &DbPool,
    retention_days: i64,
) -> std::result::Result<(), sqlx::Error> {
    let threshold = format!("-{} days", retention_days);

    let deleted_fragments =
        sqlx::query("DELETE FROM fragments WHERE created_at < datetime('now', ?)")
            .bind(&threshold)
            .execute(pool)
            .await?;

    let deleted_messages = sqlx::query(
        "DELETE FROM messages WHERE created_at < datetime('now', ?) \
         AND id NOT IN (SELECT message_id FROM fragments)",
    )
    .bind(&threshold)
    .execute(pool)
    .await?;

    if deleted_fragments.rows_affected() > 0 || deleted_messages.rows_affected() > 0 {
        tracing::info!(
            "Cleanup complete: removed {} fragments and {} messages older than {} days.",
            deleted_fragments.rows_affected(),
            deleted_messages.rows_affected(),
            retention_days
        );
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Result,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Result => "result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "result" => Some(MessageKind::Result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub project_id: String,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFragment {
    pub id: String,
    pub project_id: String,
    pub message_id: String,
    pub raw_content: String,
    pub content_sha256: String,
    pub files: FileSet,
    pub sandbox_url: String,
    pub sandbox_id: String,
    pub provider: String,
    pub model: String,
    pub created_at: String,
}

pub struct NewFragment<'a> {
    pub project_id: &'a ProjectId,
    pub message_id: &'a str,
    pub raw_content: &'a str,
    pub files: &'a FileSet,
    pub sandbox_url: &'a str,
    pub sandbox_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
}

/// Durable record of conversation messages and generated fragments.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn create_message(
        &self,
        project_id: &ProjectId,
        role: Role,
        kind: MessageKind,
        content: &str,
    ) -> Result<StoredMessage>;

    async fn create_fragment(&self, fragment: NewFragment<'_>) -> Result<StoredFragment>;

    /// The project's most recent `limit` messages, oldest first.
    async fn load_history(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredMessage>>;

    /// Newest first.
    async fn latest_fragments(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredFragment>>;

    async fn fragment(&self, id: &str) -> Result<Option<StoredFragment>>;

    async fn ping(&self) -> Result<()>;
}

pub fn content_digest(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

const FRAGMENT_COLUMNS: &str = "id, project_id, message_id, raw_content, content_sha256, files_json, \
     sandbox_url, sandbox_id, provider, model, created_at";

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let role: String = row.try_get("role")?;
    let kind: String = row.try_get("kind")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        role: Role::parse(&role)
            .ok_or_else(|| SitesmithError::internal(format!("unknown stored role '{}'", role)))?,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| SitesmithError::internal(format!("unknown stored kind '{}'", kind)))?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn fragment_from_row(row: &SqliteRow) -> Result<StoredFragment> {
    let files_json: String = row.try_get("files_json")?;
    Ok(StoredFragment {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        message_id: row.try_get("message_id")?,
        raw_content: row.try_get("raw_content")?,
        content_sha256: row.try_get("content_sha256")?,
        files: serde_json::from_str(&files_json)?,
        sandbox_url: row.try_get("sandbox_url")?,
        sandbox_id: row.try_get("sandbox_id")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl FragmentStore for SqliteStore {
    async fn create_message(
        &self,
        project_id: &ProjectId,
        role: Role,
        kind: MessageKind,
        content: &str,
    ) -> Result<StoredMessage> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query(
            "INSERT INTO messages (id, project_id, role, kind, content) VALUES (?, ?, ?, ?, ?) \
             RETURNING id, project_id, role, kind, content, created_at",
        )
        .bind(&id)
        .bind(&project_id.0)
        .bind(role.as_str())
        .bind(kind.as_str())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    async fn create_fragment(&self, fragment: NewFragment<'_>) -> Result<StoredFragment> {
        let id = uuid::Uuid::new_v4().to_string();
        let files_json = serde_json::to_string(fragment.files)?;
        let sql = format!(
            "INSERT INTO fragments (id, project_id, message_id, raw_content, content_sha256, files_json, \
             sandbox_url, sandbox_id, provider, model) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            FRAGMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&id)
            .bind(&fragment.project_id.0)
            .bind(fragment.message_id)
            .bind(fragment.raw_content)
            .bind(content_digest(fragment.raw_content))
            .bind(&files_json)
            .bind(fragment.sandbox_url)
            .bind(fragment.sandbox_id)
            .bind(fragment.provider)
            .bind(fragment.model)
            .fetch_one(&self.pool)
            .await?;
        fragment_from_row(&row)
    }

    async fn load_history(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, project_id, role, kind, content, created_at FROM ( \
                 SELECT * FROM messages WHERE project_id = ? ORDER BY seq DESC LIMIT ? \
             ) ORDER BY seq ASC",
        )
        .bind(&project_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn latest_fragments(&self, project_id: &ProjectId, limit: i64) -> Result<Vec<StoredFragment>> {
        let sql = format!(
            "SELECT {} FROM fragments WHERE project_id = ? ORDER BY seq DESC LIMIT ?",
            FRAGMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&project_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fragment_from_row).collect()
    }

    async fn fragment(&self, id: &str) -> Result<Option<StoredFragment>> {
        let sql = format!("SELECT {} FROM fragments WHERE id = ?", FRAGMENT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(r) => Ok(Some(fragment_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
