use std::time::Duration;

/// Completion request shape
pub const MAX_TOKENS: u32 = 8192;
pub const TEMPERATURE: f32 = 0.2;

/// Upstream stream guards
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const SYSTEM_PROMPT: &str = "You are an expert web developer. Build the website the user asks for \
as static files (HTML, CSS and JavaScript; Tailwind via CDN is allowed). \
Emit every file as a line of the form `FILE: <relative path>` immediately followed by a fenced code block \
holding the complete file content. Always include an index.html entry point. \
Do not add explanations between files.";

pub const CONTINUE_INSTRUCTION: &str = "Continue exactly where you left off. Do not repeat anything \
you have already written and do not restart the file list.";

pub const TAILWIND_CDN: &str = "https://cdn.tailwindcss.com";

/// Sandbox defaults
pub const DEFAULT_SANDBOX_TEMPLATE: &str = "python:3.12-alpine";
pub const DEFAULT_SANDBOX_PORT: u16 = 8000;
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SERVER_SETTLE: Duration = Duration::from_millis(1500);
pub const DEFAULT_SERVER_RECHECK: Duration = Duration::from_millis(1500);
pub const SITE_ROOT: &str = "/home/user/site";
pub const SANDBOX_LABEL: &str = "sitesmith.managed";
pub const SANDBOX_CREATED_LABEL: &str = "sitesmith.created_at";

/// Database defaults
pub const DB_CLEANUP_RETENTION_DAYS: i64 = 30;
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// History replayed to the model per request
pub const MAX_HISTORY_MESSAGES: i64 = 40;
