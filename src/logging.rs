use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use std::panic;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_\-]{20,}|Bearer\s+[^\s]+|x-api-key:\s*[^\s]+)"
    )
    .expect("Invalid redaction regex");
}

pub fn redact_secrets(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Writes through to `inner` with credentials masked.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter so a subscriber layer can log through `RedactingWriter`.
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

#[derive(Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub tokens: usize,
    pub text_chars: usize,
    pub skipped_lines: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &crate::types::ProviderChunk) {
        self.chunks += 1;
        if let Some(usage) = &chunk.usage {
            self.tokens = usage.total_tokens as usize;
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.len();
            }
        }
    }

    pub fn record_skipped(&mut self) {
        self.skipped_lines += 1;
    }

    pub fn log_summary(&self, provider: &str, model: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Provider: {} | Model: {} | Chunks: {} | Text: {} chars | Tokens: {} | Skipped: {}",
            provider, model, self.chunks, self.text_chars, self.tokens, self.skipped_lines
        );
        if self.skipped_lines > 0 {
            tracing::warn!(
                "{}",
                format!("[MALFORMED STREAM] {} sent {} unparseable lines", provider, self.skipped_lines)
                    .bold()
                    .yellow()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacting_writer_masks_keys() {
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut out);
            writer
                .write_all(b"auth Bearer abc.def key sk-ABCDEFGHIJKLMNOPQRSTUVWX x-api-key: secret1")
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("abc.def"));
        assert!(!text.contains("sk-ABCDEFGHIJKLMNOPQRSTUVWX"));
        assert!(!text.contains("secret1"));
        assert_eq!(text.matches("[REDACTED]").count(), 3);
    }

    #[test]
    fn test_stream_metric_counts_text() {
        let chunk: crate::types::ProviderChunk = serde_json::from_str(
            r#"{"choices":[{"index":0,"delta":{"content":"abcd"}}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
        )
        .unwrap();
        let mut metric = StreamMetric::new();
        metric.record_chunk(&chunk);
        metric.record_skipped();
        assert_eq!(metric.chunks, 1);
        assert_eq!(metric.text_chars, 4);
        assert_eq!(metric.tokens, 3);
        assert_eq!(metric.skipped_lines, 1);
    }
}
