//! Turns raw model output into a file set.
//!
//! Three tiers, tried in order: tagged `FILE:` blocks, then the first html/css/js fenced
//! blocks, then the whole text as `index.html`. The last tier always produces a file,
//! so extraction never comes back empty.

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

use crate::constants::TAILWIND_CDN;
use crate::str_utils::normalize_site_path;
use crate::types::FileSet;

const FENCE: &str = "```";

lazy_static! {
    static ref TAGGED_BLOCK: Regex = Regex::new(concat!(
        r"(?im)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*)?[ \t]*FILE:[ \t]*(?:\*\*)?[ \t]*",
        r"`?(?P<path>[^`\r\n*]+?)`?[ \t]*(?:\*\*)?[ \t]*\r?\n\s*",
        r"```(?:html|css|javascript|js|json|svg|xml|markdown|md|text|txt|typescript|tsx|ts|jsx)?[ \t]*\r?\n",
        r"(?P<body>(?s:.*?))```"
    ))
    .expect("Invalid tagged block regex");
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"```(?P<lang>[A-Za-z0-9_+\-]*)[^\n]*\n(?P<body>(?s:.*?))```")
            .expect("Invalid fenced block regex");
    static ref LEADING_FENCE: Regex =
        Regex::new(r"^```[A-Za-z0-9_+\-]*[ \t]*\r?\n?").expect("Invalid leading fence regex");
    static ref HTML_ROOT: Regex =
        Regex::new(r"(?i)<!doctype\s+html|<html[\s>]").expect("Invalid html root regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTier {
    Tagged,
    Generic,
    Raw,
}

impl ExtractionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionTier::Tagged => "tagged",
            ExtractionTier::Generic => "generic",
            ExtractionTier::Raw => "raw",
        }
    }
}

pub fn extract(raw: &str) -> FileSet {
    extract_with_tier(raw).0
}

pub fn extract_with_tier(raw: &str) -> (FileSet, ExtractionTier) {
    let repaired = balance_fences(raw);

    let tagged = extract_tagged(&repaired);
    if !tagged.is_empty() {
        return (tagged, ExtractionTier::Tagged);
    }

    let generic = extract_generic(&repaired);
    if !generic.is_empty() {
        return (generic, ExtractionTier::Generic);
    }

    tracing::warn!(
        "[EXTRACT] No fenced files found in {} chars of output; wrapping raw text",
        raw.len()
    );
    (extract_raw(&repaired), ExtractionTier::Raw)
}

/// Appends a closing fence when the output was cut off inside a code block.
pub fn balance_fences(raw: &str) -> Cow<'_, str> {
    if raw.matches(FENCE).count() % 2 == 0 {
        return Cow::Borrowed(raw);
    }
    let mut repaired = String::with_capacity(raw.len() + 4);
    repaired.push_str(raw);
    if !raw.ends_with('\n') {
        repaired.push('\n');
    }
    repaired.push_str(FENCE);
    Cow::Owned(repaired)
}

fn extract_tagged(text: &str) -> FileSet {
    let mut files = FileSet::new();
    for caps in TAGGED_BLOCK.captures_iter(text) {
        let (Some(path), Some(body)) = (caps.name("path"), caps.name("body")) else {
            continue;
        };
        match normalize_site_path(path.as_str()) {
            Some(p) => files.insert(p, body.as_str().trim()),
            None => tracing::warn!("[EXTRACT] Dropping unsafe file path {:?}", path.as_str()),
        }
    }
    files
}

/// Tier two: the first non-empty html, css and js fences become `index.html`,
/// `styles.css` and `script.js`. An empty fence does not claim its slot.
fn extract_generic(text: &str) -> FileSet {
    let mut files = FileSet::new();
    for caps in FENCED_BLOCK.captures_iter(text) {
        let lang = caps
            .name("lang")
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let body = match caps.name("body") {
            Some(b) => b.as_str().trim(),
            None => continue,
        };
        if body.is_empty() {
            continue;
        }
        let target = match lang.as_str() {
            "html" => "index.html",
            "css" => "styles.css",
            "js" | "javascript" => "script.js",
            _ => continue,
        };
        if files.get(target).is_none() {
            files.insert(target, body);
        }
    }
    files
}

fn extract_raw(text: &str) -> FileSet {
    let content = strip_stray_fences(text);
    let html = if HTML_ROOT.is_match(content) {
        content.to_string()
    } else {
        wrap_document(content)
    };
    let mut files = FileSet::new();
    files.insert("index.html", html);
    files
}

fn strip_stray_fences(text: &str) -> &str {
    let mut s = text.trim();
    loop {
        let before = s.len();
        if let Some(m) = LEADING_FENCE.find(s) {
            s = s[m.end()..].trim_start();
        }
        if let Some(rest) = s.strip_suffix(FENCE) {
            s = rest.trim_end();
        }
        if s.len() == before {
            return s;
        }
    }
}

fn wrap_document(body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
<title>Generated Site</title>\n<script src=\"{}\"></script>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        TAILWIND_CDN, body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_single_file() {
        let files = extract("FILE: index.html\n```html\n<p>hi</p>\n```");
        assert_eq!(files.len(), 1);
        assert_eq!(files.get("index.html"), Some("<p>hi</p>"));
    }

    #[test]
    fn test_tagged_later_block_wins() {
        let raw = "FILE: index.html\n```html\n<p>one</p>\n```\n\nFILE: index.html\n```html\n<p>two</p>\n```\n";
        let files = extract(raw);
        assert_eq!(files.len(), 1);
        assert_eq!(files.get("index.html"), Some("<p>two</p>"));
    }

    #[test]
    fn test_tagged_decorated_headers() {
        let raw = "Here you go.\n\n### FILE: `index.html`\n```html\n<h1>A</h1>\n```\n\
**FILE: ./css/site.css**\n```css\nbody{}\n```\n\
FILE: /js/app.js\n\n```\nconsole.log(1)\n```\n";
        let (files, tier) = extract_with_tier(raw);
        assert_eq!(tier, ExtractionTier::Tagged);
        assert_eq!(files.get("index.html"), Some("<h1>A</h1>"));
        assert_eq!(files.get("css/site.css"), Some("body{}"));
        assert_eq!(files.get("js/app.js"), Some("console.log(1)"));
    }

    #[test]
    fn test_tagged_drops_escaping_paths() {
        let raw = "FILE: ../secret.txt\n```txt\nx\n```\nFILE: index.html\n```html\n<p>ok</p>\n```";
        let files = extract(raw);
        assert_eq!(files.len(), 1);
        assert!(files.get("index.html").is_some());
    }

    #[test]
    fn test_generic_html_block() {
        let (files, tier) = extract_with_tier("Sure!\n```html\n<h1>Hi</h1>\n```\nEnjoy.");
        assert_eq!(tier, ExtractionTier::Generic);
        assert_eq!(files.len(), 1);
        assert_eq!(files.get("index.html"), Some("<h1>Hi</h1>"));
    }

    #[test]
    fn test_generic_takes_first_of_each_kind() {
        let raw = "```css\na{}\n```\n```javascript\nlet a;\n```\n```css\nb{}\n```\n```python\nprint()\n```";
        let files = extract(raw);
        assert_eq!(files.len(), 2);
        assert_eq!(files.get("styles.css"), Some("a{}"));
        assert_eq!(files.get("script.js"), Some("let a;"));
    }

    #[test]
    fn test_generic_empty_block_does_not_claim_slot() {
        let raw = "```html\n  \n```\nThen:\n```html\n<p>real</p>\n```";
        let (files, tier) = extract_with_tier(raw);
        assert_eq!(tier, ExtractionTier::Generic);
        assert_eq!(files.get("index.html"), Some("<p>real</p>"));
    }

    #[test]
    fn test_raw_text_is_wrapped() {
        let (files, tier) = extract_with_tier("Hello world");
        assert_eq!(tier, ExtractionTier::Raw);
        assert_eq!(files.len(), 1);
        let html = files.get("index.html").unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("Hello world"));
        assert!(html.contains(TAILWIND_CDN));
    }

    #[test]
    fn test_raw_document_kept_and_fences_stripped() {
        let raw = "```\n<!DOCTYPE html><html><body>x</body></html>\n```";
        let files = extract(raw);
        assert_eq!(
            files.get("index.html"),
            Some("<!DOCTYPE html><html><body>x</body></html>")
        );
    }

    #[test]
    fn test_truncated_block_is_repaired() {
        let raw = "FILE: index.html\n```html\n<div>cut off";
        let files = extract(raw);
        assert_eq!(files.get("index.html"), Some("<div>cut off"));
    }

    #[test]
    fn test_balance_fences_evens_count() {
        for raw in ["```", "a```b```c```", "```html\nx", "none"] {
            let repaired = balance_fences(raw);
            assert_eq!(repaired.matches(FENCE).count() % 2, 0, "input {:?}", raw);
        }
        assert!(matches!(balance_fences("```a```"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_never_empty() {
        let inputs = [
            "",
            "   ",
            "```",
            "``````",
            "FILE:",
            "FILE: \n```\n```",
            "FILE: ../../x\n```html\nx\n```",
            "```python\nprint(1)\n```",
            "\u{0}\u{1}garbage ``` more",
            "<div>only markup</div>",
        ];
        for raw in inputs {
            let files = extract(raw);
            assert!(!files.is_empty(), "empty result for {:?}", raw);
        }
    }
}
