use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    Strict,  // Production - secrets plus generated content
    Normal,  // Development - secrets plus large blobs
    Minimal, // Debug - only known secret keys
}

impl Default for RedactionLevel {
    fn default() -> Self {
        match std::env::var("REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            "minimal" => RedactionLevel::Minimal,
            _ => RedactionLevel::Normal,
        }
    }
}

const LARGE_FIELD_CHARS: usize = 500;

fn is_secret_key(k_lower: &str) -> bool {
    k_lower.contains("key")
        || k_lower.contains("auth")
        || k_lower.contains("token")
        || k_lower.contains("secret")
        || k_lower.contains("password")
        || k_lower == "cookie"
}

pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();

                if is_secret_key(&k_lower) {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                match level {
                    RedactionLevel::Strict => {
                        if matches!(
                            k_lower.as_str(),
                            "content" | "raw_content" | "rawcontent" | "partialcode" | "prompt"
                        ) {
                            *val = Value::String("[REDACTED-STRICT]".to_string());
                        } else if k_lower == "files" {
                            redact_file_bodies(val);
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Normal => {
                        let large = val
                            .as_str()
                            .map(|s| s.chars().count() > LARGE_FIELD_CHARS)
                            .unwrap_or(false);
                        if large {
                            *val = Value::String("[REDACTED-LARGE]".to_string());
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Minimal => {
                        redact_value(val, level);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

/// Keeps the path -> size shape of a file map, dropping the bodies.
fn redact_file_bodies(files: &mut Value) {
    if let Value::Object(map) = files {
        for (_, body) in map.iter_mut() {
            let len = body.as_str().map(str::len).unwrap_or(0);
            *body = Value::String(format!("[REDACTED {} bytes]", len));
        }
    }
}
