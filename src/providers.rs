use std::collections::HashMap;
use std::fmt;

/// How a provider expects its credential on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// A custom key header plus fixed extra headers.
    KeyHeader {
        name: &'static str,
        extra: &'static [(&'static str, &'static str)],
    },
}

impl AuthStyle {
    pub fn apply(&self, builder: reqwest::RequestBuilder, credential: &str) -> reqwest::RequestBuilder {
        match self {
            AuthStyle::Bearer => builder.bearer_auth(credential),
            AuthStyle::KeyHeader { name, extra } => {
                let mut builder = builder.header(*name, credential);
                for (key, value) in extra.iter() {
                    builder = builder.header(*key, *value);
                }
                builder
            }
        }
    }

    /// Header pairs this style produces, for logging and tests.
    pub fn header_names(&self) -> Vec<&'static str> {
        match self {
            AuthStyle::Bearer => vec!["authorization"],
            AuthStyle::KeyHeader { name, extra } => {
                let mut names = vec![*name];
                names.extend(extra.iter().map(|(k, _)| *k));
                names
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub base_url: &'static str,
    pub auth: AuthStyle,
    pub default_model: &'static str,
    pub credential_env: &'static str,
    pub base_url_env: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    OpenRouter,
    OpenAi,
    Anthropic,
    Groq,
    Together,
    DeepSeek,
    Mistral,
}

const ANTHROPIC_HEADERS: &[(&str, &str)] =
    &[("anthropic-version", crate::constants::ANTHROPIC_VERSION)];

impl ProviderKind {
    /// Fallback priority order.
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::OpenRouter,
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Groq,
        ProviderKind::Together,
        ProviderKind::DeepSeek,
        ProviderKind::Mistral,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.descriptor().name == needle)
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn descriptor(&self) -> &'static ProviderDescriptor {
        match self {
            ProviderKind::OpenRouter => &ProviderDescriptor {
                name: "openrouter",
                base_url: "https://openrouter.ai/api/v1",
                auth: AuthStyle::Bearer,
                default_model: "openai/gpt-4o-mini",
                credential_env: "OPENROUTER_API_KEY",
                base_url_env: "OPENROUTER_BASE_URL",
            },
            ProviderKind::OpenAi => &ProviderDescriptor {
                name: "openai",
                base_url: "https://api.openai.com/v1",
                auth: AuthStyle::Bearer,
                default_model: "gpt-4o-mini",
                credential_env: "OPENAI_API_KEY",
                base_url_env: "OPENAI_BASE_URL",
            },
            ProviderKind::Anthropic => &ProviderDescriptor {
                name: "anthropic",
                base_url: "https://api.anthropic.com/v1",
                auth: AuthStyle::KeyHeader {
                    name: "x-api-key",
                    extra: ANTHROPIC_HEADERS,
                },
                default_model: "claude-3-5-sonnet-latest",
                credential_env: "ANTHROPIC_API_KEY",
                base_url_env: "ANTHROPIC_BASE_URL",
            },
            ProviderKind::Groq => &ProviderDescriptor {
                name: "groq",
                base_url: "https://api.groq.com/openai/v1",
                auth: AuthStyle::Bearer,
                default_model: "llama-3.3-70b-versatile",
                credential_env: "GROQ_API_KEY",
                base_url_env: "GROQ_BASE_URL",
            },
            ProviderKind::Together => &ProviderDescriptor {
                name: "together",
                base_url: "https://api.together.xyz/v1",
                auth: AuthStyle::Bearer,
                default_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
                credential_env: "TOGETHER_API_KEY",
                base_url_env: "TOGETHER_BASE_URL",
            },
            ProviderKind::DeepSeek => &ProviderDescriptor {
                name: "deepseek",
                base_url: "https://api.deepseek.com/v1",
                auth: AuthStyle::Bearer,
                default_model: "deepseek-chat",
                credential_env: "DEEPSEEK_API_KEY",
                base_url_env: "DEEPSEEK_BASE_URL",
            },
            ProviderKind::Mistral => &ProviderDescriptor {
                name: "mistral",
                base_url: "https://api.mistral.ai/v1",
                auth: AuthStyle::Bearer,
                default_model: "mistral-large-latest",
                credential_env: "MISTRAL_API_KEY",
                base_url_env: "MISTRAL_BASE_URL",
            },
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a target's credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Supplied by the caller on this request only.
    Request,
    /// Loaded from the server environment and shared by every request.
    Server,
}

/// Everything needed to issue one completion call.
#[derive(Clone)]
pub struct ProviderTarget {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub credential: String,
    pub source: CredentialSource,
}

impl ProviderTarget {
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn auth(&self) -> AuthStyle {
        self.kind.descriptor().auth
    }

    /// Only server credentials feed the shared circuit breakers.
    pub fn uses_shared_breaker(&self) -> bool {
        self.source == CredentialSource::Server
    }
}

impl fmt::Debug for ProviderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTarget")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("credential", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub api_key: String,
    pub base_url: Option<String>,
}

/// Server-side provider credentials, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    entries: HashMap<ProviderKind, ProviderCredential>,
}

impl Credentials {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut creds = Self::empty();
        for kind in ProviderKind::ALL {
            let descriptor = kind.descriptor();
            let Some(api_key) = lookup(descriptor.credential_env).filter(|k| !k.trim().is_empty())
            else {
                continue;
            };
            let base_url = lookup(descriptor.base_url_env).filter(|u| !u.trim().is_empty());
            creds.entries.insert(kind, ProviderCredential { api_key, base_url });
        }
        creds
    }

    pub fn with(mut self, kind: ProviderKind, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        self.entries.insert(
            kind,
            ProviderCredential {
                api_key: api_key.into(),
                base_url,
            },
        );
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderCredential> {
        self.entries.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of providers with a configured credential, in priority order.
    pub fn configured(&self) -> Vec<&'static str> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.entries.contains_key(k))
            .map(|k| k.name())
            .collect()
    }

    /// Target for a server-side credentialed provider using its default model.
    pub fn target(&self, kind: ProviderKind) -> Option<ProviderTarget> {
        let cred = self.get(kind)?;
        let descriptor = kind.descriptor();
        Some(ProviderTarget {
            kind,
            base_url: cred
                .base_url
                .clone()
                .unwrap_or_else(|| descriptor.base_url.to_string()),
            model: descriptor.default_model.to_string(),
            credential: cred.api_key.clone(),
            source: CredentialSource::Server,
        })
    }
}
