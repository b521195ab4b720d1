use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_OUTLINE_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_CHAPTER_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Runtime settings read from the environment (and an optional `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Absent keys do not stop the server; LLM operations fail instead.
    pub api_key: Option<String>,
    pub api_url: String,
    pub outline_model: String,
    pub chapter_model: String,
    pub database_path: String,
    pub bind_addr: String,
    pub connect_timeout: Duration,
    /// Idle sessions older than this are dropped.
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let connect_timeout = lookup("LIBROGEN_CONNECT_TIMEOUT_SECS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(30);
        let session_ttl = lookup("LIBROGEN_SESSION_TTL_SECS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(3600);

        Config {
            api_key: lookup("ANTHROPIC_API_KEY").filter(|key| !key.trim().is_empty()),
            api_url: get("ANTHROPIC_API_URL", DEFAULT_API_URL),
            outline_model: get("LIBROGEN_OUTLINE_MODEL", DEFAULT_OUTLINE_MODEL),
            chapter_model: get("LIBROGEN_CHAPTER_MODEL", DEFAULT_CHAPTER_MODEL),
            database_path: get("LIBROGEN_DATABASE", "librogen.db"),
            bind_addr: get("LIBROGEN_BIND", "0.0.0.0:3000"),
            connect_timeout: Duration::from_secs(connect_timeout),
            session_ttl: Duration::from_secs(session_ttl),
        }
    }
}
