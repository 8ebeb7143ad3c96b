use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub chat: ChatConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tunables for the chat core. All intervals come from the environment so a
/// deployment can shorten them without a rebuild.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// How often the timeout reaper sweeps, in seconds.
    pub reaper_interval_secs: u64,
    /// Sessions idle longer than this are closed with reason `timeout`.
    pub idle_timeout_secs: i64,
    /// Capacity given to newly created agents when none is specified.
    pub default_max_concurrent_chats: i32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0".to_string()),
                port: env_or("SERVER_PORT", 8080),
            },
            database_url,
            chat: ChatConfig {
                reaper_interval_secs: env_or("CHAT_REAPER_INTERVAL_SECS", 300),
                idle_timeout_secs: env_or("CHAT_IDLE_TIMEOUT_SECS", 1800),
                default_max_concurrent_chats: env_or("CHAT_DEFAULT_MAX_CHATS", 5),
            },
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(std::env::var(key).ok(), default)
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_on_missing_or_garbage() {
        assert_eq!(parse_or::<u64>(None, 300), 300);
        assert_eq!(parse_or::<u64>(Some("".to_string()), 300), 300);
        assert_eq!(parse_or::<u64>(Some("banana".to_string()), 300), 300);
        assert_eq!(parse_or::<u64>(Some("45".to_string()), 300), 45);
        assert_eq!(
            parse_or::<String>(Some("127.0.0.1".to_string()), "0.0.0.0".to_string()),
            "127.0.0.1"
        );
    }
}
