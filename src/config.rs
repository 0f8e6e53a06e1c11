use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub bind_addr: String,
    pub frontend_origin: String,
    pub exec_timeout: Duration,
    pub exec_max_output_bytes: usize,
    pub ai: AiConfig,
}

/// Credentials and endpoints for the completion providers. A provider with no
/// key (or no endpoint, for the local one) is treated as unconfigured.
#[derive(Clone, Debug, Default)]
pub struct AiConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub local_endpoint: Option<String>,
    pub local_model: String,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(Self {
            mongo_uri: required("MONGO_URI")?,
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "collab_db".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            jwt_ttl_hours: parsed_or("JWT_TTL_HOURS", 24),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            frontend_origin: env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            exec_timeout: Duration::from_secs(parsed_or("EXEC_TIMEOUT_SECS", 10)),
            exec_max_output_bytes: parsed_or("EXEC_MAX_OUTPUT_BYTES", 64 * 1024),
            ai: AiConfig {
                gemini_api_key: optional("GEMINI_API_KEY"),
                gemini_model: env::var("GEMINI_MODEL")
                    .unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
                openai_api_key: optional("OPENAI_API_KEY"),
                openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                openai_base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string()),
                local_endpoint: optional("AI_LOCAL_ENDPOINT"),
                local_model: env::var("AI_LOCAL_MODEL").unwrap_or_else(|_| "llama3".to_string()),
                request_timeout: Duration::from_secs(parsed_or("AI_TIMEOUT_SECS", 30)),
            },
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

/// Blank values count as unset.
fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_or_falls_back_on_garbage() {
        env::set_var("COLLAB_TEST_GARBAGE_NUMBER", "ten");
        assert_eq!(parsed_or("COLLAB_TEST_GARBAGE_NUMBER", 10u64), 10);
        env::set_var("COLLAB_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(parsed_or("COLLAB_TEST_GOOD_NUMBER", 10u64), 42);
    }

    #[test]
    fn blank_optional_is_unset() {
        env::set_var("COLLAB_TEST_BLANK", "   ");
        assert!(optional("COLLAB_TEST_BLANK").is_none());
        assert!(matches!(
            required("COLLAB_TEST_BLANK"),
            Err(ConfigError::Missing("COLLAB_TEST_BLANK"))
        ));
    }
}
