use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;
pub const DEFAULT_DATABASE_PATH: &str = "data/documents.db";
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using the provided \
     context when it is relevant. If the context does not contain the answer, say so.";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAISettings {
    pub api_key: String,
    pub api_base: Option<String>,
    pub embedding_model: String,
    pub chat_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthSettings {
    pub username: String,
    pub password: String,
}

/// Everything the service needs, read once at startup and handed to constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub production: bool,
    pub openai: OpenAISettings,
    pub embedding_dimensions: usize,
    pub database_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub system_prompt: String,
    pub basic_auth: Option<BasicAuthSettings>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let production = get("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));

        let api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let openai = OpenAISettings {
            api_key,
            api_base: get("OPENAI_API_BASE"),
            embedding_model: get("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            chat_model: get("OPENAI_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        };

        let database_path = match get("DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None if production => {
                return Err(ConfigError::Inconsistent(
                    "DATABASE_PATH is required in production".to_string(),
                ))
            }
            None => PathBuf::from(DEFAULT_DATABASE_PATH),
        };

        let basic_auth = match (get("BASIC_AUTH_USERNAME"), get("BASIC_AUTH_PASSWORD")) {
            (Some(username), Some(password)) => Some(BasicAuthSettings { username, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Inconsistent(
                    "BASIC_AUTH_USERNAME and BASIC_AUTH_PASSWORD must be set together".to_string(),
                ))
            }
        };

        let config = Self {
            production,
            openai,
            embedding_dimensions: parse_or(&get, "EMBEDDING_DIMENSIONS", DEFAULT_EMBEDDING_DIMENSIONS)?,
            database_path,
            chunk_size: parse_or(&get, "CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            chunk_overlap: parse_or(&get, "CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
            top_k: parse_or(&get, "RAG_TOP_K", DEFAULT_TOP_K)?,
            system_prompt: get("CHAT_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            basic_auth,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::Inconsistent(
                "EMBEDDING_DIMENSIONS must be positive".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Inconsistent("RAG_TOP_K must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
