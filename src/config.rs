use std::{path::PathBuf, str::FromStr};

use anyhow::{anyhow, Result};

pub const DEFAULT_EMBED_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub embed: Option<EmbedConfig>,
    pub chat: Option<ChatConfig>,
}

#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub model_id: String,
    pub revision: String,
    pub model_dir: Option<PathBuf>,
    pub device: String,
    pub batch_size: usize,
    pub max_len: usize,
    pub normalize: bool,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub backend_url: String,
    pub auth_token: Option<String>,
    pub cookie: Option<String>,
    pub timeout_ms: Option<u64>,
    pub stream_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&var, "PORT", 5000u16)?;

        let embed = if parse_bool_or(&var, "EMBED_ENABLED", true)? {
            let batch_size = parse_or(&var, "EMBED_BATCH_SIZE", 32usize)?;
            if batch_size == 0 {
                return Err(anyhow!("EMBED_BATCH_SIZE must be greater than zero"));
            }
            Some(EmbedConfig {
                model_id: var("EMBED_MODEL").unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string()),
                revision: var("EMBED_MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
                model_dir: var("EMBED_MODEL_DIR").map(PathBuf::from),
                device: var("EMBED_DEVICE").unwrap_or_else(|| "auto".to_string()),
                batch_size,
                max_len: parse_or(&var, "EMBED_MAX_LEN", 512usize)?,
                normalize: parse_bool_or(&var, "EMBED_NORMALIZE", true)?,
            })
        } else {
            None
        };

        let chat = match var("CHAT_BACKEND_URL") {
            Some(backend_url) => {
                let stream_buffer = parse_or(&var, "CHAT_STREAM_BUFFER", 16usize)?;
                if stream_buffer == 0 {
                    return Err(anyhow!("CHAT_STREAM_BUFFER must be greater than zero"));
                }
                Some(ChatConfig {
                    backend_url,
                    auth_token: var("CHAT_AUTH_TOKEN"),
                    cookie: var("CHAT_COOKIE"),
                    timeout_ms: var("CHAT_TIMEOUT_MS")
                        .map(|raw| parse_value::<u64>("CHAT_TIMEOUT_MS", &raw))
                        .transpose()?,
                    stream_buffer,
                })
            }
            None => None,
        };

        Ok(Self {
            host,
            port,
            embed,
            chat,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("invalid value for {key} ({raw:?}): {e}"))
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool_or<V>(var: &V, key: &str, default: bool) -> Result<bool>
where
    V: Fn(&str) -> Option<String>,
{
    let Some(raw) = var(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid value for {key}: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_bind_port_5000_with_embeddings_only() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:5000");
        let embed = cfg.embed.expect("embeddings enabled by default");
        assert_eq!(embed.model_id, DEFAULT_EMBED_MODEL);
        assert_eq!(embed.batch_size, 32);
        assert_eq!(embed.device, "auto");
        assert!(embed.normalize);
        assert!(cfg.chat.is_none());
    }

    #[test]
    fn chat_backend_enables_conversation() {
        let cfg = config_from(&[
            ("CHAT_BACKEND_URL", "http://127.0.0.1:9000/prompt"),
            ("CHAT_TIMEOUT_MS", "2500"),
            ("EMBED_ENABLED", "false"),
        ])
        .unwrap();
        assert!(cfg.embed.is_none());
        let chat = cfg.chat.unwrap();
        assert_eq!(chat.backend_url, "http://127.0.0.1:9000/prompt");
        assert_eq!(chat.timeout_ms, Some(2500));
        assert_eq!(chat.stream_buffer, 16);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config_from(&[("PORT", "  "), ("EMBED_MODEL", "")]).unwrap();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.embed.unwrap().model_id, DEFAULT_EMBED_MODEL);
    }

    #[test]
    fn rejects_malformed_numbers_and_flags() {
        assert!(config_from(&[("PORT", "http")]).is_err());
        assert!(config_from(&[("EMBED_NORMALIZE", "maybe")]).is_err());
        assert!(config_from(&[("EMBED_BATCH_SIZE", "0")]).is_err());
    }
}
