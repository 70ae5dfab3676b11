//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Run Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Close a connection after this long without any inbound frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Default `limit` for `get_messages` when the client sends none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    /// Upper bound applied to any requested `limit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_history_limit: Option<usize>,

    /// Coalesced records kept per session before the oldest are dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_capacity: Option<usize>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Character budget for `preview` fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_chars: Option<usize>,

    /// Character budget for tool argument summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args_chars: Option<usize>,

    /// Fence language for code actions when the step names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway base URL, e.g. `ws://127.0.0.1:18790`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<u64>,

    /// Messages requested on (re)connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "run_relay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RunRelayError::Io)?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse config text (JSON5).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::RunRelayError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn heartbeat_timeout_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.heartbeat_timeout_secs)
            .unwrap_or(90)
    }

    pub fn history_limit(&self) -> usize {
        self.gateway
            .as_ref()
            .and_then(|g| g.history_limit)
            .unwrap_or(200)
    }

    pub fn max_history_limit(&self) -> usize {
        self.gateway
            .as_ref()
            .and_then(|g| g.max_history_limit)
            .unwrap_or(2000)
    }

    pub fn history_capacity(&self) -> usize {
        self.gateway
            .as_ref()
            .and_then(|g| g.history_capacity)
            .unwrap_or(5000)
    }

    pub fn preview_chars(&self) -> usize {
        self.encoder
            .as_ref()
            .and_then(|e| e.preview_chars)
            .unwrap_or(120)
    }

    pub fn tool_args_chars(&self) -> usize {
        self.encoder
            .as_ref()
            .and_then(|e| e.tool_args_chars)
            .unwrap_or(80)
    }

    pub fn code_language(&self) -> String {
        self.encoder
            .as_ref()
            .and_then(|e| e.code_language.clone())
            .unwrap_or_else(|| "python".to_string())
    }

    /// Gateway URL for observers. Falls back to the local gateway.
    pub fn client_url(&self) -> String {
        self.client
            .as_ref()
            .and_then(|c| c.url.clone())
            .unwrap_or_else(|| format!("ws://127.0.0.1:{}", self.gateway_port()))
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.client
            .as_ref()
            .and_then(|c| c.heartbeat_interval_secs)
            .unwrap_or(30)
    }

    pub fn max_backoff_secs(&self) -> u64 {
        self.client
            .as_ref()
            .and_then(|c| c.max_backoff_secs)
            .unwrap_or(10)
    }

    pub fn client_history_limit(&self) -> usize {
        self.client
            .as_ref()
            .and_then(|c| c.history_limit)
            .unwrap_or(200)
    }

    /// Get a config value by dotted path (e.g. "gateway.port").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if let (Some(default), Some(max)) = (gw.history_limit, gw.max_history_limit) {
                if default > max {
                    warnings.push(format!(
                        "gateway.history_limit ({default}) exceeds max_history_limit ({max}) and will be clamped"
                    ));
                }
            }
            if gw.heartbeat_timeout_secs == Some(0) {
                errors.push("gateway.heartbeat_timeout_secs cannot be 0".to_string());
            }
        }

        if self.preview_chars() == 0 {
            errors.push("encoder.preview_chars cannot be 0".to_string());
        }

        if let Some(client) = &self.client {
            if client.heartbeat_interval_secs == Some(0) {
                errors.push("client.heartbeat_interval_secs cannot be 0".to_string());
            }
            if let Some(url) = &client.url {
                if !url.starts_with("ws://") && !url.starts_with("wss://") {
                    warnings.push(format!("client.url '{url}' is not a ws:// or wss:// URL"));
                }
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Run Relay data: `~/.run_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".run_relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_RR_URL", "ws://relay:9000") };
        let input = r#"{"url": "${TEST_RR_URL}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("ws://relay:9000"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_RR_URL") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_RR_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.preview_chars(), 120);
        assert_eq!(config.history_limit(), 200);
        assert_eq!(config.heartbeat_interval_secs(), 30);
        assert_eq!(config.client_url(), "ws://127.0.0.1:18790");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine
                gateway: { port: 9100, history_limit: 50 },
                encoder: { preview_chars: 40 },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 9100);
        assert_eq!(config.history_limit(), 50);
        assert_eq!(config.preview_chars(), 40);
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(9100)));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_zero_port_errors() {
        let config = Config::parse(r#"{ gateway: { port: 0 } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")), "got: {errors:?}");
    }

    #[test]
    fn test_validate_bad_client_url_warns() {
        let config = Config::parse(r#"{ client: { url: "http://x" } }"#).unwrap();
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("client.url")));
    }
}
