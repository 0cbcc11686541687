//! Configuration loading: json5 parsing, `${ENV_VAR}` substitution, and
//! `resolve_*` secret helpers, following the same shape as this workspace's
//! original config layer (optional nested sections, direct-value-or-env-var
//! indirection for secrets).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Base directory for any on-disk state this crate keeps (temp WAV files,
/// default config search path).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("echogate")
}

/// Top-level EchoGate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaper: Option<ReaperConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Load, substituting `${ENV_VAR}` references before json5-parsing.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Config(format!("reading {}: {e}", path.display())))?;
        let substituted = substitute_env_vars(&raw);
        json5::from_str(&substituted)
            .map_err(|e| GatewayError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Load from `path` if given and present, else fall back to defaults
    /// (every section optional, so an all-defaults config is still valid).
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if tokio::fs::try_exists(p).await.unwrap_or(false) => Self::load(p).await,
            _ => Ok(Self::default()),
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn realtime(&self) -> RealtimeConfig {
        self.realtime.clone().unwrap_or_default()
    }

    pub fn transcription(&self) -> TranscriptionConfig {
        self.transcription.clone().unwrap_or_default()
    }

    pub fn auth(&self) -> AuthConfig {
        self.auth.clone().unwrap_or_default()
    }

    pub fn billing(&self) -> BillingConfig {
        self.billing.clone().unwrap_or_default()
    }

    pub fn reaper(&self) -> ReaperConfig {
        self.reaper.clone().unwrap_or_default()
    }
}

/// Substitute `${NAME}` with the environment variable of the same name,
/// leaving the placeholder untouched (rather than erroring) if unset.
pub fn substitute_env_vars(raw: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    re.replace_all(raw, |caps: &regex::Captures| {
        let name = &caps[1];
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
}

fn default_max_connections_per_ip() -> u32 {
    8
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections_per_ip(),
        }
    }
}

/// HTTP/WS transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// URL path prefix under which `/ws`, `/ws-button`, and the HTTP
    /// collaborator routes are mounted. Corresponds to `SERVER_PREFIX`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_prefix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: None,
            server_prefix: None,
            rate_limit: None,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        self.bind.clone().unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8023)
    }

    /// Normalized prefix: no trailing slash, empty string means "mount at root".
    pub fn prefix(&self) -> String {
        let raw = self.server_prefix.as_deref().unwrap_or("");
        raw.trim_end_matches('/').to_string()
    }
}

/// Upstream realtime multimodal model configuration. Corresponds to
/// `OPENAI_API_KEY` plus the model/temperature knobs the source hardcodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Path to the instructions template with a topic placeholder. Falls
    /// back to a built-in default template when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_template_path: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            api_key: None,
            api_key_env: None,
            instructions_template_path: None,
        }
    }
}

impl RealtimeConfig {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| "gpt-4o-realtime-preview-2024-12-17".to_string())
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.6)
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref(), self.api_key_env.as_deref(), "OPENAI_API_KEY")
    }
}

/// Speech-to-text provider configuration, reused as-is from this workspace's
/// existing transcription client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_transcription_provider() -> String {
    "openai".to_string()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref(), self.api_key_env.as_deref(), "OPENAI_API_KEY")
    }
}

/// Authentication configuration for the signed-token session cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_secret_env: None,
            cookie_name: None,
        }
    }
}

impl AuthConfig {
    pub fn resolve_jwt_secret(&self) -> Option<String> {
        resolve_secret(self.jwt_secret.as_deref(), self.jwt_secret_env.as_deref(), "JWT_secret")
    }

    pub fn cookie_name(&self) -> String {
        self.cookie_name.clone().unwrap_or_else(|| "auth_token".to_string())
    }
}

/// Usage-accounting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_starting_balance_seconds: Option<i64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            guest_starting_balance_seconds: None,
        }
    }
}

impl BillingConfig {
    pub fn guest_starting_balance_seconds(&self) -> i64 {
        self.guest_starting_balance_seconds.unwrap_or(120)
    }
}

/// Reaper (C8) scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_timeout_secs: Option<u64>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: None,
            stale_timeout_secs: None,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.unwrap_or(30))
    }

    pub fn stale_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stale_timeout_secs.unwrap_or(10))
    }
}

/// Logging configuration consumed by the CLI entrypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: None,
        }
    }
}

/// Resolve a secret: direct value first, then the named env var, then the
/// conventional fallback env var.
fn resolve_secret(direct: Option<&str>, env_name: Option<&str>, fallback_env: &str) -> Option<String> {
    if let Some(v) = direct {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(name) = env_name {
        if let Ok(v) = std::env::var(name) {
            return Some(v);
        }
    }
    std::env::var(fallback_env).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_env_var() {
        unsafe {
            std::env::set_var("ECHOGATE_TEST_VAR", "sekret");
        }
        let out = substitute_env_vars(r#"{"api_key": "${ECHOGATE_TEST_VAR}"}"#);
        assert_eq!(out, r#"{"api_key": "sekret"}"#);
        unsafe {
            std::env::remove_var("ECHOGATE_TEST_VAR");
        }
    }

    #[test]
    fn leaves_unknown_placeholder_untouched() {
        let out = substitute_env_vars(r#"${ECHOGATE_DEFINITELY_UNSET_VAR}"#);
        assert_eq!(out, r#"${ECHOGATE_DEFINITELY_UNSET_VAR}"#);
    }

    #[test]
    fn defaults_apply_when_sections_absent() {
        let cfg = Config::default();
        assert_eq!(cfg.realtime().model(), "gpt-4o-realtime-preview-2024-12-17");
        assert_eq!(cfg.billing().guest_starting_balance_seconds(), 120);
        assert_eq!(cfg.reaper().stale_timeout().as_secs(), 10);
        assert_eq!(cfg.reaper().interval().as_secs(), 30);
    }

    #[test]
    fn gateway_prefix_strips_trailing_slash() {
        let cfg = GatewayConfig {
            bind: None,
            port: None,
            server_prefix: Some("/voice/".to_string()),
            rate_limit: None,
        };
        assert_eq!(cfg.prefix(), "/voice");
    }

    #[test]
    fn resolve_secret_prefers_direct_value() {
        unsafe {
            std::env::set_var("ECHOGATE_TEST_KEY_ENV", "from-env");
        }
        let resolved = resolve_secret(Some("from-direct"), Some("ECHOGATE_TEST_KEY_ENV"), "OPENAI_API_KEY");
        assert_eq!(resolved.as_deref(), Some("from-direct"));
        unsafe {
            std::env::remove_var("ECHOGATE_TEST_KEY_ENV");
        }
    }

    #[test]
    fn json5_config_round_trips_through_load() {
        let raw = r#"{
            // comments are fine, this is json5
            realtime: { model: "gpt-4o-realtime-preview-2024-12-17", temperature: 0.6 },
            billing: { guest_starting_balance_seconds: 120 },
        }"#;
        let substituted = substitute_env_vars(raw);
        let cfg: Config = json5::from_str(&substituted).unwrap();
        assert_eq!(cfg.realtime().temperature(), 0.6);
    }
}
