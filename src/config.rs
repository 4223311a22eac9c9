// src/config.rs
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

use crate::connection::ManagerConfig;
use crate::error::RealtimeError;

fn default_path() -> String {
    "/socket".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_command_buffer() -> usize {
    100
}

fn default_credential_key() -> String {
    crate::credentials::CREDENTIAL_KEY.to_string()
}

fn default_job_event() -> String {
    "job_status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeSettings {
    /// Origin the dashboard is served from, e.g. `https://print.example.com`.
    pub origin: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Full endpoint URL; overrides `origin` + `path` when set.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default = "default_credential_key")]
    pub key: String,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            store_path: None,
            key: default_credential_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_job_event")]
    pub event: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            event: default_job_event(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub jobs: JobSettings,
}

impl Settings {
    /// Load the config from `Settings.toml` plus optional environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Settings")
    }

    /// Load from the given file (extension optional) plus environment overrides
    /// such as `REALTIME__ORIGIN`.
    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::default().separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Parse settings from an in-memory TOML document.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

impl RealtimeSettings {
    /// WebSocket endpoint on the application's own origin.
    pub fn endpoint(&self) -> Result<String, RealtimeError> {
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            return Ok(endpoint.to_string());
        }

        let origin = self.origin.trim().trim_end_matches('/');
        let host = if let Some(rest) = origin.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = origin.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if origin.starts_with("ws://") || origin.starts_with("wss://") {
            origin.to_string()
        } else {
            return Err(RealtimeError::Config(format!(
                "origin must be an http(s) or ws(s) URL, got '{}'",
                self.origin
            )));
        };

        let path = self.path.trim();
        if path.is_empty() {
            Ok(host)
        } else if path.starts_with('/') {
            Ok(format!("{host}{path}"))
        } else {
            Ok(format!("{host}/{path}"))
        }
    }
}

impl TryFrom<&RealtimeSettings> for ManagerConfig {
    type Error = RealtimeError;

    fn try_from(settings: &RealtimeSettings) -> Result<Self, Self::Error> {
        if settings.reconnect_attempts == 0 {
            return Err(RealtimeError::Config(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if settings.connect_timeout_ms == 0 {
            return Err(RealtimeError::Config(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(ManagerConfig {
            endpoint: settings.endpoint()?,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            command_buffer: settings.command_buffer.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_toml(
            r#"
            [realtime]
            origin = "https://print.example.com"
            "#,
        )
        .unwrap();

        let config = ManagerConfig::try_from(&settings.realtime).unwrap();
        assert_eq!(config.endpoint, "wss://print.example.com/socket");
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect_attempts, 10);
        assert_eq!(config.reconnect_delay, Duration::from_millis(1000));
        assert_eq!(settings.credentials.key, "token");
        assert_eq!(settings.jobs.event, "job_status");
    }

    #[test]
    fn plain_http_origin_maps_to_ws() {
        let settings = Settings::from_toml(
            r#"
            [realtime]
            origin = "http://localhost:3000/"
            path = "events"
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.realtime.endpoint().unwrap(),
            "ws://localhost:3000/events"
        );
    }

    #[test]
    fn explicit_endpoint_overrides_origin() {
        let settings = Settings::from_toml(
            r#"
            [realtime]
            origin = "https://print.example.com"
            endpoint = "ws://127.0.0.1:9001/test"
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.realtime.endpoint().unwrap(),
            "ws://127.0.0.1:9001/test"
        );
    }

    #[test]
    fn rejects_unusable_values() {
        let settings = Settings::from_toml(
            r#"
            [realtime]
            origin = "ftp://print.example.com"
            "#,
        )
        .unwrap();
        assert!(matches!(
            ManagerConfig::try_from(&settings.realtime),
            Err(RealtimeError::Config(_))
        ));

        let settings = Settings::from_toml(
            r#"
            [realtime]
            origin = "https://print.example.com"
            reconnect_attempts = 0
            "#,
        )
        .unwrap();
        assert!(ManagerConfig::try_from(&settings.realtime).is_err());
    }
}
