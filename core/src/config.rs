use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope::HeaderSchema;
use crate::errors::ConfigError;

/// Environment variable holding the YAML configuration when no file is given.
pub const CONFIG_ENV_VAR: &str = "REPLICATOR_CONFIG";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub consumer: ConsumerOptions,
    pub client: ClientOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub bootstrap_servers: Vec<String>,
    pub consumer_group_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub max_poll_interval_ms: u32,
    pub enable_auto_commit: bool,
    pub auto_offset_reset: String,
    pub statistics_interval_ms: u32,
    /// Comma-separated librdkafka debug contexts.
    pub debug: String,
    pub poll_timeout_ms: u64,
    /// Offsets are committed whenever a processed offset is a multiple of this value.
    pub commit_modulo: i64,
    pub header_schema: HeaderSchema,
    pub retry: RetryOptions,
    pub auth: AuthOptions,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            consumer_group_id: "kic".to_string(),
            topics: Vec::new(),
            session_timeout_ms: 45000,
            heartbeat_interval_ms: 3000,
            max_poll_interval_ms: 300000,
            enable_auto_commit: false,
            auto_offset_reset: "earliest".to_string(),
            statistics_interval_ms: 60000,
            debug: String::new(),
            poll_timeout_ms: 100,
            commit_modulo: 10,
            header_schema: HeaderSchema::Versioned,
            retry: RetryOptions::default(),
            auth: AuthOptions::default(),
        }
    }
}

/// Retry bounds for both upstream calls and consumer restarts. `-1` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryOptions {
    pub consumer_max_retries: i32,
    pub operation_max_retries: i32,
    pub backoff_factor: u32,
    pub max_backoff_seconds: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            consumer_max_retries: 2,
            operation_max_retries: 3,
            backoff_factor: 5,
            max_backoff_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthOptions {
    pub enabled: bool,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ca_cert_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientOptions {
    pub enabled: bool,
    pub url: String,
    pub insecure: bool,
    pub enable_oidc_auth: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_endpoint: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            insecure: true,
            enable_oidc_auth: false,
            client_id: None,
            client_secret: None,
            token_endpoint: None,
            request_timeout_secs: 30,
        }
    }
}

pub fn load_config(config_path: Option<&str>) -> Result<ReplicatorConfig, ConfigError> {
    match config_path {
        Some(path) => ReplicatorConfig::from_file(path),
        None => ReplicatorConfig::from_env(),
    }
}

impl ReplicatorConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: CONFIG_ENV_VAR.to_string(),
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ReplicatorConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Collects every violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();
        let consumer = &self.consumer;

        if consumer.bootstrap_servers.iter().all(|s| s.trim().is_empty()) {
            errs.push("bootstrap servers can not be empty".to_string());
        }
        if consumer.topics.iter().all(|t| t.trim().is_empty()) {
            errs.push("topic value can not be empty".to_string());
        }
        if consumer.commit_modulo <= 0 {
            errs.push("commit modulo must be greater than zero".to_string());
        }
        for (name, value) in [
            ("consumer max retries", consumer.retry.consumer_max_retries),
            ("operation max retries", consumer.retry.operation_max_retries),
        ] {
            if value == 0 || value < -1 {
                errs.push(format!("{name} must be -1 (unbounded) or at least 1, got {value}"));
            }
        }

        let client = &self.client;
        if client.enabled {
            if client.url.trim().is_empty() {
                errs.push("inventory url may not be empty".to_string());
            }
            if client.enable_oidc_auth {
                for (name, value) in [
                    ("client id", &client.client_id),
                    ("client secret", &client.client_secret),
                    ("token endpoint", &client.token_endpoint),
                ] {
                    if value.as_deref().is_none_or(|v| v.is_empty()) {
                        errs.push(format!("{name} is required when oidc auth is enabled"));
                    }
                }
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed {
                reason: errs.join("; "),
            })
        }
    }

    /// Logs the effective settings at debug level, leaving out secrets.
    pub fn log_summary(&self) {
        let consumer = &self.consumer;
        debug!(
            bootstrap_servers = %consumer.bootstrap_servers.join(","),
            topics = %consumer.topics.join(","),
            consumer_max_retries = consumer.retry.consumer_max_retries,
            operation_max_retries = consumer.retry.operation_max_retries,
            backoff_factor = consumer.retry.backoff_factor,
            max_backoff_seconds = consumer.retry.max_backoff_seconds,
            "consumer configuration"
        );
        debug!(
            enabled = consumer.auth.enabled,
            security_protocol = ?consumer.auth.security_protocol,
            mechanism = ?consumer.auth.sasl_mechanism,
            username = ?consumer.auth.sasl_username,
            "consumer auth settings"
        );
        if self.client.enabled {
            debug!(
                url = %self.client.url,
                insecure = self.client.insecure,
                token_endpoint = ?self.client.token_endpoint,
                "client configuration"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
consumer:
  bootstrap_servers: ["kafka-0:9092", "kafka-1:9092"]
  topics: ["outbox.event.hbi.hosts"]
  header_schema: legacy
  retry:
    operation_max_retries: -1
client:
  url: "inventory-api:9000"
"#;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.consumer.consumer_group_id, "kic");
        assert_eq!(config.consumer.session_timeout_ms, 45000);
        assert_eq!(config.consumer.auto_offset_reset, "earliest");
        assert_eq!(config.consumer.commit_modulo, 10);
        assert_eq!(
            config.consumer.retry,
            RetryOptions {
                consumer_max_retries: 2,
                operation_max_retries: 3,
                backoff_factor: 5,
                max_backoff_seconds: 30,
            }
        );
        assert!(!config.consumer.auth.enabled);
        assert!(config.client.enabled);
        assert!(config.client.insecure);
    }

    #[test]
    fn test_parse_yaml_keeps_defaults_for_omitted_fields() {
        let config = ReplicatorConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.consumer.bootstrap_servers.len(), 2);
        assert_eq!(config.consumer.header_schema, HeaderSchema::Legacy);
        assert_eq!(config.consumer.retry.operation_max_retries, -1);
        assert_eq!(config.consumer.retry.consumer_max_retries, 2);
        assert_eq!(config.client.url, "inventory-api:9000");
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ReplicatorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.consumer.topics, vec!["outbox.event.hbi.hosts"]);

        let err = ReplicatorConfig::from_file("/nonexistent/replicator.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let mut config = ReplicatorConfig::default();
        config.consumer.retry.consumer_max_retries = 0;
        config.consumer.commit_modulo = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("bootstrap servers"));
        assert!(err.contains("topic value"));
        assert!(err.contains("commit modulo"));
        assert!(err.contains("consumer max retries"));
        assert!(err.contains("inventory url"));
    }

    #[test]
    fn test_validate_client_url_only_required_when_enabled() {
        let mut config = ReplicatorConfig::from_yaml(SAMPLE).unwrap();
        config.client.url.clear();
        assert!(config.validate().is_err());

        config.client.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_oidc_requires_credentials() {
        let mut config = ReplicatorConfig::from_yaml(SAMPLE).unwrap();
        config.client.enable_oidc_auth = true;
        config.client.client_id = Some("svc".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("client secret"));
        assert!(err.contains("token endpoint"));
        assert!(!err.contains("client id"));
    }
}
