//! Plain, serde-derived configuration structs. No file/CLI loading layer
//! is provided here — callers own deserialization (TOML, JSON, env) the
//! way the rest of the workspace does; see `SPEC_FULL.md`'s ambient-stack
//! notes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactConfig {
    #[serde(default)]
    pub sensitive_fields: Vec<String>,
    #[serde(default)]
    pub additional_patterns: Vec<String>,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

fn default_placeholder() -> String {
    "[REDACTED]".to_string()
}

impl Default for RedactConfig {
    fn default() -> Self {
        RedactConfig {
            sensitive_fields: vec!["password".to_string(), "token".to_string(), "secret".to_string()],
            additional_patterns: Vec::new(),
            placeholder: default_placeholder(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

fn default_buffer_size() -> usize {
    1000
}
fn default_channel_size() -> usize {
    64
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            buffer_size: default_buffer_size(),
            channel_size: default_channel_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThresholdRuleConfig {
    pub name: String,
    pub description: String,
    pub filter_action: Option<String>,
    pub filter_table: Option<String>,
    pub filter_role: Option<String>,
    pub group_by: String,
    pub threshold: usize,
    #[serde(with = "duration_seconds")]
    pub window: Duration,
    pub severity: String,
    #[serde(default)]
    pub trigger_rate_limit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CelRuleConfig {
    pub name: String,
    pub description: String,
    pub severity: String,
    #[serde(default)]
    pub trigger_rate_limit: bool,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub threshold_rules: Vec<ThresholdRuleConfig>,
    #[serde(default)]
    pub cel_rules: Vec<CelRuleConfig>,
    #[serde(with = "duration_seconds", default = "default_window")]
    pub window: Duration,
    #[serde(with = "duration_seconds", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            enabled: false,
            threshold_rules: Vec::new(),
            cel_rules: Vec::new(),
            window: default_window(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(with = "duration_seconds", default = "default_window")]
    pub default_window: Duration,
    #[serde(with = "duration_seconds", default = "default_block_duration")]
    pub block_duration: Duration,
    #[serde(default)]
    pub bypass_roles: Vec<String>,
    #[serde(default)]
    pub limits_by_action: HashMap<String, usize>,
    #[serde(default)]
    pub limits_by_table: HashMap<String, usize>,
}

fn default_limit() -> usize {
    100
}
fn default_block_duration() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            enabled: false,
            default_limit: default_limit(),
            default_window: default_window(),
            block_duration: default_block_duration(),
            bypass_roles: Vec::new(),
            limits_by_action: HashMap::new(),
            limits_by_table: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyslogSettings {
    #[serde(default)]
    pub enabled: bool,
    pub transport: Option<String>,
    pub address: Option<String>,
    pub facility: Option<u8>,
    pub app_name: Option<String>,
    #[serde(default)]
    pub tls: bool,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileSettings {
    #[serde(default)]
    pub enabled: bool,
    pub directory: Option<String>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub gzip: bool,
    pub max_file_size: Option<u64>,
    pub max_age_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3ExportSettings {
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub gzip: bool,
    pub partition_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub hash_chain: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub redact: RedactConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub syslog: SyslogSettings,
    #[serde(default)]
    pub file: FileSettings,
    #[serde(default)]
    pub s3: S3ExportSettings,
}

fn default_retention_days() -> i64 {
    365
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            enabled: true,
            hash_chain: true,
            retention_days: default_retention_days(),
            redact: RedactConfig::default(),
            streaming: StreamingConfig::default(),
            alerts: AlertsConfig::default(),
            rate_limit: RateLimitSettings::default(),
            syslog: SyslogSettings::default(),
            file: FileSettings::default(),
            s3: S3ExportSettings::default(),
        }
    }
}

/// Serializes a [`Duration`] as whole seconds.
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
