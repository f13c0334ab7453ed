//! VaultSrv configuration
//!
//! Loaded once at startup from yaml plus `VAULTSRV_`-prefixed environment
//! overrides, then handed to the engine as an immutable value. Drill
//! environments override the ladder delays purely through configuration.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::policy::{EscalationPolicy, PhaseSpec};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub fast_lane: FastLaneConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Ladder configuration: ordered reminder phases plus the terminal-phase
/// templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Internal sweeper period; external schedulers may also hit the sweep
    /// route on their own cadence
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseSpec>,
    #[serde(default = "default_disclosure_template")]
    pub disclosure_template: String,
    #[serde(default = "default_sealed_template")]
    pub sealed_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLaneConfig {
    #[serde(default = "default_code_ttl_minutes")]
    pub code_ttl_minutes: i64,
    #[serde(default = "default_fast_lane_template")]
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// HMAC key for survival tokens; override in every real deployment
    #[serde(default = "default_token_secret")]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Email provider endpoint; channel skipped when absent
    #[serde(default)]
    pub email_endpoint: Option<String>,
    /// SMS provider endpoint; channel skipped when absent
    #[serde(default)]
    pub sms_endpoint: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_service_name() -> String {
    "vaultsrv".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6010
}

fn default_db_path() -> String {
    "data/vaultsrv.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec {
            delay_hours: 72.0,
            template: "absence_reminder_first".to_string(),
        },
        PhaseSpec {
            delay_hours: 48.0,
            template: "absence_reminder_second".to_string(),
        },
        PhaseSpec {
            delay_hours: 24.0,
            template: "absence_reminder_final".to_string(),
        },
    ]
}

fn default_disclosure_template() -> String {
    "message_disclosed".to_string()
}

fn default_sealed_template() -> String {
    "message_remains_sealed".to_string()
}

fn default_code_ttl_minutes() -> i64 {
    10
}

fn default_fast_lane_template() -> String {
    "fast_lane_code".to_string()
}

fn default_token_secret() -> String {
    "dev-only-survival-token-secret".to_string()
}

fn default_notify_timeout_secs() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            phases: default_phases(),
            disclosure_template: default_disclosure_template(),
            sealed_template: default_sealed_template(),
        }
    }
}

impl Default for FastLaneConfig {
    fn default() -> Self {
        Self {
            code_ttl_minutes: default_code_ttl_minutes(),
            template: default_fast_lane_template(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: default_token_secret(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            email_endpoint: None,
            sms_endpoint: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl VaultConfig {
    /// Load from `config/vaultsrv.yaml` (if present) with `VAULTSRV_` env
    /// overrides on top
    pub fn load() -> Result<Self> {
        Self::load_from("config/vaultsrv.yaml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("VAULTSRV_").split("__"))
            .extract()
            .map_err(|e| VaultError::Config(e.to_string()))
    }

    /// Build the immutable policy value the engine is constructed with
    pub fn policy(&self) -> Result<EscalationPolicy> {
        EscalationPolicy::new(
            self.escalation.phases.clone(),
            self.escalation.disclosure_template.clone(),
            self.escalation.sealed_template.clone(),
        )
    }
}
