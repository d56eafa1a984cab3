// engine/config.rs — Recognized configuration keys and their defaults.
//
// The config file is JSON with the section/key names the surrounding app
// writes ("Translation.DefaultEngine", "CloudTranslation.RelayServerUrl", …).
// Every key has a serde default so a partial or absent file still yields a
// working local-only configuration.

use crate::atoms::constants::*;
use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{BackendKind, BackendRoute, DeviceKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(rename = "Translation", default)]
    pub translation: TranslationConfig,
    #[serde(rename = "CloudTranslation", default)]
    pub cloud: CloudConfig,
    #[serde(rename = "CircuitBreaker", default)]
    pub breaker: BreakerSettings,
}

impl EngineConfig {
    /// Load from a JSON file. Missing file is a hard error (callers that
    /// want defaults use `EngineConfig::default()`); malformed content too.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// The ordered backend route for a translate call: the configured
    /// default engine first, the remaining backends as fallbacks. Cloud is
    /// excluded entirely when cloud translation is disabled.
    pub fn route(&self) -> BackendRoute {
        let mut route =
            BackendRoute::with_preferred(self.translation.default_engine, Duration::from_secs(20));
        for hop in &mut route.hops {
            hop.timeout = match hop.backend {
                BackendKind::Local => Duration::from_secs(30),
                BackendKind::Subprocess => Duration::from_secs(SINGLE_READ_TIMEOUT_SECS + 5),
                BackendKind::Cloud => self.cloud.timeout(),
            };
        }
        if !self.cloud.enabled {
            route.hops.retain(|h| h.backend != BackendKind::Cloud);
        }
        route
    }

    /// Retain only the hops the caller has actually wired up.
    pub fn route_for(&self, available: &[BackendKind]) -> BackendRoute {
        let mut route = self.route();
        route.hops.retain(|h| available.contains(&h.backend));
        route
    }
}

// ── Translation section ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(rename = "DefaultEngine", default = "default_engine")]
    pub default_engine: BackendKind,
    /// If true, never spawn the NLLB server — only connect to one already
    /// running (development setups, shared servers).
    #[serde(rename = "UseExternalServer", default)]
    pub use_external_server: bool,
    #[serde(rename = "NLLB200", default)]
    pub nllb200: Nllb200Config,
    #[serde(rename = "OpusMT", default)]
    pub opusmt: OpusmtConfig,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        TranslationConfig {
            default_engine: default_engine(),
            use_external_server: false,
            nllb200: Nllb200Config::default(),
            opusmt: OpusmtConfig::default(),
        }
    }
}

fn default_engine() -> BackendKind {
    BackendKind::Local
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nllb200Config {
    #[serde(rename = "ServerPort", default = "default_nllb_port")]
    pub server_port: u16,
    /// Path to the inference server script, relative to the project root.
    #[serde(rename = "ServerScriptPath", default = "default_nllb_script")]
    pub server_script_path: PathBuf,
    /// Interpreter used to launch the script.
    #[serde(rename = "Interpreter", default = "default_interpreter")]
    pub interpreter: String,
    #[serde(rename = "PortRegistryPath", default = "default_registry_path")]
    pub port_registry_path: PathBuf,
    #[serde(rename = "PoolCapacity", default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(rename = "MaxBatchSize", default = "default_max_batch")]
    pub max_batch_size: usize,
}

impl Default for Nllb200Config {
    fn default() -> Self {
        Nllb200Config {
            server_port: default_nllb_port(),
            server_script_path: default_nllb_script(),
            interpreter: default_interpreter(),
            port_registry_path: default_registry_path(),
            pool_capacity: default_pool_capacity(),
            max_batch_size: default_max_batch(),
        }
    }
}

fn default_nllb_port() -> u16 {
    DEFAULT_NLLB_PORT
}
fn default_nllb_script() -> PathBuf {
    PathBuf::from("scripts/nllb_server.py")
}
fn default_interpreter() -> String {
    "python".into()
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("nllb_ports.json")
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

/// Local OPUS-MT engine settings. Paths are optional: without a model the
/// local backend simply isn't constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusmtConfig {
    #[serde(rename = "ModelPath", default)]
    pub model_path: Option<PathBuf>,
    #[serde(rename = "SourceTokenizerPath", default)]
    pub source_tokenizer_path: Option<PathBuf>,
    #[serde(rename = "TargetTokenizerPath", default)]
    pub target_tokenizer_path: Option<PathBuf>,
    #[serde(rename = "Device", default)]
    pub device: DeviceKind,
    #[serde(rename = "MaxSequenceLength", default = "default_max_seq")]
    pub max_sequence_length: usize,
    #[serde(rename = "MaxOutputLength", default = "default_max_out")]
    pub max_output_length: usize,
    #[serde(rename = "RepetitionPenalty", default = "default_penalty")]
    pub repetition_penalty: f32,
    #[serde(rename = "MinStepsBeforeEos", default = "default_min_steps")]
    pub min_steps_before_eos: usize,
}

impl Default for OpusmtConfig {
    fn default() -> Self {
        OpusmtConfig {
            model_path: None,
            source_tokenizer_path: None,
            target_tokenizer_path: None,
            device: DeviceKind::Cpu,
            max_sequence_length: default_max_seq(),
            max_output_length: default_max_out(),
            repetition_penalty: default_penalty(),
            min_steps_before_eos: default_min_steps(),
        }
    }
}

fn default_max_seq() -> usize {
    DEFAULT_MAX_SEQUENCE_LENGTH
}
fn default_max_out() -> usize {
    DEFAULT_MAX_OUTPUT_LENGTH
}
fn default_penalty() -> f32 {
    DEFAULT_REPETITION_PENALTY
}
fn default_min_steps() -> usize {
    DEFAULT_MIN_STEPS_BEFORE_EOS
}

// ── CloudTranslation section ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(rename = "Enabled", default)]
    pub enabled: bool,
    #[serde(rename = "RelayServerUrl", default = "default_relay_url")]
    pub relay_server_url: String,
    #[serde(rename = "TimeoutSeconds", default = "default_relay_timeout")]
    pub timeout_seconds: u64,
    #[serde(rename = "MaxRetries", default = "default_relay_retries")]
    pub max_retries: u32,
    #[serde(rename = "RetryDelayMs", default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(rename = "PrimaryProviderId", default = "default_primary_provider")]
    pub primary_provider_id: String,
    #[serde(rename = "SecondaryProviderId", default)]
    pub secondary_provider_id: Option<String>,
}

impl CloudConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            enabled: false,
            relay_server_url: default_relay_url(),
            timeout_seconds: default_relay_timeout(),
            max_retries: default_relay_retries(),
            retry_delay_ms: default_retry_delay(),
            primary_provider_id: default_primary_provider(),
            secondary_provider_id: None,
        }
    }
}

fn default_relay_url() -> String {
    "https://relay.honyaku.dev".into()
}
fn default_relay_timeout() -> u64 {
    RELAY_TIMEOUT_SECS
}
fn default_relay_retries() -> u32 {
    RELAY_MAX_RETRIES
}
fn default_retry_delay() -> u64 {
    RELAY_RETRY_DELAY_MS
}
fn default_primary_provider() -> String {
    "gemini".into()
}

// ── Circuit breaker section ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(rename = "FailureThreshold", default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(rename = "CoolDownSeconds", default = "default_breaker_cooldown")]
    pub cool_down_seconds: u64,
}

impl BreakerSettings {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_seconds)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: default_breaker_threshold(),
            cool_down_seconds: default_breaker_cooldown(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    BREAKER_FAILURE_THRESHOLD
}
fn default_breaker_cooldown() -> u64 {
    BREAKER_COOL_DOWN_SECS
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.translation.default_engine, BackendKind::Local);
        assert_eq!(config.translation.nllb200.server_port, 5555);
        assert!(!config.cloud.enabled);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cool_down_seconds, 30);
    }

    #[test]
    fn test_recognized_keys_parse() {
        let raw = r#"{
            "Translation": {
                "DefaultEngine": "Subprocess",
                "UseExternalServer": true,
                "NLLB200": {
                    "ServerPort": 6000,
                    "ServerScriptPath": "server/nllb.py"
                }
            },
            "CloudTranslation": {
                "Enabled": true,
                "RelayServerUrl": "https://relay.example.com",
                "TimeoutSeconds": 12,
                "MaxRetries": 2,
                "RetryDelayMs": 250,
                "PrimaryProviderId": "gemini",
                "SecondaryProviderId": "openai"
            }
        }"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.translation.default_engine, BackendKind::Subprocess);
        assert!(config.translation.use_external_server);
        assert_eq!(config.translation.nllb200.server_port, 6000);
        assert!(config.cloud.enabled);
        assert_eq!(config.cloud.max_retries, 2);
        assert_eq!(config.cloud.secondary_provider_id.as_deref(), Some("openai"));
    }

    #[test]
    fn test_route_respects_default_engine_and_cloud_gate() {
        let mut config = EngineConfig::default();
        config.translation.default_engine = BackendKind::Subprocess;

        // Cloud disabled → cloud hop dropped.
        let route = config.route();
        let order: Vec<_> = route.hops.iter().map(|h| h.backend).collect();
        assert_eq!(order, vec![BackendKind::Subprocess, BackendKind::Local]);

        config.cloud.enabled = true;
        let order: Vec<_> = config.route().hops.iter().map(|h| h.backend).collect();
        assert_eq!(
            order,
            vec![BackendKind::Subprocess, BackendKind::Local, BackendKind::Cloud]
        );
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/honyaku.json")).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
