//! Runtime configuration and validation.
//!
//! Invalid configs are rejected with the full list of problems; warnings
//! are surfaced but never block startup. Environment overrides are
//! applied before validation.

use serde::{Deserialize, Serialize};

use crate::backend::BackendTier;
use crate::error::{Error, Result};
use crate::redteam::{GatePolicy, OutputPolicy};
use crate::router::RouteTier;

/// Env var overriding `performance_thresholds.timeout_ms`.
pub const ENV_TIMEOUT_MS: &str = "AI_TIMEOUT_MS";
/// Env var overriding `performance_thresholds.max_concurrent_requests`.
pub const ENV_MAX_CONCURRENT: &str = "AI_MAX_CONCURRENT";
/// Env var overriding `execution_mode`.
pub const ENV_EXECUTION_MODE: &str = "AI_EXECUTION_MODE";

/// Kind of configured provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// OpenAI-compatible chat service (speed tier)
    OpenaiCompatible,
    /// Ollama-style native service (quality tier)
    Ollama,
}

impl ProviderType {
    pub fn tier(&self) -> BackendTier {
        match self {
            Self::OpenaiCompatible => BackendTier::Speed,
            Self::Ollama => BackendTier::Quality,
        }
    }
}

/// One configured inference provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub endpoint: String,
    /// Env var holding the bearer key, if the endpoint wants one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Overall execution bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Fast,
    #[default]
    Auto,
    Quality,
}

impl ExecutionMode {
    /// Tier the router is forced onto, if any.
    pub fn forced_tier(&self) -> Option<RouteTier> {
        match self {
            Self::Fast => Some(RouteTier::Speed),
            Self::Auto => None,
            Self::Quality => Some(RouteTier::Quality),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "auto" => Some(Self::Auto),
            "quality" => Some(Self::Quality),
            _ => None,
        }
    }
}

/// Latency/concurrency thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    /// Token ceiling applied in fast mode
    pub fast_mode_max_tokens: u32,
    /// Per-request timeout in milliseconds, within [5_000, 600_000]
    pub timeout_ms: u64,
    /// Parallel voice invocations, within [1, 10]
    pub max_concurrent_requests: u32,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            fast_mode_max_tokens: 1_024,
            timeout_ms: 180_000,
            max_concurrent_requests: 3,
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enable_sandbox: bool,
    /// Hard input cap, at most 100_000
    pub max_input_length: usize,
    /// Commands tool execution may run; `rm` is always rejected
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// What to do when input analysis crosses the block threshold
    #[serde(default)]
    pub input_policy: GatePolicy,
    /// When output analysis runs
    #[serde(default)]
    pub output_policy: OutputPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_sandbox: true,
            max_input_length: 100_000,
            allowed_commands: Vec::new(),
            input_policy: GatePolicy::default(),
            output_policy: OutputPolicy::default(),
        }
    }
}

/// Streaming settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunk size in tokens, within [1, 1000]
    pub chunk_size: u32,
    pub buffer_size: u32,
    pub enable_backpressure: bool,
    /// Stream timeout in milliseconds, at least 1_000
    pub timeout_ms: u64,
    pub encoding: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            buffer_size: 1_024,
            enable_backpressure: true,
            timeout_ms: 30_000,
            encoding: "utf-8".to_string(),
        }
    }
}

/// Merged runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Tiers tried, in order, after the selected one fails
    #[serde(default)]
    pub fallback_chain: Vec<BackendTier>,
    #[serde(default)]
    pub performance_thresholds: PerformanceThresholds,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderConfig {
                    provider_type: ProviderType::OpenaiCompatible,
                    endpoint: "http://localhost:8080".to_string(),
                    api_key_env: None,
                },
                ProviderConfig {
                    provider_type: ProviderType::Ollama,
                    endpoint: "http://localhost:11434".to_string(),
                    api_key_env: None,
                },
            ],
            execution_mode: ExecutionMode::default(),
            fallback_chain: vec![BackendTier::Quality, BackendTier::Speed],
            performance_thresholds: PerformanceThresholds::default(),
            security: SecurityConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

/// Validation outcome: errors reject, warnings inform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn is_valid_endpoint(endpoint: &str) -> bool {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"));
    match rest {
        Some(host) => !host.is_empty() && !host.starts_with('/'),
        None => false,
    }
}

impl OrchestrationConfig {
    /// Apply `AI_*` environment overrides, returning warnings for values
    /// that could not be parsed.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Ok(value) = std::env::var(ENV_TIMEOUT_MS) {
            match value.parse::<u64>() {
                Ok(ms) => self.performance_thresholds.timeout_ms = ms,
                Err(_) => warnings.push(format!(
                    "{} is not a number: {:?}",
                    ENV_TIMEOUT_MS, value
                )),
            }
        }
        if let Ok(value) = std::env::var(ENV_MAX_CONCURRENT) {
            match value.parse::<u32>() {
                Ok(n) => self.performance_thresholds.max_concurrent_requests = n,
                Err(_) => warnings.push(format!(
                    "{} is not a number: {:?}",
                    ENV_MAX_CONCURRENT, value
                )),
            }
        }
        if let Ok(value) = std::env::var(ENV_EXECUTION_MODE) {
            match ExecutionMode::parse(&value) {
                Some(mode) => self.execution_mode = mode,
                None => warnings.push(format!(
                    "{} must be fast|auto|quality, got {:?}",
                    ENV_EXECUTION_MODE, value
                )),
            }
        }

        warnings
    }

    /// Validate every recognized key, collecting all problems.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.providers.is_empty() {
            report.errors.push("providers must be non-empty".to_string());
        }
        for (i, provider) in self.providers.iter().enumerate() {
            if !is_valid_endpoint(&provider.endpoint) {
                report.errors.push(format!(
                    "providers[{}].endpoint is not a valid http/https URL: {:?}",
                    i, provider.endpoint
                ));
            }
        }

        let t = &self.performance_thresholds;
        if !(5_000..=600_000).contains(&t.timeout_ms) {
            report.errors.push(format!(
                "performance_thresholds.timeout_ms must be within [5000, 600000], got {}",
                t.timeout_ms
            ));
        }
        if !(1..=10).contains(&t.max_concurrent_requests) {
            report.errors.push(format!(
                "performance_thresholds.max_concurrent_requests must be within [1, 10], got {}",
                t.max_concurrent_requests
            ));
        }

        if self.security.max_input_length > 100_000 {
            report.errors.push(format!(
                "security.max_input_length must be at most 100000, got {}",
                self.security.max_input_length
            ));
        }
        if self
            .security
            .allowed_commands
            .iter()
            .any(|c| c.trim() == "rm")
        {
            report
                .errors
                .push("security.allowed_commands must not contain \"rm\"".to_string());
        }

        let s = &self.streaming;
        if !(1..=1_000).contains(&s.chunk_size) {
            report.errors.push(format!(
                "streaming.chunk_size must be within [1, 1000], got {}",
                s.chunk_size
            ));
        }
        if s.timeout_ms < 1_000 {
            report.errors.push(format!(
                "streaming.timeout_ms must be at least 1000, got {}",
                s.timeout_ms
            ));
        }
        if s.buffer_size < s.chunk_size {
            report.warnings.push(format!(
                "streaming.buffer_size {} is smaller than chunk_size {}",
                s.buffer_size, s.chunk_size
            ));
        }

        if self.fallback_chain.is_empty() {
            report
                .warnings
                .push("fallback_chain is empty; failed tiers will not degrade".to_string());
        }
        if !self.security.enable_sandbox && !self.security.allowed_commands.is_empty() {
            report.warnings.push(
                "allowed_commands configured with the sandbox disabled".to_string(),
            );
        }

        report
    }

    /// Validate, returning the config or a `Config` error carrying the
    /// full error list.
    pub fn validated(self) -> Result<Self> {
        let report = self.validate();
        if report.is_ok() {
            Ok(self)
        } else {
            Err(Error::config(report.errors))
        }
    }

    /// Providers serving a tier.
    pub fn providers_for(&self, tier: BackendTier) -> Vec<&ProviderConfig> {
        self.providers
            .iter()
            .filter(|p| p.provider_type.tier() == tier)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let report = OrchestrationConfig::default().validate();
        assert!(report.is_ok(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_all_errors_collected() {
        let config = OrchestrationConfig {
            providers: vec![ProviderConfig {
                provider_type: ProviderType::Ollama,
                endpoint: "ftp://nope".to_string(),
                api_key_env: None,
            }],
            performance_thresholds: PerformanceThresholds {
                timeout_ms: 1_000,
                max_concurrent_requests: 50,
                ..Default::default()
            },
            security: SecurityConfig {
                max_input_length: 200_000,
                allowed_commands: vec!["ls".to_string(), "rm".to_string()],
                ..Default::default()
            },
            streaming: StreamingConfig {
                chunk_size: 0,
                timeout_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };

        let report = config.validate();
        assert_eq!(report.errors.len(), 7);
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_rm_is_rejected() {
        let config = OrchestrationConfig {
            security: SecurityConfig {
                allowed_commands: vec!["git".to_string(), "rm".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("rm")));
    }

    #[test]
    fn test_warnings_do_not_block() {
        let config = OrchestrationConfig {
            fallback_chain: vec![],
            streaming: StreamingConfig {
                chunk_size: 512,
                buffer_size: 64,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = config.validate();
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 2);
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(is_valid_endpoint("http://localhost:8080"));
        assert!(is_valid_endpoint("https://api.example.com/v1"));
        assert!(!is_valid_endpoint("localhost:8080"));
        assert!(!is_valid_endpoint("http://"));
        assert!(!is_valid_endpoint("file:///etc/passwd"));
    }

    #[test]
    fn test_timeout_bounds() {
        for (timeout, ok) in [(5_000, true), (600_000, true), (4_999, false), (600_001, false)] {
            let config = OrchestrationConfig {
                performance_thresholds: PerformanceThresholds {
                    timeout_ms: timeout,
                    ..Default::default()
                },
                ..Default::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "timeout {}", timeout);
        }
    }

    // Env-mutating tests share a lock to avoid cross-test interference.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_env_overrides() {
        let _env = ENV_LOCK.lock().unwrap();
        let mut config = OrchestrationConfig::default();

        std::env::set_var(ENV_TIMEOUT_MS, "30000");
        std::env::set_var(ENV_MAX_CONCURRENT, "5");
        std::env::set_var(ENV_EXECUTION_MODE, "quality");
        let warnings = config.apply_env_overrides();
        std::env::remove_var(ENV_TIMEOUT_MS);
        std::env::remove_var(ENV_MAX_CONCURRENT);
        std::env::remove_var(ENV_EXECUTION_MODE);

        assert!(warnings.is_empty());
        assert_eq!(config.performance_thresholds.timeout_ms, 30_000);
        assert_eq!(config.performance_thresholds.max_concurrent_requests, 5);
        assert_eq!(config.execution_mode, ExecutionMode::Quality);
        assert_eq!(config.execution_mode.forced_tier(), Some(RouteTier::Quality));
    }

    #[test]
    fn test_env_override_parse_warning() {
        let _env = ENV_LOCK.lock().unwrap();
        let mut config = OrchestrationConfig::default();
        std::env::set_var(ENV_EXECUTION_MODE, "warp-speed");
        let warnings = config.apply_env_overrides();
        std::env::remove_var(ENV_EXECUTION_MODE);

        assert_eq!(warnings.len(), 1);
        assert_eq!(config.execution_mode, ExecutionMode::Auto);
    }

    #[test]
    fn test_providers_for_tier() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.providers_for(BackendTier::Speed).len(), 1);
        assert_eq!(config.providers_for(BackendTier::Quality).len(), 1);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = OrchestrationConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestrationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
