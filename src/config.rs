//! Configuration for cosci.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (COSCI_HOME, COSCI_LLM_API_KEY, COSCI_TOOLS_API_KEY)
//! 2. Config file (.cosci/config.yaml)
//! 3. Defaults (~/.cosci)
//!
//! Config file discovery:
//! - Searches current directory and parents for .cosci/config.yaml
//! - `paths.home` is relative to the .cosci/ directory
//!
//! The resolved [`Config`] is built once by the binary and handed to each
//! component. Nothing below the CLI reads the environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::adapters::sandbox::default_wrapper;
use crate::adapters::{Isolation, SandboxLimits};
use crate::core::executor::{ExecutionMode, DEFAULT_INLINE_THRESHOLD};
use crate::core::plan::RetryPolicy;
use crate::core::safety::SafetyLimits;

pub const ENV_HOME: &str = "COSCI_HOME";
pub const ENV_LLM_API_KEY: &str = "COSCI_LLM_API_KEY";
pub const ENV_TOOLS_API_KEY: &str = "COSCI_TOOLS_API_KEY";

const DEFAULT_LLM_ENDPOINT: &str = "https://api.groq.com/openai/v1";
const DEFAULT_LLM_MODEL: &str = "llama3-8b-8192";
const DEFAULT_TOOLS_ENDPOINT: &str = "https://backend.composio.dev/api/v3";
const DEFAULT_RETENTION_HOURS: u64 = 72;

/// Secret credential; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Configuration problems that stop the process before any plan exists
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing credential: set {var}")]
    MissingCredential { var: &'static str },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Raw config file schema (matches YAML structure)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub tools: Option<ToolsConfig>,
    #[serde(default)]
    pub staging: Option<StagingConfig>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub analysis: Option<AnalysisConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .cosci/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    pub endpoint: Option<String>,
    pub user_id: Option<String>,
    pub call_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    pub inline_threshold_bytes: Option<u64>,
    pub retention_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub mode: Option<ExecutionMode>,
    pub max_steps: Option<u32>,
    pub max_calls_per_step: Option<u32>,
    pub max_prompt_bytes: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
    pub max_tool_output_bytes: Option<u64>,
    pub max_staged_bytes: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    pub interpreter: Option<Vec<String>>,
    pub wrapper: Option<Vec<String>>,
    pub unisolated: Option<bool>,
    pub wall_clock_seconds: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

// ============================================================================
// Resolved configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub endpoint: String,
    pub user_id: Option<String>,
    pub call_timeout_seconds: u64,
}

impl ToolSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct StagingSettings {
    pub inline_threshold_bytes: u64,
    pub retention_hours: u64,
}

impl StagingSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub mode: ExecutionMode,
    pub limits: SafetyLimits,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub interpreter: Vec<String>,
    pub isolation: Isolation,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub llm_api_key: Option<ApiKey>,
    pub tools_api_key: Option<ApiKey>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub llm: LlmSettings,
    pub tools: ToolSettings,
    pub staging: StagingSettings,
    pub execution: ExecutionSettings,
    pub analysis: AnalysisSettings,
    pub credentials: Credentials,
}

impl Config {
    /// Load from the process environment and working directory
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".cosci");

        Self::load_from(&cwd, default_home, |var| std::env::var(var).ok())
    }

    /// Load with an explicit start directory, fallback home and env lookup
    pub fn load_from<F>(start: &Path, default_home: PathBuf, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_file = find_config_file(start);
        let file = match config_file {
            Some(ref path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        let home = if let Some(env_home) = env(ENV_HOME).filter(|h| !h.is_empty()) {
            PathBuf::from(env_home)
        } else if let (Some(config_path), Some(home_path)) = (&config_file, &file.paths.home) {
            let cosci_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(cosci_dir, home_path)
        } else {
            default_home
        };

        let llm = file.llm.as_ref();
        let llm = LlmSettings {
            endpoint: llm
                .and_then(|l| l.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_LLM_ENDPOINT.to_string()),
            model: llm
                .and_then(|l| l.model.clone())
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            temperature: llm.and_then(|l| l.temperature).unwrap_or(0.1),
            timeout_seconds: llm.and_then(|l| l.timeout_seconds).unwrap_or(60),
        };

        let tools = file.tools.as_ref();
        let tools = ToolSettings {
            endpoint: tools
                .and_then(|t| t.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_TOOLS_ENDPOINT.to_string()),
            user_id: tools.and_then(|t| t.user_id.clone()),
            call_timeout_seconds: tools.and_then(|t| t.call_timeout_seconds).unwrap_or(30),
        };

        let staging = file.staging.as_ref();
        let staging = StagingSettings {
            inline_threshold_bytes: staging
                .and_then(|s| s.inline_threshold_bytes)
                .unwrap_or(DEFAULT_INLINE_THRESHOLD),
            retention_hours: staging
                .and_then(|s| s.retention_hours)
                .unwrap_or(DEFAULT_RETENTION_HOURS),
        };

        let execution = file.execution.as_ref();
        let defaults = SafetyLimits::default();
        let execution = ExecutionSettings {
            mode: execution.and_then(|e| e.mode).unwrap_or_default(),
            limits: SafetyLimits {
                max_steps: execution
                    .and_then(|e| e.max_steps)
                    .unwrap_or(defaults.max_steps),
                max_calls_per_step: execution
                    .and_then(|e| e.max_calls_per_step)
                    .unwrap_or(defaults.max_calls_per_step),
                max_prompt_bytes: execution
                    .and_then(|e| e.max_prompt_bytes)
                    .unwrap_or(defaults.max_prompt_bytes),
                run_timeout_seconds: execution
                    .and_then(|e| e.run_timeout_seconds)
                    .unwrap_or(defaults.run_timeout_seconds),
                max_tool_output_bytes: execution
                    .and_then(|e| e.max_tool_output_bytes)
                    .unwrap_or(defaults.max_tool_output_bytes),
                max_staged_bytes: execution
                    .and_then(|e| e.max_staged_bytes)
                    .unwrap_or(defaults.max_staged_bytes),
            },
            retry: execution.and_then(|e| e.retry.clone()).unwrap_or_default(),
        };

        let analysis = file.analysis.as_ref();
        let sandbox = SandboxLimits::default();
        let analysis = AnalysisSettings {
            interpreter: analysis
                .and_then(|a| a.interpreter.clone())
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| vec!["python3".to_string(), "-I".to_string()]),
            isolation: if analysis.and_then(|a| a.unisolated).unwrap_or(false) {
                Isolation::Disabled
            } else {
                Isolation::Wrapper(
                    analysis
                        .and_then(|a| a.wrapper.clone())
                        .unwrap_or_else(default_wrapper),
                )
            },
            limits: SandboxLimits {
                wall_clock_seconds: analysis
                    .and_then(|a| a.wall_clock_seconds)
                    .unwrap_or(sandbox.wall_clock_seconds),
                memory_limit_mb: analysis
                    .and_then(|a| a.memory_limit_mb)
                    .unwrap_or(sandbox.memory_limit_mb),
                max_output_bytes: analysis
                    .and_then(|a| a.max_output_bytes)
                    .unwrap_or(sandbox.max_output_bytes),
            },
        };

        let key = |var: &str| env(var).filter(|k| !k.trim().is_empty()).map(ApiKey::new);
        let credentials = Credentials {
            llm_api_key: key(ENV_LLM_API_KEY),
            tools_api_key: key(ENV_TOOLS_API_KEY),
        };

        let config = Self {
            home,
            config_file,
            llm,
            tools,
            staging,
            execution,
            analysis,
            credentials,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.limits.max_steps == 0 {
            return Err(ConfigError::Invalid("execution.max_steps must be positive".to_string()));
        }
        if self.execution.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "execution.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.analysis.isolation == Isolation::Wrapper(Vec::new()) {
            return Err(ConfigError::Invalid(
                "analysis.wrapper is empty; set analysis.unisolated: true to run scripts without isolation"
                    .to_string(),
            ));
        }
        if self.analysis.limits.wall_clock_seconds == 0 {
            return Err(ConfigError::Invalid(
                "analysis.wall_clock_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Run logs ($COSCI_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Payload store ($COSCI_HOME/payloads)
    pub fn payloads_dir(&self) -> PathBuf {
        self.home.join("payloads")
    }

    /// Key for the inference endpoint, or fail fast
    pub fn llm_api_key(&self) -> Result<ApiKey, ConfigError> {
        self.credentials
            .llm_api_key
            .clone()
            .ok_or(ConfigError::MissingCredential { var: ENV_LLM_API_KEY })
    }

    /// Key for the tool platform, or fail fast
    pub fn tools_api_key(&self) -> Result<ApiKey, ConfigError> {
        self.credentials
            .tools_api_key
            .clone()
            .ok_or(ConfigError::MissingCredential { var: ENV_TOOLS_API_KEY })
    }

    /// Check both credentials up front
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        self.llm_api_key()?;
        self.tools_api_key()?;
        Ok(())
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".cosci").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
