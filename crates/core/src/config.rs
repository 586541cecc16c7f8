//! TOML-based configuration for patchguard.
//!
//! Every section is optional; a missing file section takes its defaults.
//! Secrets (the completion API key) are stored as `_env` fields that
//! reference environment variable names and are resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::ResolutionMode;
use crate::errors::ConfigError;
use crate::models::{ApplicationOptions, ApplicationStrategy};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Strategy and per-request option defaults.
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Snapshot storage and restore behaviour.
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Pre- and post-apply checks.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Completion provider for `ai` resolution.
    #[serde(default)]
    pub ai: AiConfig,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level or a full `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Defaults for [`ApplicationOptions`] and the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    #[serde(default)]
    pub strategy: ApplicationStrategy,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_true")]
    pub auto_resolve_conflicts: bool,

    #[serde(default = "default_true")]
    pub create_backup: bool,

    #[serde(default)]
    pub validate_after_apply: bool,

    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub conflict_resolution: ResolutionMode,

    #[serde(default)]
    pub notify_on_completion: bool,

    /// 0 = unbounded.
    #[serde(default)]
    pub max_parallelism: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            strategy: ApplicationStrategy::default(),
            dry_run: false,
            auto_resolve_conflicts: true,
            create_backup: true,
            validate_after_apply: false,
            rollback_on_failure: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            conflict_resolution: ResolutionMode::Auto,
            notify_on_completion: false,
            max_parallelism: 0,
        }
    }
}

impl ApplyConfig {
    /// The request options these defaults describe.
    pub fn to_options(&self) -> ApplicationOptions {
        ApplicationOptions {
            dry_run: self.dry_run,
            auto_resolve_conflicts: self.auto_resolve_conflicts,
            create_backup: self.create_backup,
            validate_after_apply: self.validate_after_apply,
            rollback_on_failure: self.rollback_on_failure,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            conflict_resolution: self.conflict_resolution,
            notify_on_completion: self.notify_on_completion,
            max_parallelism: self.max_parallelism,
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Directory under the repository root holding backups and manifests.
    #[serde(default = "default_backup_dir_name")]
    pub backup_dir_name: String,

    /// Files smaller than this are also inlined into the manifest.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: u64,

    /// Age after which `cleanup` removes a rollback point.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Use a hard reset when the snapshot was taken on a clean tree.
    #[serde(default = "default_true")]
    pub prefer_vcs_reset: bool,

    /// Glob patterns (repository-relative) left out of snapshots.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_backup_dir_name() -> String {
    ".snapshot_backups".into()
}
fn default_inline_threshold() -> u64 {
    1024 * 1024
}
fn default_max_age_hours() -> u64 {
    24
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            backup_dir_name: default_backup_dir_name(),
            inline_threshold_bytes: default_inline_threshold(),
            max_age_hours: default_max_age_hours(),
            prefer_vcs_reset: true,
            exclude: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Shell-free command line, e.g. `cargo build`.
    #[serde(default)]
    pub build_command: Option<String>,

    #[serde(default)]
    pub test_command: Option<String>,

    #[serde(default = "default_validation_timeout")]
    pub timeout_secs: u64,

    /// Conservative strategy rejects patches below this confidence.
    #[serde(default = "default_min_safety_confidence")]
    pub min_safety_confidence: f64,

    #[serde(default)]
    pub allow_breaking_changes: bool,

    /// Run the build command before each patch under the conservative
    /// strategy.
    #[serde(default)]
    pub pre_apply_build: bool,

    #[serde(default)]
    pub pre_apply_tests: bool,
}

fn default_validation_timeout() -> u64 {
    300
}
fn default_min_safety_confidence() -> f64 {
    0.7
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            test_command: None,
            timeout_secs: default_validation_timeout(),
            min_safety_confidence: default_min_safety_confidence(),
            allow_breaking_changes: false,
            pre_apply_build: false,
            pre_apply_tests: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AI
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_ai_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_ai_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,

    /// Resolved API key (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_ai_endpoint() -> String {
    "https://api.openai.com/v1".into()
}
fn default_ai_model() -> String {
    "gpt-4o-mini".into()
}
fn default_ai_key_env() -> String {
    "PATCHGUARD_AI_API_KEY".into()
}
fn default_ai_timeout() -> u64 {
    60
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_ai_endpoint(),
            model: default_ai_model(),
            api_key_env: default_ai_key_env(),
            timeout_secs: default_ai_timeout(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from the environment.
    ///
    /// A missing variable only logs a warning; the completion client
    /// reports it when it is actually needed.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if self.ai.enabled {
            self.ai.api_key = resolve_optional_env(&self.ai.api_key_env, "ai.api_key_env");
        }
        Ok(())
    }

    /// Validate ranges and required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rollback.backup_dir_name.trim().is_empty()
            || self.rollback.backup_dir_name.contains(['/', '\\'])
            || self.rollback.backup_dir_name == ".git"
        {
            return Err(ConfigError::InvalidValue {
                field: "rollback.backup_dir_name".into(),
                detail: "must be a single directory name other than .git".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.validation.min_safety_confidence) {
            return Err(ConfigError::InvalidValue {
                field: "validation.min_safety_confidence".into(),
                detail: "must be between 0.0 and 1.0".into(),
            });
        }
        if self.validation.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "validation.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.ai.enabled && self.ai.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ai.endpoint".into(),
                detail: "endpoint must not be empty when ai is enabled".into(),
            });
        }
        if self.ai.enabled && self.ai.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ai.model".into(),
                detail: "model must not be empty when ai is enabled".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Commented starter file written by `patchguard init`.
    pub fn sample_toml() -> &'static str {
        SAMPLE_TOML
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

const SAMPLE_TOML: &str = r#"# patchguard configuration

[logging]
level = "info"

[apply]
# sequential | parallel | optimized | conservative | adaptive
strategy = "sequential"
auto_resolve_conflicts = true
create_backup = true
validate_after_apply = false
rollback_on_failure = true
max_retries = 2
retry_delay_ms = 100
# auto | ai | manual | abort
conflict_resolution = "auto"
max_parallelism = 0

[rollback]
backup_dir_name = ".snapshot_backups"
inline_threshold_bytes = 1048576
max_age_hours = 24
prefer_vcs_reset = true
exclude = ["target/**", "node_modules/**"]

[validation]
# build_command = "cargo build"
# test_command = "cargo test"
timeout_secs = 300
min_safety_confidence = 0.7
allow_breaking_changes = false
pre_apply_build = false
pre_apply_tests = false

[ai]
enabled = false
endpoint = "https://api.openai.com/v1"
model = "gpt-4o-mini"
api_key_env = "PATCHGUARD_AI_API_KEY"
timeout_secs = 60
"#;
