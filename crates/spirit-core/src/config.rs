use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration (`spirit.toml` + `SPIRIT_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiritConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub compactor: CompactorConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl Default for SpiritConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            compactor: CompactorConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl SpiritConfig {
    /// Load config from a TOML file with `SPIRIT_*` env var overrides.
    ///
    /// Checks in order: explicit path argument, then `~/.spirit/spirit.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SpiritConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SPIRIT_").split("_"))
            .extract()
            .map_err(|e| crate::error::SpiritError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.spirit/spirit.toml", home)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.spirit/spirit.db", home)
}

/// Agent-loop configuration — round limits and compression trigger inputs.
///
/// See spec §4.1 and §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_context_budget")]
    pub context_budget: f64,
    #[serde(default = "default_model_max_tokens")]
    pub model_max_tokens: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tool_rounds: default_max_tool_rounds(),
            context_budget: default_context_budget(),
            model_max_tokens: default_model_max_tokens(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

fn default_model() -> String {
    "default".to_string()
}
fn default_max_tool_rounds() -> u32 {
    20
}
fn default_context_budget() -> f64 {
    0.8
}
fn default_model_max_tokens() -> u64 {
    200_000
}
fn default_max_output_tokens() -> u32 {
    4096
}

/// Sandbox executor configuration — capability flags and resource limits.
///
/// See spec §4.5 and §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,
    #[serde(default = "default_max_code_size")]
    pub max_code_size: usize,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
    #[serde(default = "default_code_timeout_ms")]
    pub code_timeout_ms: u64,
    #[serde(default = "default_max_tool_calls_per_exec")]
    pub max_tool_calls_per_exec: u32,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_read_paths: Vec<String>,
    #[serde(default)]
    pub allowed_run: Vec<String>,
    /// Path to the fixed runtime bridge script, read once per execution.
    pub runtime_bridge_path: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_command: default_runtime_command(),
            max_code_size: default_max_code_size(),
            max_output_size: default_max_output_size(),
            code_timeout_ms: default_code_timeout_ms(),
            max_tool_calls_per_exec: default_max_tool_calls_per_exec(),
            working_dir: default_working_dir(),
            allowed_hosts: Vec::new(),
            allowed_read_paths: Vec::new(),
            allowed_run: Vec::new(),
            runtime_bridge_path: None,
        }
    }
}

fn default_runtime_command() -> String {
    "deno".to_string()
}
fn default_max_code_size() -> usize {
    64 * 1024
}
fn default_max_output_size() -> usize {
    256 * 1024
}
fn default_code_timeout_ms() -> u64 {
    30_000
}
fn default_max_tool_calls_per_exec() -> u32 {
    50
}
fn default_working_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{}/.spirit/sandbox", home)
}

/// Compactor configuration. See spec §4.3 and §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: u32,
    #[serde(default = "default_clip_first")]
    pub clip_first: usize,
    #[serde(default = "default_clip_last")]
    pub clip_last: usize,
    pub prompt: Option<String>,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            keep_recent: default_keep_recent(),
            max_summary_tokens: default_max_summary_tokens(),
            clip_first: default_clip_first(),
            clip_last: default_clip_last(),
            prompt: None,
        }
    }
}

fn default_chunk_size() -> usize {
    20
}
fn default_keep_recent() -> usize {
    5
}
fn default_max_summary_tokens() -> u32 {
    1024
}
fn default_clip_first() -> usize {
    2
}
fn default_clip_last() -> usize {
    2
}

/// Event dispatcher configuration. See spec §4.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Deterministic conversation identity source name for dispatched events.
    #[serde(default = "default_events_source")]
    pub source: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            source: default_events_source(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}
fn default_events_source() -> String {
    "external".to_string()
}
