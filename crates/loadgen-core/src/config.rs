use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub instance: InstanceConfig,
    pub entities: EntitiesConfig,
    pub actions: Vec<ActionConfig>,
    pub target: TargetConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler or coordinator cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.entities.count == 0 {
            bail!("entities.count must be greater than zero");
        }
        if self.entities.action_rate_ms == 0 {
            bail!("entities.action_rate_ms must be greater than zero");
        }
        if self.actions.is_empty() {
            bail!("at least one [[actions]] entry is required");
        }
        let total: u64 = self.actions.iter().map(|a| u64::from(a.weight)).sum();
        if total == 0 {
            bail!("action weights must sum to more than zero");
        }
        if self.instance.heartbeat_interval_ms == 0 {
            bail!("instance.heartbeat_interval_ms must be greater than zero");
        }
        if self.instance.expiry_multiplier == 0 {
            bail!("instance.expiry_multiplier must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Optional global duration cap in milliseconds
    pub duration_ms: Option<u64>,
    /// Interval between progress lines from the status reporter
    #[serde(default = "default_print_every_ms")]
    pub print_every_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Connection URL of the shared coordination store (sqlite)
    pub store_url: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Peers silent for this many heartbeat intervals are pruned
    #[serde(default = "default_expiry_multiplier")]
    pub expiry_multiplier: u32,
    #[serde(default = "default_max_register_attempts")]
    pub max_register_attempts: u32,
    /// Linear backoff step between registration attempts
    #[serde(default = "default_register_backoff_ms")]
    pub register_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitiesConfig {
    /// Simulated users per instance
    pub count: u64,
    /// Mean interval between two actions of one entity
    pub action_rate_ms: u64,
    /// Uniform jitter applied to every interval, in both directions
    #[serde(default)]
    pub action_variance_ms: u64,
    /// Interval of the per-entity status poll; disabled when absent
    #[serde(default)]
    pub status_poll_interval_ms: Option<u64>,
    /// Run a per-entity event listener
    #[serde(default)]
    pub listen_events: bool,
    /// Upper bound on respawns per entity task; unbounded when absent
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl EntitiesConfig {
    pub fn action_rate(&self) -> Duration {
        Duration::from_millis(self.action_rate_ms)
    }

    pub fn action_variance(&self) -> Duration {
        Duration::from_millis(self.action_variance_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Name the action is registered under
    pub name: String,
    pub weight: u32,
    #[serde(default = "default_method")]
    pub method: String,
    /// Route template, e.g. "/api/v4/channels/{id}/stats"
    pub path: String,
    /// Cache key whose ids fill the `{id}` placeholder
    #[serde(default)]
    pub uses: Option<String>,
    /// Cache key the ids of a successful JSON response are stored under
    #[serde(default)]
    pub discovers: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the chat server under test
    pub base_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier for logs and result files
    pub id: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    /// Append every status event to this file
    #[serde(default)]
    pub status_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of local workers to spawn (for local testing)
    pub local_workers: Option<u32>,
}

fn default_print_every_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_expiry_multiplier() -> u32 {
    4
}

fn default_max_register_attempts() -> u32 {
    5
}

fn default_register_backoff_ms() -> u64 {
    200
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_results_dir() -> String {
    "results".to_string()
}
