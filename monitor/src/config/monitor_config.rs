use accounting::TaskIntervals;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Directory holding the persisted records; relative record paths resolve against it
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_limit_file")]
    pub limit_file: String,

    #[serde(default = "default_totals_file")]
    pub totals_file: String,

    #[serde(default = "default_install_file")]
    pub install_file: String,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_checkpoint_timeout_secs")]
    pub checkpoint_timeout_secs: u64,

    #[serde(default = "default_expiry_check_interval_secs")]
    pub expiry_check_interval_secs: u64,

    /// Seconds after first install at which the monitor erases itself
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Weight of the newest sample in the displayed rates (1.0 disables smoothing)
    #[serde(default = "default_rate_smoothing")]
    pub rate_smoothing: f64,

    /// Minimum spacing between failed host shutdown attempts
    #[serde(default = "default_shutdown_retry_secs")]
    pub shutdown_retry_secs: u64,

    #[serde(default = "default_api_addr")]
    pub api_addr: String,

    /// Bearer token required by the mutating API routes
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,

    /// Also remove the executable and this configuration file on expiry
    #[serde(default = "default_self_destruct")]
    pub self_destruct: bool,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging; stdout when unset
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Number of Tokio runtime worker threads (defaults to CPU cores)
    #[serde(default)]
    pub runtime_threads: Option<usize>,
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_limit_file() -> String {
    "network_limit.json".to_string()
}

fn default_totals_file() -> String {
    "network_totals.json".to_string()
}

fn default_install_file() -> String {
    "install.json".to_string()
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_checkpoint_timeout_secs() -> u64 {
    10
}

fn default_expiry_check_interval_secs() -> u64 {
    3_600
}

fn default_ttl_secs() -> u64 {
    accounting::lifecycle::DEFAULT_TTL.as_secs()
}

fn default_rate_smoothing() -> f64 {
    0.5
}

fn default_shutdown_retry_secs() -> u64 {
    30
}

fn default_api_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_shutdown_command() -> Vec<String> {
    vec!["shutdown".to_string(), "now".to_string()]
}

fn default_self_destruct() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "server-monitor.log".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            limit_file: default_limit_file(),
            totals_file: default_totals_file(),
            install_file: default_install_file(),
            sample_interval_ms: default_sample_interval_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_timeout_secs: default_checkpoint_timeout_secs(),
            expiry_check_interval_secs: default_expiry_check_interval_secs(),
            ttl_secs: default_ttl_secs(),
            rate_smoothing: default_rate_smoothing(),
            shutdown_retry_secs: default_shutdown_retry_secs(),
            api_addr: default_api_addr(),
            admin_token: None,
            shutdown_command: default_shutdown_command(),
            self_destruct: default_self_destruct(),
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
            runtime_threads: None,
        }
    }
}

impl MonitorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: MonitorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`MonitorConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn limit_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.limit_file)
    }

    pub fn totals_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.totals_file)
    }

    pub fn install_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.install_file)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn shutdown_retry(&self) -> Duration {
        Duration::from_secs(self.shutdown_retry_secs)
    }

    pub fn task_intervals(&self) -> TaskIntervals {
        TaskIntervals {
            sample: Duration::from_millis(self.sample_interval_ms.max(100)),
            checkpoint: Duration::from_secs(self.checkpoint_interval_secs.max(1)),
            checkpoint_timeout: Duration::from_secs(self.checkpoint_timeout_secs.max(1)),
            expiry_check: Duration::from_secs(self.expiry_check_interval_secs.max(1)),
        }
    }
}
