use crate::config::MonitorConfig;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "server-monitor")]
#[command(author, version, about = "Host traffic accounting with usage limits and a time-to-live", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "monitor.toml", env = "MONITOR_CONFIG")]
    pub config: String,

    /// Override data directory for persisted records
    #[arg(long, env = "MONITOR_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Override admin API listen address
    #[arg(long, env = "MONITOR_API_ADDR")]
    pub api_addr: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log directory
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Override number of runtime worker threads
    #[arg(long)]
    pub runtime_threads: Option<usize>,
}

impl CliArgs {
    pub fn apply(&self, cfg: &mut MonitorConfig) {
        if let Some(data_dir) = &self.data_dir {
            cfg.data_dir = data_dir.clone();
        }
        if let Some(api_addr) = &self.api_addr {
            cfg.api_addr = api_addr.clone();
        }
        if let Some(log_level) = &self.log_level {
            cfg.log_level = log_level.clone();
        }
        if let Some(log_dir) = &self.log_dir {
            cfg.log_dir = Some(log_dir.clone());
        }
        if let Some(threads) = self.runtime_threads {
            cfg.runtime_threads = Some(threads);
        }
    }
}
