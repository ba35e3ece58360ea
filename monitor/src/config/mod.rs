mod monitor_config;

pub use monitor_config::MonitorConfig;
