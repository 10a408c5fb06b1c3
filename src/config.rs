use toml;

use std::env;
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use error::Result;

/// TCP keep-alive probing applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Seconds a connection sits idle before the first probe.
    pub idle: u32,
    /// Seconds between unanswered probes.
    pub interval: u32,
    /// Unanswered probes before the connection is dropped.
    pub count: u32,
}

impl KeepAliveConfig {
    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle))
    }

    pub fn interval_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval))
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            idle: 120,
            interval: 3,
            count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    /// Ceiling of the worker pool. Zero runs every task on the dispatch thread.
    pub threads: usize,
    /// How many readiness notifications a single wait can return.
    pub events_capacity: usize,
    /// Directory the file client serves from.
    pub root_dir: PathBuf,
    pub log_level: String,
    pub keep_alive: KeepAliveConfig,
}

impl Config {
    /// Read from a config file, create a new config. Will exit the process on error.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        unwrap!(Config::from_file(path))
    }

    /// Read from a config file, reporting failures to the caller.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {:?}", path);
        let mut file = throw!(File::open(path));
        let mut buffer = String::new();
        throw!(file.read_to_string(&mut buffer));
        Ok(throw!(toml::from_str(&buffer)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 8081,
            threads: 20,
            events_capacity: 1024,
            root_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            log_level: "info".into(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}
