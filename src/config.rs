//! Config module for fetchd

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use bytesize::ByteSize;
use clap::Parser;

use crate::engine::{EngineOptions, EngineSettings, StrategyPolicy};

#[derive(Parser, Debug, Clone)]
pub struct EngineConfig {
    /// Directory finished downloads are written to
    #[clap(long, env = "FETCHD_DOWNLOAD_DIR", default_value_t = get_default_download_dir())]
    pub download_dir: String,

    /// Scratch directory for partial and chunk files, cleaned up as jobs finish
    #[clap(long, env = "FETCHD_TEMP_DIR", default_value = "/tmp/fetchd")]
    pub temp_dir: String,

    /// Parallel connections used for a single chunked download
    #[clap(long, env = "FETCHD_MAX_CONNECTIONS", default_value_t = 8)]
    pub max_connections: usize,

    /// Upper bound on concurrent transfers to one host, across all jobs
    #[clap(long, env = "FETCHD_MAX_CONNECTIONS_PER_HOST", default_value_t = 16)]
    pub max_connections_per_host: usize,

    /// Files at or below this size are never split
    #[clap(long, env = "FETCHD_MIN_CHUNKED_SIZE", default_value = "4MiB")]
    pub min_chunked_size: ByteSize,

    /// Hosts that misbehave with concurrent ranges and always get one stream
    #[clap(
        long,
        env = "FETCHD_SINGLE_STREAM_HOSTS",
        value_delimiter = ',',
        default_value = "googleusercontent.com"
    )]
    pub single_stream_hosts: Vec<String>,

    #[clap(long, env = "FETCHD_USER_AGENT", default_value = concat!("fetchd/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    /// Seconds a transfer may go without receiving data
    #[clap(long, env = "FETCHD_TRANSFER_TIMEOUT", default_value_t = 300)]
    pub transfer_timeout_secs: u64,
}

/// Safely determine the default download directory
fn get_default_download_dir() -> String {
    dirs::download_dir()
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "downloads/".to_string())
}

impl EngineConfig {
    /// Get valid single-stream hosts (filters out empty strings)
    pub fn get_valid_single_stream_hosts(&self) -> Vec<String> {
        self.single_stream_hosts
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().into()
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn strategy_policy(&self) -> StrategyPolicy {
        StrategyPolicy::single_stream_for(self.get_valid_single_stream_hosts())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            temp_dir: self.temp_dir(),
            max_connections_per_host: self.max_connections_per_host.max(1),
            policy: self.strategy_policy(),
            user_agent: self.user_agent.clone(),
            transfer_timeout: self.transfer_timeout(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Loopback address of the browser control listener
    #[clap(long, env = "FETCHD_HOST", default_value = "127.0.0.1:8765")]
    pub host: SocketAddr,

    /// Accept submissions from the browser integration
    #[clap(
        long,
        env = "FETCHD_INTERCEPT_BROWSER",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub intercept_browser: bool,

    #[clap(flatten)]
    pub engine_config: EngineConfig,
}

impl Config {
    /// The control listener has no authentication, so it only binds loopback
    pub fn listen_addr(&self) -> color_eyre::Result<SocketAddr> {
        if !self.host.ip().is_loopback() {
            color_eyre::eyre::bail!(
                "Refusing to listen on {}: the control listener is loopback only",
                self.host
            );
        }
        Ok(self.host)
    }

    /// Settings the engine reads at submission and strategy time
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            download_dir: self.engine_config.download_dir.clone().into(),
            max_connections: self.engine_config.max_connections.max(1),
            min_chunked_size: self.engine_config.min_chunked_size.as_u64(),
            intercept_browser: self.intercept_browser,
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}
