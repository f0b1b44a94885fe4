use crate::error::{BridgeError, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:1323";
const DEFAULT_API_URL: &str = "https://materialscommons.org/api";

/// Process-wide settings resolved from the environment. All updates and
/// creates to the database are wrapped in transactions that may need to be
/// retried, especially when two transfers deadlock on a shared foreign-key
/// row; `tx_retry` carries a floor of 3 attempts.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the on-disk byte store (MCFS_DIR).
    pub mcfs_dir: PathBuf,
    /// Connection string for the metadata database (MCDB_CONNECT_STR).
    pub dsn: String,
    pub globus_endpoint_id: String,
    pub globus_cc_user: String,
    pub globus_cc_token: String,
    /// Base URL of the metadata service hosting the convert-file hook.
    pub api_url: String,
    pub tx_retry: usize,
    /// Poll cadence for the Globus task monitor (MC_GLOBUS_SETTLING_PERIOD,
    /// seconds, floor 10).
    pub settling_period: Duration,
    pub daemon_addr: String,
}

impl Settings {
    /// Load settings from the environment. When MC_DOTENV_PATH is set, the
    /// referenced dotenv file is loaded first so deployments can keep the
    /// whole environment in one file.
    pub fn load() -> Result<Settings> {
        if let Ok(path) = std::env::var("MC_DOTENV_PATH") {
            dotenvy::from_path(&path).map_err(|e| {
                BridgeError::Config(format!("Failed loading dotenv file {}: {}", path, e))
            })?;
        }

        Ok(Settings {
            mcfs_dir: PathBuf::from(required("MCFS_DIR")?),
            dsn: required("MCDB_CONNECT_STR")?,
            globus_endpoint_id: required("MC_GLOBUS_ENDPOINT_ID")?,
            globus_cc_user: required("MC_GLOBUS_CC_USER")?,
            globus_cc_token: required("MC_GLOBUS_CC_TOKEN")?,
            api_url: std::env::var("MC_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            tx_retry: tx_retry_from_env(),
            settling_period: settling_period_from_env(),
            daemon_addr: std::env::var("CASBRIDGE_DAEMON_ADDR")
                .unwrap_or_else(|_| DEFAULT_DAEMON_ADDR.to_string()),
        })
    }
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(BridgeError::Config(format!("{} not set", name))),
    }
}

fn tx_retry_from_env() -> usize {
    match std::env::var("MC_TX_RETRY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(n) if n >= 3 => n,
        _ => 3,
    }
}

fn settling_period_from_env() -> Duration {
    match std::env::var("MC_GLOBUS_SETTLING_PERIOD")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(secs) if secs >= 10 => Duration::from_secs(secs),
        _ => Duration::from_secs(10),
    }
}
