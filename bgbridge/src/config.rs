//! Bridge configuration from environment variables.
//!
//! # Environment Variables
//!
//! - `BGBRIDGE_CHIP_PORT`: chip serial device (default: `/dev/ttyS1`)
//! - `BGBRIDGE_APP_PORT`: application pseudo-terminal (default: `/dev/ptyp8`)
//! - `BGBRIDGE_BAUD`: baud rate of both links (default: 115200)
//! - `BGBRIDGE_CHIP_FRAMING`, `BGBRIDGE_APP_FRAMING`: `unbracketed` (default)
//!   or `bracketed`
//! - `BGBRIDGE_DISCOVERY_TIMEOUT`: seconds of silence in discovery before the
//!   chip is restarted (default: 60)
//! - `BGBRIDGE_RESTART_DELAY`: seconds before a restarted chip may be
//!   restarted again (default: 300)
//! - `BGBRIDGE_KEY_QUERY_INTERVAL`: seconds between bind key queries for one
//!   device (default: 3600)
//! - `BGBRIDGE_SCAN_TIMING`: `interval,window` forced into the application's
//!   discovery timing command (default: unset, pass through)
//! - `BGBRIDGE_KEYS`: bind key file (default: `/data/gw3.json`)
//! - `BGBRIDGE_RESTART_CMD`: shell command restarting the chip process
//! - `BGBRIDGE_PATCH_CMD`: shell command run once when discovery first starts
//! - `BGBRIDGE_TOPIC_PREFIX`: prefix of published topics (default: `gw3`)

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::bglib::Framing;
use crate::discovery::DiscoveryConfig;
use crate::gap::PipelineConfig;
use crate::transport::LinkConfig;

pub const DEFAULT_CHIP_PORT: &str = "/dev/ttyS1";
pub const DEFAULT_APP_PORT: &str = "/dev/ptyp8";
pub const DEFAULT_KEYS_PATH: &str = "/data/gw3.json";
pub const DEFAULT_TOPIC_PREFIX: &str = "gw3";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Scan interval and window, in 0.625 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
    pub interval: u16,
    pub window: u16,
}

impl FromStr for ScanTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (interval, window) = s
            .split_once(',')
            .ok_or_else(|| "expected \"interval,window\"".to_string())?;
        let parse = |v: &str| v.trim().parse::<u16>().map_err(|e| e.to_string());
        let timing = Self {
            interval: parse(interval)?,
            window: parse(window)?,
        };
        if timing.window > timing.interval {
            return Err("window longer than interval".into());
        }
        Ok(timing)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub chip: LinkConfig,
    pub app: LinkConfig,
    pub discovery: DiscoveryConfig,
    pub pipeline: PipelineConfig,
    pub scan_timing: Option<ScanTiming>,
    pub keys_path: PathBuf,
    pub restart_command: Option<String>,
    pub patch_command: Option<String>,
    pub topic_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chip: LinkConfig::new(DEFAULT_CHIP_PORT),
            app: LinkConfig::new(DEFAULT_APP_PORT),
            discovery: DiscoveryConfig::default(),
            pipeline: PipelineConfig::default(),
            scan_timing: None,
            keys_path: PathBuf::from(DEFAULT_KEYS_PATH),
            restart_command: None,
            patch_command: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

fn var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Ok(value) = env::var(name) else {
        return Ok(None);
    };
    value
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var: name,
            reason: e.to_string(),
            value,
        })
}

fn seconds(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(var::<u64>(name)?.map(Duration::from_secs))
}

/// Non-empty string variable.
fn command(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl BridgeConfig {
    /// Parse configuration from environment variables, with defaults for
    /// anything unset. Set but unparsable values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = var("BGBRIDGE_CHIP_PORT")? {
            config.chip.path = path;
        }
        if let Some(path) = var("BGBRIDGE_APP_PORT")? {
            config.app.path = path;
        }
        if let Some(baud) = var("BGBRIDGE_BAUD")? {
            config.chip.baud = baud;
            config.app.baud = baud;
        }
        if let Some(framing) = var::<Framing>("BGBRIDGE_CHIP_FRAMING")? {
            config.chip.framing = framing;
        }
        if let Some(framing) = var::<Framing>("BGBRIDGE_APP_FRAMING")? {
            config.app.framing = framing;
        }

        if let Some(timeout) = seconds("BGBRIDGE_DISCOVERY_TIMEOUT")? {
            config.discovery.timeout = timeout;
        }
        if let Some(delay) = seconds("BGBRIDGE_RESTART_DELAY")? {
            config.discovery.restart_delay = delay;
        }
        if let Some(interval) = seconds("BGBRIDGE_KEY_QUERY_INTERVAL")? {
            config.pipeline.key_query_interval = interval;
        }

        config.scan_timing = var("BGBRIDGE_SCAN_TIMING")?;
        if let Some(path) = var::<PathBuf>("BGBRIDGE_KEYS")? {
            config.keys_path = path;
        }
        config.restart_command = command("BGBRIDGE_RESTART_CMD");
        config.patch_command = command("BGBRIDGE_PATCH_CMD");
        if let Some(prefix) = var("BGBRIDGE_TOPIC_PREFIX")? {
            config.topic_prefix = prefix;
        }

        Ok(config)
    }
}
