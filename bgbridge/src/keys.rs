//! Bind keys for encrypted MiBeacons, and the rate-limited request for
//! missing ones.
//!
//! Keys live in a JSON file maintained by the hub:
//!
//! ```json
//! {"devices": {"A4:C1:38:02:83:F4": {"bindkey": "814aac74c4f17b6c1581e1ab87816b99"}}}
//! ```
//!
//! The bridge only reads it. [`KeyStore::reload`] picks up keys added after
//! startup.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::tracing::prelude::*;
use crate::types::MacAddr;

/// Source of bind keys, by device address.
pub trait KeyProvider: Send + Sync {
    fn lookup(&self, mac: &MacAddr) -> Option<Vec<u8>>;
}

impl KeyProvider for HashMap<MacAddr, Vec<u8>> {
    fn lookup(&self, mac: &MacAddr) -> Option<Vec<u8>> {
        self.get(mac).cloned()
    }
}

impl<K: KeyProvider + ?Sized> KeyProvider for Arc<K> {
    fn lookup(&self, mac: &MacAddr) -> Option<Vec<u8>> {
        (**self).lookup(mac)
    }
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Failed to read key file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid key file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    devices: HashMap<String, DeviceEntry>,
}

#[derive(Deserialize)]
struct DeviceEntry {
    #[serde(default)]
    bindkey: Option<String>,
}

fn parse_keys(json: &str) -> Result<HashMap<MacAddr, Vec<u8>>, KeyError> {
    let file: KeyFile = serde_json::from_str(json)?;
    let mut keys = HashMap::new();
    for (mac, entry) in file.devices {
        let Some(bindkey) = entry.bindkey else {
            continue;
        };
        let mac = match mac.parse::<MacAddr>() {
            Ok(mac) => mac,
            Err(e) => {
                warn!(error = %e, "Skipping bind key");
                continue;
            }
        };
        match hex::decode(&bindkey) {
            Ok(key) => {
                keys.insert(mac, key);
            }
            Err(e) => warn!(%mac, error = %e, "Skipping malformed bind key"),
        }
    }
    Ok(keys)
}

/// Bind keys loaded from the hub's JSON file.
pub struct KeyStore {
    path: Option<PathBuf>,
    keys: RwLock<HashMap<MacAddr, Vec<u8>>>,
}

impl KeyStore {
    pub fn from_json(json: &str) -> Result<Self, KeyError> {
        Ok(Self {
            path: None,
            keys: RwLock::new(parse_keys(json)?),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref().to_path_buf();
        let keys = read_keys(&path)?;
        Ok(Self {
            path: Some(path),
            keys: RwLock::new(keys),
        })
    }

    /// Load `path`, starting empty if it is missing or unreadable. The path is
    /// remembered either way so a later [`reload`](Self::reload) can succeed.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let keys = match read_keys(&path) {
            Ok(keys) => keys,
            Err(KeyError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No bind key file, encrypted beacons stay undecoded");
                HashMap::new()
            }
            Err(e) => {
                warn!(error = %e, "Ignoring bind key file");
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            keys: RwLock::new(keys),
        }
    }

    /// Re-read the backing file. On error the current keys are kept.
    pub fn reload(&self) -> Result<usize, KeyError> {
        let Some(path) = &self.path else {
            return Ok(self.len());
        };
        let keys = read_keys(path)?;
        let count = keys.len();
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = keys;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_keys(path: &Path) -> Result<HashMap<MacAddr, Vec<u8>>, KeyError> {
    let json = std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_keys(&json)
}

impl KeyProvider for KeyStore {
    fn lookup(&self, mac: &MacAddr) -> Option<Vec<u8>> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mac)
            .cloned()
    }
}

/// Asks the hub for the bind key of a device.
pub trait KeyQuery: Send + Sync {
    fn query(&self, mac: MacAddr, product_id: u16);
}

pub const KEY_QUERY_METHOD: &str = "_sync.ble_query_dev";

#[derive(Debug, Serialize)]
pub struct KeyQueryParams {
    pub mac: MacAddr,
    pub pdid: u16,
}

/// Request understood by the hub's device service.
#[derive(Debug, Serialize)]
pub struct KeyQueryMessage {
    pub id: u32,
    pub method: &'static str,
    pub params: KeyQueryParams,
}

impl KeyQueryMessage {
    pub fn new(id: u32, mac: MacAddr, product_id: u16) -> Self {
        Self {
            id,
            method: KEY_QUERY_METHOD,
            params: KeyQueryParams {
                mac,
                pdid: product_id,
            },
        }
    }
}

/// Default minimum time between key queries for the same device.
pub const KEY_QUERY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Allows one key query per device per interval.
///
/// Entries whose interval has passed are swept at most once per interval.
pub struct QueryLimiter {
    next_allowed: HashMap<MacAddr, Instant>,
    interval: Duration,
    next_sweep: Instant,
    clock: Arc<dyn Clock>,
}

impl QueryLimiter {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            next_allowed: HashMap::new(),
            interval,
            next_sweep: clock.now() + interval,
            clock,
        }
    }

    /// Returns true, and starts a new interval, if `mac` may be queried now.
    pub fn allow(&mut self, mac: MacAddr) -> bool {
        let now = self.clock.now();
        if now >= self.next_sweep {
            self.next_allowed.retain(|_, next| *next > now);
            self.next_sweep = now + self.interval;
        }
        match self.next_allowed.get(&mac) {
            Some(next) if now < *next => false,
            _ => {
                self.next_allowed.insert(mac, now + self.interval);
                true
            }
        }
    }
}
