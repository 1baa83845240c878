//! Configuration for the pool client.
//!
//! Configuration lives in a JSON document owned by a [`ConfigStore`]. The
//! orchestrator re-reads it on demand and compares each endpoint by value, so
//! reloading an unchanged file is a no-op and only pools whose endpoint
//! actually changed get reconnected.
//!
//! The best-difficulty and found-block counters are the only values this crate
//! writes back.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::PoolId;

/// Connection parameters for one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumEndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,

    /// Send `mining.extranonce.subscribe` during the handshake.
    pub extranonce_subscribe: bool,

    pub tls: bool,

    /// Set from the slot the endpoint was loaded into, never persisted.
    #[serde(skip)]
    pub primary: bool,
}

impl StratumEndpointConfig {
    /// Parse a pool URL such as `stratum+tcp://pool.example:3333`.
    ///
    /// Accepted schemes are `stratum+tcp`, `stratum+ssl`, `stratum` and `tcp`;
    /// a bare `host:port` is also accepted. The ssl scheme sets the TLS flag.
    pub fn from_url(url: &str, user: &str, password: &str) -> Result<Self> {
        let (rest, tls) = if let Some(rest) = url.strip_prefix("stratum+ssl://") {
            (rest, true)
        } else {
            let rest = url
                .strip_prefix("stratum+tcp://")
                .or_else(|| url.strip_prefix("stratum://"))
                .or_else(|| url.strip_prefix("tcp://"))
                .unwrap_or(url);
            (rest, false)
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("missing port in pool URL {url:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in pool URL {url:?}")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in pool URL {url:?}")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            tls,
            ..Default::default()
        })
    }

    /// An endpoint without a host leaves its pool slot idle.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "stratum+ssl" } else { "stratum+tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Pool selection policy.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PoolMode {
    /// Mine on one pool at a time, fall back to the secondary while the
    /// primary is down.
    #[default]
    Failover,

    /// Keep both pools connected and split work between them.
    Dual,
}

/// ASIC-side limits that shape the jobs we build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsicConfig {
    /// Lowest difficulty the chips are asked to report.
    pub min_difficulty: u32,

    /// Highest difficulty the chips are asked to report.
    pub max_difficulty: u32,

    /// Period of the job ticker in milliseconds.
    pub job_interval_ms: u64,
}

impl Default for AsicConfig {
    fn default() -> Self {
        Self {
            min_difficulty: 256,
            max_difficulty: 2048,
            job_interval_ms: 500,
        }
    }
}

/// Strings sent in `mining.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub agent: String,
    pub asic_model: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            agent: concat!("mujina-pool/", env!("CARGO_PKG_VERSION")).to_string(),
            asic_model: "BM1370".to_string(),
        }
    }
}

/// Complete miner configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub pool: StratumEndpointConfig,
    pub fallback_pool: StratumEndpointConfig,
    pub pool_mode: PoolMode,

    /// Share of jobs sent to the primary pool in dual mode, in percent.
    pub pool_balance: u8,

    /// Enable TCP keepalive on pool sockets.
    pub keepalive: bool,

    /// Difficulty sent with `mining.suggest_difficulty`.
    pub suggested_difficulty: u32,

    pub asic: AsicConfig,
    pub device: DeviceIdentity,

    /// Best share difficulty ever found, persisted across restarts.
    pub best_diff: u64,

    /// Blocks found across restarts.
    pub total_found_blocks: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            pool: StratumEndpointConfig::default(),
            fallback_pool: StratumEndpointConfig::default(),
            pool_mode: PoolMode::default(),
            pool_balance: 50,
            keepalive: true,
            suggested_difficulty: 1000,
            asic: AsicConfig::default(),
            device: DeviceIdentity::default(),
            best_diff: 0,
            total_found_blocks: 0,
        }
    }
}

impl MinerConfig {
    /// Endpoint for a pool slot, tagged with its role.
    pub fn endpoint(&self, pool: PoolId) -> StratumEndpointConfig {
        let mut endpoint = match pool {
            PoolId::Primary => self.pool.clone(),
            PoolId::Secondary => self.fallback_pool.clone(),
        };
        endpoint.primary = pool == PoolId::Primary;
        endpoint
    }

    /// Primary percentage for dual mode, kept away from 0 and 100 so both
    /// pools always receive some work.
    pub fn primary_percentage(&self) -> u32 {
        u32::from(self.pool_balance.clamp(1, 99))
    }

    /// Apply `MUJINA_*` overrides from a variable lookup.
    ///
    /// The lookup is injected so the daemon passes `std::env::var` and tests
    /// pass a map.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("MUJINA_POOL_URL") {
            let user = var("MUJINA_POOL_USER").unwrap_or_else(|| self.pool.user.clone());
            let pass = var("MUJINA_POOL_PASS").unwrap_or_else(|| "x".to_string());
            let mut endpoint = StratumEndpointConfig::from_url(&url, &user, &pass)?;
            endpoint.extranonce_subscribe = self.pool.extranonce_subscribe;
            self.pool = endpoint;
        }

        if let Some(url) = var("MUJINA_FALLBACK_URL") {
            let user =
                var("MUJINA_FALLBACK_USER").unwrap_or_else(|| self.fallback_pool.user.clone());
            let pass = var("MUJINA_FALLBACK_PASS").unwrap_or_else(|| "x".to_string());
            let mut endpoint = StratumEndpointConfig::from_url(&url, &user, &pass)?;
            endpoint.extranonce_subscribe = self.fallback_pool.extranonce_subscribe;
            self.fallback_pool = endpoint;
        }

        if let Some(mode) = var("MUJINA_POOL_MODE") {
            self.pool_mode = mode
                .parse()
                .map_err(|_| Error::Config(format!("unknown pool mode {mode:?}")))?;
        }

        Ok(())
    }
}

/// Source of configuration and sink for the few values written back.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<MinerConfig>;

    fn save_best_diff(&self, best_diff: u64) -> Result<()>;

    fn save_found_blocks(&self, total_found_blocks: u64) -> Result<()>;
}

/// Configuration kept in a JSON file.
///
/// A missing file loads as the default configuration; the file is created on
/// the first write-back.
pub struct JsonFileStore {
    path: PathBuf,
    env_overrides: bool,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_overrides: false,
            lock: Mutex::new(()),
        }
    }

    /// Apply `MUJINA_*` environment overrides on every load.
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<MinerConfig> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                Ok(MinerConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MinerConfig)) -> Result<()> {
        let _guard = self.lock.lock();
        let mut config = self.read()?;
        apply(&mut config);

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&config)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<MinerConfig> {
        let mut config = {
            let _guard = self.lock.lock();
            self.read()?
        };
        if self.env_overrides {
            config.apply_overrides(|name| std::env::var(name).ok())?;
        }
        Ok(config)
    }

    fn save_best_diff(&self, best_diff: u64) -> Result<()> {
        self.update(|config| config.best_diff = best_diff)
    }

    fn save_found_blocks(&self, total_found_blocks: u64) -> Result<()> {
        self.update(|config| config.total_found_blocks = total_found_blocks)
    }
}

/// In-memory configuration, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<MinerConfig>,
}

impl MemoryStore {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Replace the stored configuration, as a settings change would.
    pub fn set(&self, config: MinerConfig) {
        *self.config.lock() = config;
    }

    pub fn modify(&self, apply: impl FnOnce(&mut MinerConfig)) {
        apply(&mut self.config.lock());
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<MinerConfig> {
        Ok(self.config.lock().clone())
    }

    fn save_best_diff(&self, best_diff: u64) -> Result<()> {
        self.config.lock().best_diff = best_diff;
        Ok(())
    }

    fn save_found_blocks(&self, total_found_blocks: u64) -> Result<()> {
        self.config.lock().total_found_blocks = total_found_blocks;
        Ok(())
    }
}
