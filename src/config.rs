//! Runner configuration loaded from `bgrun.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! The `BGRUN_DATABASE` environment variable takes precedence over the file.
//! A database of `:memory:` keeps every record inside the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::allowlist::AllowList;
use crate::error::BgrunError;
use crate::gate::PriorityGate;
use crate::invoker::Binding;
use crate::logging::LogFormat;
use crate::state_machine::RetryConfig;
use crate::store::{
    InMemoryJobStore, InMemoryStatusCache, JobStore, SNAPSHOT_TTL, SqliteJobStore,
    SqliteStatusCache, StatusCache, StatusStore,
};

pub const DEFAULT_CONFIG_FILE: &str = "bgrun.toml";
const DATABASE_ENV: &str = "BGRUN_DATABASE";
/// Database name selecting the process-local stores.
pub const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Deserialize)]
pub struct BgrunConfig {
    /// SQLite file holding the durable job records, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Append job events here instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Fail binding when a declared parameter was not supplied.
    #[serde(default)]
    pub strict_params: bool,

    /// Seconds a job yields to higher-priority running work.
    #[serde(default = "default_priority_wait_secs")]
    pub priority_wait_secs: u64,

    /// Defaults for submissions that do not set their own.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Replaces the built-in allow-list when present.
    #[serde(default)]
    pub allowlist: Option<AllowList>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDriver {
    #[default]
    Sqlite,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub driver: CacheDriver,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[cfg(feature = "redis")]
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_database() -> PathBuf {
    PathBuf::from("bgrun.db")
}

fn default_priority_wait_secs() -> u64 {
    5
}

fn default_ttl_secs() -> u64 {
    SNAPSHOT_TTL.as_secs()
}

#[cfg(feature = "redis")]
fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            driver: CacheDriver::default(),
            ttl_secs: default_ttl_secs(),
            #[cfg(feature = "redis")]
            redis_url: default_redis_url(),
        }
    }
}

impl Default for BgrunConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            log_file: None,
            log_format: LogFormat::default(),
            strict_params: false,
            priority_wait_secs: default_priority_wait_secs(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            allowlist: None,
        }
    }
}

impl BgrunConfig {
    /// Load `path`, or `bgrun.toml` in the current directory when no path is
    /// given. Only the implicit file may be missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                Self::from_file(path)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config.with_database_override(std::env::var(DATABASE_ENV).ok()))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<BgrunConfig>(&contents)
            .with_context(|| format!("invalid config in {}", path.display()))
    }

    fn with_database_override(mut self, value: Option<String>) -> Self {
        if let Some(database) = value
            && !database.is_empty()
        {
            self.database = PathBuf::from(database);
        }
        self
    }

    pub fn allowlist(&self) -> AllowList {
        self.allowlist.clone().unwrap_or_else(AllowList::builtin)
    }

    pub fn binding(&self) -> Binding {
        if self.strict_params {
            Binding::Strict
        } else {
            Binding::Lenient
        }
    }

    pub fn gate(&self) -> PriorityGate {
        PriorityGate::new(Duration::from_secs(self.priority_wait_secs))
    }

    fn in_memory(&self) -> bool {
        self.database == Path::new(MEMORY_DATABASE)
    }

    /// Durable store on `database` plus the configured cache. With a
    /// `:memory:` database the `sqlite` cache driver is process-local too.
    pub fn status_store(&self) -> Result<StatusStore, BgrunError> {
        let jobs: Arc<dyn JobStore> = if self.in_memory() {
            Arc::new(InMemoryJobStore::new())
        } else {
            Arc::new(SqliteJobStore::open(&self.database)?)
        };
        let cache: Arc<dyn StatusCache> = match self.cache.driver {
            CacheDriver::Sqlite if self.in_memory() => Arc::new(InMemoryStatusCache::new()),
            CacheDriver::Sqlite => Arc::new(SqliteStatusCache::open(&self.database)?),
            CacheDriver::Memory => Arc::new(InMemoryStatusCache::new()),
            #[cfg(feature = "redis")]
            CacheDriver::Redis => Arc::new(crate::store::RedisStatusCache::open(&self.cache.redis_url)?),
            #[cfg(not(feature = "redis"))]
            CacheDriver::Redis => {
                return Err(BgrunError::Config(
                    "cache driver `redis` needs a build with the `redis` feature".into(),
                ));
            }
        };
        Ok(StatusStore::new(
            jobs,
            cache,
            Duration::from_secs(self.cache.ttl_secs),
        ))
    }
}
