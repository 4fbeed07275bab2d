//! Configuration schema for chunkcache
//!
//! Configuration is stored at `~/.config/chunkcache/config.toml`

use crate::config::size::ByteSize;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum cache footprint
pub const DEFAULT_CACHE_SIZE: ByteSize = ByteSize::gib(10);

/// Default cache line (chunk) size
pub const DEFAULT_CACHE_LINE_SIZE: ByteSize = ByteSize::mib(64);

/// Default seconds between eviction refreshes
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Default seconds to wait for another download of the same entry
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache engine settings
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Profile name; entries live under `<location>/<profile>`
    pub profile: String,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// Where per-entry version metadata is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarMode {
    /// Extended attributes when the cache filesystem supports them, JSON files otherwise
    #[default]
    Auto,
    /// `user.*` extended attributes on the entry itself
    Xattr,
    /// Adjacent `<entry>.meta.json` files
    Json,
}

/// Eviction policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Least recently read entries first
    #[default]
    Lru,
    /// Oldest entries first
    Fifo,
    /// Uniformly random entries
    Random,
    /// Never evict; the size limit is advisory
    NoEviction,
}

/// Eviction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicyConfig {
    /// Policy used to pick victims
    pub policy: EvictionPolicyKind,

    /// Seconds between refresh cycles
    pub refresh_interval: u64,
}

impl Default for EvictionPolicyConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicyKind::Lru,
            refresh_interval: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl EvictionPolicyConfig {
    /// Refresh interval as a duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum total bytes across all profiles
    pub size: ByteSize,

    /// Cache root directory
    pub location: PathBuf,

    /// Chunk size used for range reads
    pub cache_line_size: ByteSize,

    /// Compare cached etags against the source on every read
    pub check_source_version: bool,

    /// Sidecar metadata channel
    pub sidecar: SidecarMode,

    /// Fail instead of falling back when extended attributes are unavailable
    pub require_xattr: bool,

    /// Seconds to wait on another download of the same entry (0 = forever)
    pub lock_timeout: u64,

    /// Eviction settings
    pub eviction_policy: EvictionPolicyConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CACHE_SIZE,
            location: default_cache_location(),
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
            check_source_version: true,
            sidecar: SidecarMode::Auto,
            require_xattr: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT_SECS,
            eviction_policy: EvictionPolicyConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at `location` with default limits
    pub fn with_location(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    /// Maximum cache footprint in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size.as_u64()
    }

    /// Cache line size in bytes
    pub fn cache_line_bytes(&self) -> u64 {
        self.cache_line_size.as_u64()
    }

    /// Lock wait limit, `None` when waiting forever
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout > 0).then(|| Duration::from_secs(self.lock_timeout))
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self, source: &Path) -> CacheResult<()> {
        let invalid = |reason: &str| CacheError::ConfigInvalid {
            path: source.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.size.as_u64() == 0 {
            return Err(invalid("cache.size must be greater than zero"));
        }
        if self.cache_line_size.as_u64() == 0 {
            return Err(invalid("cache.cache_line_size must be greater than zero"));
        }
        if !self.location.is_absolute() {
            return Err(invalid("cache.location must be an absolute path"));
        }
        Ok(())
    }
}

fn default_cache_location() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chunkcache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("size = \"10G\""));
        assert!(toml.contains("cache_line_size = \"64M\""));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.general.profile, "default");
        assert!(config.cache.check_source_version);
        assert_eq!(config.cache.eviction_policy.policy, EvictionPolicyKind::Lru);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            size = "50M"
            location = "/tmp/chunkcache-test"
            cache_line_size = "1M"
            check_source_version = false

            [cache.eviction_policy]
            policy = "no_eviction"
            refresh_interval = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.size_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.cache.cache_line_bytes(), 1024 * 1024);
        assert!(!config.cache.check_source_version);
        assert_eq!(
            config.cache.eviction_policy.policy,
            EvictionPolicyKind::NoEviction
        );
        assert_eq!(
            config.cache.eviction_policy.refresh_interval(),
            Duration::from_secs(5)
        );
        assert_eq!(config.cache.sidecar, SidecarMode::Auto); // default preserved
    }

    #[test]
    fn lock_timeout_zero_means_forever() {
        let mut cache = CacheConfig::default();
        assert_eq!(cache.lock_timeout(), Some(Duration::from_secs(600)));
        cache.lock_timeout = 0;
        assert_eq!(cache.lock_timeout(), None);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let source = Path::new("config.toml");
        let mut cache = CacheConfig::with_location("/tmp/chunkcache");
        assert!(cache.validate(source).is_ok());

        cache.cache_line_size = ByteSize::b(0);
        assert!(cache.validate(source).is_err());

        let relative = CacheConfig::with_location("relative/dir");
        assert!(relative.validate(source).is_err());
    }
}
