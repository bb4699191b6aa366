//! Configuration management for JitSpill
//!
//! Settings are resolved with the following precedence:
//! - Environment variables (`JITSPILL__DEVICE_MEMORY_LIMIT=...`)
//! - Config file named by the `JITSPILL_CONFIG` env var
//! - `./config/jitspill.{toml,yaml,json}`
//! - Hardcoded defaults

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Sub-path appended to the spill root.
pub const SPILL_SUBDIR: [&str; 2] = ["jitspill-worker-space", "disk-storage"];

const DEFAULT_DEVICE_MEMORY_LIMIT: u64 = 1 << 30;
const DEFAULT_MEMORY_LIMIT: u64 = 4 << 30;

/// Settings for a spilling host file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpillConfig {
    /// Bytes of device memory used before spilling to host.
    pub device_memory_limit: u64,

    /// Bytes of host memory used before spilling to disk.
    pub memory_limit: u64,

    /// Root directory for spill files.
    #[serde(default)]
    pub local_directory: Option<PathBuf>,

    /// Process temporary directory, used when `local_directory` is unset.
    #[serde(default)]
    pub temporary_directory: Option<PathBuf>,

    /// Whether the spill directory is shared between workers.
    /// A shared filesystem must support hard links.
    #[serde(default)]
    pub shared_filesystem: bool,

    /// Unwrap proxies before handing values back to callers.
    #[serde(default)]
    pub compatibility_mode: bool,

    /// Spill from device when the allocator runs out of memory.
    #[serde(default = "default_true")]
    pub spill_on_demand: bool,

    /// Gzip spilled frames when it makes them smaller.
    #[serde(default = "default_true")]
    pub compression: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            device_memory_limit: DEFAULT_DEVICE_MEMORY_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            local_directory: None,
            temporary_directory: None,
            shared_filesystem: false,
            compatibility_mode: false,
            spill_on_demand: true,
            compression: true,
        }
    }
}

impl SpillConfig {
    /// Create a config with explicit limits and defaults for everything else.
    pub fn with_limits(device_memory_limit: u64, memory_limit: u64) -> Self {
        Self {
            device_memory_limit,
            memory_limit,
            ..Self::default()
        }
    }

    /// Load configuration from the environment and the default file locations.
    pub fn load() -> CoreResult<Self> {
        let mut builder = Self::set_defaults(Config::builder())?
            .add_source(File::with_name("./config/jitspill").required(false));

        // Later sources take precedence
        if let Ok(config_path) = std::env::var("JITSPILL_CONFIG") {
            tracing::debug!(path = %config_path, "Loading spill config file");
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(
                Environment::with_prefix("JITSPILL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: SpillConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(?config, "Loaded spill config");
        Ok(config)
    }

    /// Load configuration from a single file on top of the defaults.
    pub fn load_from(path: &Path) -> CoreResult<Self> {
        let builder = Self::set_defaults(Config::builder())?
            .add_source(File::from(path).required(true));

        let config: SpillConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("device_memory_limit", DEFAULT_DEVICE_MEMORY_LIMIT)?
            .set_default("memory_limit", DEFAULT_MEMORY_LIMIT)?
            .set_default("shared_filesystem", false)?
            .set_default("compatibility_mode", false)?
            .set_default("spill_on_demand", true)?
            .set_default("compression", true)
    }

    /// Validate configuration values
    pub fn validate(&self) -> CoreResult<()> {
        if self.device_memory_limit == 0 {
            return Err(CoreError::ValidationError(
                "device_memory_limit must be > 0".to_string(),
            ));
        }
        if self.memory_limit == 0 {
            return Err(CoreError::ValidationError(
                "memory_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory that spill files are written to.
    ///
    /// Falls back from `local_directory` to `temporary_directory` to the
    /// current working directory.
    pub fn spill_directory(&self) -> CoreResult<PathBuf> {
        let root = match self
            .local_directory
            .as_ref()
            .or(self.temporary_directory.as_ref())
        {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(SPILL_SUBDIR.iter().fold(root, |path, part| path.join(part)))
    }
}
