use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the process held under the ceiling.
pub const PROCESS_NAME: &str = "adguardvpn-cli";

/// Where a fresh instance is launched from.
pub const PROCESS_PATH: &str = "/opt/adguardvpn_cli/adguardvpn-cli";

/// Resident memory ceiling: 250 MiB.
pub const MEMORY_LIMIT_BYTES: u64 = 250 * 1024 * 1024;

/// Interval between resident memory reads of the tracked process.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Back-off after a discovery pass finds no matching process.
pub const NOT_FOUND_DELAY: Duration = Duration::from_secs(15);

/// Default location of the optional deployment config.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/memwarden.toml";

/// The process under watch. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    name: String,
    path: PathBuf,
    ceiling_bytes: u64,
}

impl TargetSpec {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        ceiling_bytes: u64,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::Invalid(
                "target process name must not be empty".to_string(),
            ));
        }
        if ceiling_bytes == 0 {
            return Err(ConfigError::Invalid(
                "memory ceiling must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            name,
            path: path.into(),
            ceiling_bytes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }
}

/// Loop cadence. Production always uses [`Timing::default`]; tests shrink it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub not_found_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            not_found_delay: NOT_FOUND_DELAY,
        }
    }
}

/// Deployment settings loaded from `memwarden.toml`.
///
/// Only host plumbing lives here (log and state locations, cgroup mount,
/// notifications). The target and its ceiling are compiled in.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub log: LogConfig,
    pub state: StateConfig,
    pub notify: NotifyConfig,
    pub cgroup: CgroupConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub events_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub command: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    pub mount: PathBuf,
    pub parent: String,
}

// --- Default implementations ---

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            events_file: PathBuf::from("/var/log/memwarden/events.log"),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/memwarden"),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "notify-send".to_string(),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            mount: PathBuf::from("/sys/fs/cgroup"),
            parent: "memwarden".to_string(),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load the deployment config. A missing file yields the defaults; a file
/// that exists but cannot be read or parsed is an error.
pub fn load_config(path: &Path) -> Result<WardenConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: WardenConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    if config.cgroup.parent.is_empty() || config.cgroup.parent.contains('/') {
        return Err(ConfigError::Invalid(format!(
            "cgroup.parent must be a single path component, got {:?}",
            config.cgroup.parent
        )));
    }

    Ok(config)
}
