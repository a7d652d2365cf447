//! Configuration file handling.
//!
//! All values are optional in the file; the resolved settings fall back to
//! built-in defaults. Command line arguments override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use cardserver_protocol::SourceSelection;

use crate::device::sim::SimulatedEnvironment;
use crate::device::Profile;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cardserver.toml";

/// Errors when loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid source {key} in simulated profile {profile}: {message}")]
    InvalidSource {
        profile: String,
        key: String,
        message: String,
    },
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub guide: GuideSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct WorkerSection {
    pub idle_interval_ms: Option<u64>,
    pub watchdog_throttle_ms: Option<u64>,
    pub group_info_timeout_ms: Option<u64>,
    pub source_info_timeout_ms: Option<u64>,
    pub group_watchdog_secs: Option<u64>,
    pub decryption_watchdog_secs: Option<u64>,
    pub retest_watchdog_secs: Option<u64>,
    pub group_restart_limit: Option<u32>,
    pub decryption_restart_limit: Option<u32>,
    pub group_restart_reset: Option<GroupRestartReset>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GuideSection {
    pub item_check_secs: Option<u64>,
    pub retune_secs: Option<u64>,
    pub tune_check_timeout_ms: Option<u64>,
    pub freesat_trigger: Option<String>,
    pub premiere_direct_trigger: Option<String>,
    pub premiere_sport_trigger: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SimulationSection {
    #[serde(default)]
    pub profiles: Vec<SimulatedProfileSection>,
}

#[derive(Debug, Deserialize)]
pub struct SimulatedProfileSection {
    pub name: String,
    pub consumer_limit: Option<usize>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub pipeline_extensions: Vec<String>,
    pub use_sources_from: Option<String>,
    #[serde(default)]
    pub parameters: std::collections::BTreeMap<String, String>,
}

/// When the group restart counter goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupRestartReset {
    /// Only an explicit group selection resets the counter.
    #[default]
    OnSelect,
    /// Receiving group information again also resets it.
    OnRecovery,
}

/// Resolved worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub idle_interval: Duration,
    pub watchdog_throttle: Duration,
    pub group_info_timeout: Duration,
    pub source_info_timeout: Duration,
    /// `None` disables the group watchdog.
    pub group_watchdog: Option<Duration>,
    /// `None` disables the decryption watchdog.
    pub decryption_watchdog: Option<Duration>,
    pub retest_watchdog: Duration,
    pub group_restart_limit: u32,
    pub decryption_restart_limit: u32,
    pub group_restart_reset: GroupRestartReset,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(2500),
            watchdog_throttle: Duration::from_secs(5),
            group_info_timeout: Duration::from_secs(15),
            source_info_timeout: Duration::from_secs(15),
            group_watchdog: Some(Duration::from_secs(15)),
            decryption_watchdog: Some(Duration::from_secs(10)),
            retest_watchdog: Duration::ZERO,
            group_restart_limit: 3,
            decryption_restart_limit: 3,
            group_restart_reset: GroupRestartReset::OnSelect,
        }
    }
}

/// Zero seconds disable a watchdog.
fn watchdog(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

impl WorkerConfig {
    pub fn from_section(section: &WorkerSection) -> Self {
        let defaults = Self::default();
        Self {
            idle_interval: section
                .idle_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_interval),
            watchdog_throttle: section
                .watchdog_throttle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.watchdog_throttle),
            group_info_timeout: section
                .group_info_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.group_info_timeout),
            source_info_timeout: section
                .source_info_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.source_info_timeout),
            group_watchdog: section.group_watchdog_secs.map(watchdog).unwrap_or(defaults.group_watchdog),
            decryption_watchdog: section
                .decryption_watchdog_secs
                .map(watchdog)
                .unwrap_or(defaults.decryption_watchdog),
            retest_watchdog: section
                .retest_watchdog_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retest_watchdog),
            group_restart_limit: section.group_restart_limit.unwrap_or(defaults.group_restart_limit),
            decryption_restart_limit: section
                .decryption_restart_limit
                .unwrap_or(defaults.decryption_restart_limit),
            group_restart_reset: section.group_restart_reset.unwrap_or_default(),
        }
    }
}

/// Resolved guide collection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GuideConfig {
    pub item_check_secs: u64,
    pub retune_secs: u64,
    pub tune_check_timeout_ms: u64,
    pub freesat_trigger: String,
    pub premiere_direct_trigger: Option<String>,
    pub premiere_sport_trigger: Option<String>,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            item_check_secs: 10,
            retune_secs: 60,
            tune_check_timeout_ms: 5000,
            freesat_trigger: "(59, 2315, 10500)".to_string(),
            premiere_direct_trigger: None,
            premiere_sport_trigger: None,
        }
    }
}

impl GuideConfig {
    pub fn from_section(section: &GuideSection) -> Self {
        let defaults = Self::default();
        Self {
            item_check_secs: section
                .item_check_secs
                .filter(|&secs| secs > 0)
                .unwrap_or(defaults.item_check_secs),
            retune_secs: section.retune_secs.unwrap_or(defaults.retune_secs),
            tune_check_timeout_ms: section.tune_check_timeout_ms.unwrap_or(defaults.tune_check_timeout_ms),
            freesat_trigger: section.freesat_trigger.clone().unwrap_or(defaults.freesat_trigger),
            premiere_direct_trigger: section.premiere_direct_trigger.clone(),
            premiere_sport_trigger: section.premiere_sport_trigger.clone(),
        }
    }

    pub fn item_check_interval(&self) -> Duration {
        Duration::from_secs(self.item_check_secs)
    }

    pub fn retune_interval(&self) -> Duration {
        Duration::from_secs(self.retune_secs)
    }
}

/// Everything a card server session needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub worker: WorkerConfig,
    pub guide: GuideConfig,
}

impl ConfigFile {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Explicit path > `./cardserver.toml` > defaults.
    ///
    /// Returns the path actually loaded, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(|| {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            default_path.exists().then_some(default_path)
        });

        match path {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            worker: WorkerConfig::from_section(&self.worker),
            guide: GuideConfig::from_section(&self.guide),
        }
    }

    /// Build the simulated device described by `[[simulation.profiles]]`.
    pub fn simulation(&self) -> Result<SimulatedEnvironment, ConfigError> {
        let mut environment = SimulatedEnvironment::new();
        for section in &self.simulation.profiles {
            let sources = section
                .sources
                .iter()
                .map(|key| {
                    SourceSelection::parse(key).map_err(|fault| ConfigError::InvalidSource {
                        profile: section.name.clone(),
                        key: key.clone(),
                        message: fault.message,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let profile = Profile {
                name: section.name.clone(),
                parameters: section.parameters.clone(),
                use_sources_from: section.use_sources_from.clone(),
                locations: Vec::new(),
                sources,
                pipeline_extensions: section.pipeline_extensions.clone(),
            };
            environment = environment.with_profile(profile, section.consumer_limit);
        }
        Ok(environment)
    }
}
