//! Engine configuration and the YAML job manifest.
//!
//! Configuration is deserialized from YAML with serde; every field has a
//! default so an empty document is a valid configuration. A manifest bundles
//! engine settings with a list of named job definitions whose dependencies
//! reference earlier entries by name.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for the expected shape.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document parsed but the values are unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunable engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How often the dispatcher polls the store, in seconds.
    #[serde(with = "serde_duration_secs")]
    pub poll_interval: Duration,
    /// Maximum number of jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// Retry budget applied to manifest jobs that do not set their own.
    pub default_max_retries: u32,
    /// Base of the exponential retry backoff, in seconds.
    pub retry_base: u32,
    /// Ceiling on a single retry delay, in seconds.
    #[serde(with = "serde_duration_secs")]
    pub max_retry_delay: Duration,
    /// Execution time budget for jobs without their own, in seconds.
    /// `None` means unlimited.
    #[serde(with = "serde_opt_duration_secs")]
    pub execution_timeout: Option<Duration>,
    /// Interval between resource-usage samples, in seconds.
    #[serde(with = "serde_duration_secs")]
    pub stats_interval: Duration,
    /// How long shutdown waits for running jobs before abandoning them,
    /// in seconds.
    #[serde(with = "serde_duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrent_jobs: 4,
            default_max_retries: 3,
            retry_base: 5,
            max_retry_delay: Duration::from_secs(86_400),
            execution_timeout: None,
            stats_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Check invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.retry_base == 0 {
            return Err(ConfigError::Invalid("retry_base must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

/// One named job definition in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobManifest {
    /// Unique name within the manifest; dependency references use it.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Names of manifest jobs this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Retry budget; falls back to the engine default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Execution time budget in seconds; falls back to the engine default.
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    /// Opaque external entity references.
    #[serde(default)]
    pub related_entities: Vec<String>,
}

/// A manifest document: engine settings plus the job graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Engine settings; all optional.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Job definitions, in submission order.
    #[serde(default)]
    pub jobs: Vec<JobManifest>,
}

impl Manifest {
    /// Load and validate a manifest from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a manifest from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let manifest: Manifest = serde_yaml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate engine settings and the job graph.
    ///
    /// Job names must be unique and every `depends_on` entry must name a job
    /// defined earlier in the list, which rules out cycles at parse time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;

        let mut seen: HashSet<&str> = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(ConfigError::Invalid("job name must not be empty".into()));
            }
            if job.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job '{}' has an empty command",
                    job.name
                )));
            }
            for dep in &job.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}' depends on '{}', which is not defined before it",
                        job.name, dep
                    )));
                }
            }
            if !seen.insert(&job.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
        }
        Ok(())
    }
}

/// Serde helper for durations stored as whole seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Serde helper for optional durations stored as whole seconds.
mod serde_opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
