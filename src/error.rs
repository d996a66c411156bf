//! Error types for topocache
//!
//! All modules use `TopoResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for topocache operations
pub type TopoResult<T> = Result<T, TopoError>;

/// All errors that can occur in topocache
#[derive(Error, Debug)]
pub enum TopoError {
    // Info record errors
    #[error("{record} is immutable: cannot modify attribute '{attribute}'")]
    Immutability {
        record: &'static str,
        attribute: String,
    },

    #[error("Invalid {record} record: {reason}")]
    InvalidRecord {
        record: &'static str,
        reason: String,
    },

    // Detection errors
    #[error("Topology probe failed for partition {partition}: {reason}")]
    ProbeFailure { partition: String, reason: String },

    #[error("No topology detection path for partition {partition}: {reason}")]
    ConfigurationFatal { partition: String, reason: String },

    #[error("Host introspection unavailable: {0}")]
    IntrospectionUnavailable(String),

    #[error("Cannot resolve the topology cache root: no home directory and no override set")]
    TopologyRootUnresolved,

    // Scheduler errors
    #[error("Scheduler '{0}' cannot submit jobs")]
    SubmissionUnsupported(String),

    #[error("Unknown scheduler: {0}")]
    UnknownScheduler(String),

    #[error("Job submission failed: {0}")]
    JobSubmit(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TopoError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a probe failure for a partition
    pub fn probe_failure(partition: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProbeFailure {
            partition: partition.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error only affects the partition being detected
    ///
    /// Partition-scoped errors are absorbed by the detector (fallback or
    /// per-partition report) and never abort detection of sibling partitions.
    pub fn is_partition_scoped(&self) -> bool {
        matches!(
            self,
            Self::ProbeFailure { .. }
                | Self::ConfigurationFatal { .. }
                | Self::IntrospectionUnavailable(_)
                | Self::SubmissionUnsupported(_)
                | Self::JobSubmit(_)
                | Self::CommandFailed { .. }
                | Self::CommandExecution { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::TopologyRootUnresolved => {
                Some("Set HOME or pass --topology-dir / TOPOCACHE_TOPOLOGY_DIR")
            }
            Self::ConfigurationFatal { .. } => Some(
                "Configure the partition's processor in config.toml or use a scheduler that can submit jobs",
            ),
            Self::UnknownScheduler(_) => Some("Supported schedulers: local, slurm"),
            Self::ConfigInvalid { .. } => Some("Run: topocache config show"),
            _ => None,
        }
    }
}
