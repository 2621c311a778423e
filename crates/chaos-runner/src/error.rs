//! Error types for chaos-runner.

use chaos_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The topology file could not be read.
    #[error("Failed to read topology {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The topology is not valid YAML for the expected schema.
    #[error("Failed to parse topology: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The embedded protocol configuration is invalid.
    #[error("Invalid protocol configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Topology has no nodes")]
    NoNodes,

    #[error("Node id {0} is declared more than once")]
    DuplicateNode(u16),

    #[error("No node is marked as initiator")]
    NoInitiator,

    #[error("Nodes {first} and {second} are both marked as initiator")]
    MultipleInitiators { first: u16, second: u16 },

    /// A link refers to a node that is not declared.
    #[error("Link refers to unknown node {0}")]
    UnknownNode(u16),

    #[error("Node {0} is linked to itself")]
    SelfLink(u16),

    /// A probability lies outside `[0, 1]`.
    #[error("{what} must lie in [0, 1] (got {value})")]
    InvalidProbability { what: &'static str, value: f64 },
}

impl TopologyError {
    /// Create an I/O error for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TopologyError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while building or running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A node could not be set up.
    #[error("Node setup failed: {0}")]
    Config(#[from] ConfigError),

    /// The simulated duration is not a positive number of seconds.
    #[error("Invalid simulation duration: {0} s")]
    InvalidDuration(f64),

    #[error("Failed to serialize results: {0}")]
    Json(#[from] serde_json::Error),
}
