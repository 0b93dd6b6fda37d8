// rust/federation-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FederationError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Node '{node_id}' is already registered")]
    DuplicateNode {
        node_id: String,
    },

    #[error("Node '{node_id}' is not registered")]
    UnknownNode {
        node_id: String,
    },

    #[error("Round {round_id} does not exist")]
    UnknownRound {
        round_id: u64,
    },

    #[error("Node '{node_id}' is not in the cohort of round {round_id}")]
    NotInCohort {
        round_id: u64,
        node_id: String,
    },

    #[error("Round {round_id} cannot move from {from} to {to}")]
    InvalidTransition {
        round_id: u64,
        from: String,
        to: String,
    },

    #[error("Insufficient quorum: {available} contributions, {required} required")]
    InsufficientQuorum {
        required: usize,
        available: usize,
    },

    #[error("Incompatible aggregation scheme: {message}")]
    IncompatibleScheme {
        message: String,
    },

    #[error("Privacy error: {message}")]
    Privacy {
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, FederationError>;

// Convenience constructors
impl FederationError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn duplicate_node(node_id: impl Into<String>) -> Self {
        Self::DuplicateNode {
            node_id: node_id.into(),
        }
    }

    pub fn unknown_node(node_id: impl Into<String>) -> Self {
        Self::UnknownNode {
            node_id: node_id.into(),
        }
    }

    pub fn unknown_round(round_id: u64) -> Self {
        Self::UnknownRound { round_id }
    }

    pub fn not_in_cohort(round_id: u64, node_id: impl Into<String>) -> Self {
        Self::NotInCohort {
            round_id,
            node_id: node_id.into(),
        }
    }

    pub fn invalid_transition(
        round_id: u64,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            round_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn insufficient_quorum(required: usize, available: usize) -> Self {
        Self::InsufficientQuorum { required, available }
    }

    pub fn incompatible_scheme(message: impl Into<String>) -> Self {
        Self::IncompatibleScheme {
            message: message.into(),
        }
    }

    pub fn privacy(message: impl Into<String>) -> Self {
        Self::Privacy {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
