//!
//! Crate-wide error type
//!
//! Score queries return `-inf` (`Prob::zero()`) for zero-probability events;
//! that is a value, not an error. Errors cover structurally invalid input
//! (paths, sequences, model descriptions) and failed computations.
//!
use thiserror::Error;

/// Main error type for hohmm operations
#[derive(Error, Debug)]
pub enum HmmError {
    /// A state path is structurally impossible under the model
    /// (broken transition link, or the path ends on a non-final state)
    #[error("invalid path: {message}")]
    InvalidPath { message: String },

    /// Sequence length incompatible with the model
    #[error("wrong length: {message}")]
    WrongLength { message: String },

    /// Sequence symbol outside the model alphabet
    #[error("wrong alphabet: {message}")]
    WrongAlphabet { message: String },

    /// Inference requested before training/sampling produced parameters
    #[error("not trained: {message}")]
    NotTrained { message: String },

    /// Training-parameter kind not supported by this model variant
    #[error("unsupported training mode: {message}")]
    UnsupportedTrainingMode { message: String },

    /// Model description rejected at construction
    /// (duplicate or unreachable contexts, silent cycles, dimension mismatch)
    #[error("wrong model: {message}")]
    WrongModel { message: String },

    /// Wrapper for anything that failed inside a DP computation,
    /// raised once at the outermost score boundary
    #[error("computation failed: {message}")]
    Computation { message: String },

    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence decode errors
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Type alias for Results using HmmError
pub type Result<T> = std::result::Result<T, HmmError>;

impl HmmError {
    /// Create an invalid path error
    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            message: message.into(),
        }
    }

    /// Create a wrong length error
    pub fn wrong_length(message: impl Into<String>) -> Self {
        Self::WrongLength {
            message: message.into(),
        }
    }

    /// Create a wrong alphabet error
    pub fn wrong_alphabet(message: impl Into<String>) -> Self {
        Self::WrongAlphabet {
            message: message.into(),
        }
    }

    /// Create a not trained error
    pub fn not_trained(message: impl Into<String>) -> Self {
        Self::NotTrained {
            message: message.into(),
        }
    }

    /// Create an unsupported training mode error
    pub fn unsupported_training_mode(message: impl Into<String>) -> Self {
        Self::UnsupportedTrainingMode {
            message: message.into(),
        }
    }

    /// Create a wrong model error
    pub fn wrong_model(message: impl Into<String>) -> Self {
        Self::WrongModel {
            message: message.into(),
        }
    }

    /// Create a computation error
    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = HmmError::invalid_path("path ends in non-final state 3");
        assert_eq!(e.to_string(), "invalid path: path ends in non-final state 3");
        let e = HmmError::wrong_alphabet("symbol 'X' at position 4");
        assert_eq!(e.to_string(), "wrong alphabet: symbol 'X' at position 4");
    }

    #[test]
    fn error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: HmmError = io.into();
        assert!(matches!(e, HmmError::Io(_)));
    }
}
