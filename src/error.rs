use std::time::Duration;

use thiserror::Error;

/// Field-bus access errors.
///
/// Transport-class errors (`Transport`, `Timeout`, `NotConnected`) are
/// recoverable: the driver drops the connection and the next operation
/// reconnects. The remaining variants are protocol or configuration faults
/// and leave the connection up.
#[derive(Debug, Error)]
pub enum FieldBusError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("device exception: {0}")]
    Exception(String),

    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    #[error("register `{0}` is read-only")]
    NotWritable(String),

    #[error("value {value} does not fit register `{register}`")]
    OutOfRange { register: String, value: f64 },

    #[error("word count mismatch for register `{register}`: got {got}, want {want}")]
    WordCount {
        register: String,
        got: usize,
        want: usize,
    },

    #[error("not connected")]
    NotConnected,
}

impl FieldBusError {
    /// True for errors that indicate the transport itself is unhealthy.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FieldBusError::Transport(_) | FieldBusError::Timeout(_) | FieldBusError::NotConnected
        )
    }
}

/// Errors raised while applying configuration documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("register map is empty")]
    EmptyRegisterMap,

    #[error("duplicate register name `{0}`")]
    DuplicateRegister(String),
}
