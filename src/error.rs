//! Error types for the orchestration core.
//!
//! Errors are split along the line where they are detected:
//!
//! - **`ApiError`**: Failures reported by the [`DeviceApi`](crate::api::DeviceApi)
//!   boundary. Both transport problems (connection refused, timeout) and
//!   application-level failures (the backend answered with an explicit error
//!   status) end up here. They never escape the effect runner: each one is
//!   turned into a `*Failed` event scoped to the resource that produced it.
//! - **`ValidationError`**: Malformed session parameters or pin configurations.
//!   These are caught before a request is built, so they never cost a backend
//!   round trip.
//! - **`CommandError`**: What a caller gets back when the orchestrator refuses a
//!   command (validation failure, unknown port, port already busy, or the
//!   orchestrator has shut down).
//! - **`BrewError`**: Crate-level error used by configuration loading and the
//!   binary, wrapping the above with `#[from]` so `?` works across layers.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BrewError>;

/// Failures at the device backend boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The backend could not be reached or the connection broke mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend did not answer within the configured bound.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with an explicit failure status.
    #[error("{0}")]
    Application(String),

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// A request URL could not be built from the configured base URL.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// True for failures that never reached the backend's application layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(_) | ApiError::Timeout(_) | ApiError::InvalidUrl(_)
        )
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Local validation failures for session parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A pin mode other than `in`/`out`.
    #[error("pin {pin}: mode has to be one of [in, out], not '{value}'")]
    PinMode {
        /// Offending pin id
        pin: String,
        /// Value that was supplied
        value: String,
    },

    /// A pin kind other than analog/digital.
    #[error("pin {pin}: kind has to be one of [a, d], not '{value}'")]
    PinKind {
        /// Offending pin id
        pin: String,
        /// Value that was supplied
        value: String,
    },

    /// A pin id that is neither `<digits>` nor `a<digits>`.
    #[error("invalid pin format: '{0}'")]
    PinId(String),

    /// The same pin was configured twice.
    #[error("pin {0} configured more than once")]
    DuplicatePin(String),

    /// A comma-separated pin specification whose field count is not a multiple of three.
    #[error("pin config parameters must be a multiple of 3, got {0}")]
    PinFieldCount(usize),

    /// A numeric parameter outside its accepted range.
    #[error("{name} must be in {min}..={max}, got {value}")]
    OutOfRange {
        /// Parameter name
        name: &'static str,
        /// Supplied value
        value: u64,
        /// Inclusive lower bound
        min: u64,
        /// Inclusive upper bound
        max: u64,
    },

    /// A port name that cannot be addressed on the backend.
    #[error("invalid port name: '{0}'")]
    PortName(String),
}

/// Why the orchestrator refused a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Parameters failed local validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The port is not in the store (never fetched, or removed by a refresh).
    #[error("unknown port: {0}")]
    UnknownPort(String),

    /// An initialize or shutdown for this port is already in flight.
    #[error("port {0} already has an operation in flight")]
    PortBusy(String),

    /// The orchestrator task is no longer running.
    #[error("orchestrator is not running")]
    Closed,
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum BrewError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Logging could not be initialized.
    #[error("Tracing initialization error: {0}")]
    Tracing(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend call failed.
    #[error("Device API error: {0}")]
    Api(#[from] ApiError),

    /// Command rejected by the orchestrator.
    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),
}

impl From<figment::Error> for BrewError {
    fn from(err: figment::Error) -> Self {
        BrewError::Config(Box::new(err))
    }
}

impl From<ValidationError> for BrewError {
    fn from(err: ValidationError) -> Self {
        BrewError::Command(CommandError::Validation(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_a_transport_failure() {
        assert!(ApiError::Timeout(Duration::from_secs(2)).is_transport());
        assert!(ApiError::Transport("refused".into()).is_transport());
        assert!(!ApiError::Application("remote not registered".into()).is_transport());
    }

    #[test]
    fn application_error_displays_backend_message_verbatim() {
        let err = ApiError::Application("port already in use".into());
        assert_eq!(err.to_string(), "port already in use");
    }

    #[test]
    fn validation_error_lifts_into_brew_error() {
        let err: BrewError = ValidationError::PinFieldCount(4).into();
        match err {
            BrewError::Command(CommandError::Validation(ValidationError::PinFieldCount(n))) => {
                assert_eq!(n, 4)
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
