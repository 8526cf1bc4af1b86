//! Errors surfaced to test drivers
//!
//! `OcppError` covers the wire and async side; `Error` is what the
//! synchronous caller surface returns.

use thiserror::Error;

use crate::ocpp::{ConfigurationStatus, OcppError, TriggerMessageStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("charge point {0} not connected")]
    NotFound(String),

    #[error("charge point {0} is already connected")]
    DuplicateSession(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("message {0} is not triggerable")]
    UnsupportedTrigger(String),

    #[error("message {message} was rejected, reason: {status:?}")]
    TriggerRejected {
        message: String,
        status: TriggerMessageStatus,
    },

    #[error("invalid value for {key}: {reason}")]
    Validation { key: String, reason: String },

    #[error("unable to change {key}, charge point reported {status:?}")]
    ConfigRejected {
        key: String,
        status: ConfigurationStatus,
    },

    #[error("unable to read {key}: {reason}")]
    ConfigRead { key: String, reason: String },

    #[error("a call to charge point {0} is already in flight")]
    ConcurrentCall(String),

    #[error("blocking call issued from inside the central system runtime")]
    CalledFromRuntime,

    #[error("central system already running on {addr}:{port}")]
    AlreadyRunning { addr: String, port: u16 },

    #[error("central system is not running")]
    NotRunning,

    #[error(transparent)]
    Protocol(OcppError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OcppError> for Error {
    fn from(e: OcppError) -> Self {
        match e {
            OcppError::Timeout => Error::Timeout("charge point response".to_string()),
            other => Error::Protocol(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
