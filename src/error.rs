use thiserror::Error;

/// Failure reported by a pin driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("pin unavailable: {0}")]
    Unavailable(String),
    #[error("driver i/o failed: {0}")]
    Io(String),
    #[error("driver queue is full")]
    Busy,
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to the caller of a registry command or a pin link
/// write. Validation failures mutate nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("pin {0} was already registered")]
    AlreadyRegistered(String),
    #[error("pin {0} was not found")]
    PinNotFound(String),
    #[error("pin {0} has no capability for type {1}")]
    CapsNotFound(String, String),
    #[error("unknown pin type: {0}")]
    UnknownType(String),
    #[error("pin link is closed")]
    LinkClosed,
    #[error("pin registry is shut down")]
    RegistryClosed,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl PinError {
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        PinError::InvalidArgs(msg.into())
    }
}
