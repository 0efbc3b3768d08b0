use thiserror::Error;

pub type InfuseResult<T> = Result<T, InfuseError>;

/// Error taxonomy shared across the platform.
///
/// Every variant that mirrors a POSIX errno reports it through
/// [`InfuseError::errno`], so the negative return-code contract of the
/// device firmware remains observable to callers and tests.
#[derive(Debug, Error)]
pub enum InfuseError {
    #[error("data not ready")]
    Again,

    #[error("insufficient space")]
    NoMem,

    #[error("will never fit")]
    NoSpace,

    #[error("not present")]
    NotFound,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("operation not supported")]
    NotSupported,

    #[error("transport not connected")]
    NotConnected,

    #[error("resource busy")]
    Busy,

    #[error("already exists")]
    AlreadyExists,

    #[error("device not ready")]
    NoDevice,

    #[error("peripheral error: {0}")]
    Peripheral(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InfuseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        InfuseError::Invalid(msg.into())
    }

    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            InfuseError::Again => -11,
            InfuseError::NoMem => -12,
            InfuseError::NoSpace => -28,
            InfuseError::NotFound => -2,
            InfuseError::Invalid(_) | InfuseError::Config(_) => -22,
            InfuseError::NotSupported => -134,
            InfuseError::NotConnected => -128,
            InfuseError::Busy => -16,
            InfuseError::AlreadyExists => -120,
            InfuseError::NoDevice => -19,
            InfuseError::Peripheral(_) | InfuseError::Io(_) | InfuseError::Other(_) => -5,
        }
    }

    /// Errors a caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InfuseError::Again
                | InfuseError::NotConnected
                | InfuseError::Peripheral(_)
                | InfuseError::Io(_)
        )
    }
}
