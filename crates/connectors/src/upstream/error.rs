//! Error taxonomy of the upstream connector.

/// Result type for upstream connector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the upstream connector.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad configuration, fatal at activation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed frame or command; fatal for the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The payload decoder rejected a message body.
    #[error("Decode error at offset {offset}: {source}")]
    Decode {
        offset: i64,
        #[source]
        source: DecodeError,
    },

    /// Connect, read or write failure. Surfaces as a disconnect.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocked handover was interrupted; buffered data would be lost.
    #[error("Handover interrupted: {0}")]
    Interrupted(String),

    /// A new partition could not be built.
    #[error("Partition error: {0}")]
    Partition(String),

    /// The event loop is gone.
    #[error("Event loop closed")]
    Closed,
}

/// Failure of a payload decoder.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<Error> for sluice_api::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Config(msg) => sluice_api::Error::Config(msg),
            Error::Io(e) => sluice_api::Error::Io(e),
            Error::Partition(msg) => sluice_api::Error::State(msg),
            other => sluice_api::Error::Fatal(other.to_string()),
        }
    }
}
