//! Error taxonomy shared by the store, the network clients and the album
//! coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No connectivity, transport failure or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service answered with a non-2xx status.
    #[error("Server responded with status {0}")]
    Server(u16),

    /// The search payload could not be decoded.
    #[error("Could not decode search response: {0}")]
    Decode(String),

    /// A local database write or read failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer was aborted by the caller. Not a failure.
    #[error("Download cancelled")]
    Cancelled,

    /// A download for this URL is already running; the first caller owns it.
    #[error("Download already in progress for {0}")]
    AlreadyInFlight(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Errors that must never reach the user as an alert.
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Cancelled | Error::AlreadyInFlight(_))
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Io(_))
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Error::Server(code),
            ureq::Error::Transport(transport) => Error::Network(transport.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
