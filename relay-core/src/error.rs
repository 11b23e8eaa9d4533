use thiserror::Error;

use crate::batch::BatchError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The component lost its connection to the target source or sink. The
    /// caller is expected to re-establish the connection and retry.
    #[error("not connected to target source or sink")]
    NotConnected,

    /// The component was closed and will not serve further requests.
    #[error("type was closed")]
    TypeClosed,

    #[error("action timed out")]
    Timeout,

    #[error("type already started")]
    AlreadyStarted,

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Mapping Error - {0}")]
    Mapping(String),

    #[error("Processor Error - {0}")]
    Processor(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Tracker Error - {0}")]
    Tracker(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    /// A sparse per-part failure set attached to an otherwise acknowledged
    /// batch.
    #[error(transparent)]
    Batch(Box<BatchError>),
}

impl Error {
    pub fn batch(err: BatchError) -> Self {
        Error::Batch(Box::new(err))
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        Error::batch(err)
    }
}
