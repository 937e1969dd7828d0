//! Error taxonomy for the matching engine.
//!
//! "No match" is not an error anywhere in this crate; searches that exhaust
//! their step list return `None`. The variants here cover the remaining
//! failure classes: bad input bytes (fatal to one file), I/O (fatal to one
//! file), and structural inconsistencies that indicate a configuration
//! defect rather than bad input (fatal to the whole run).

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Corrupt or unrecognized frame/header bytes.
    #[error("format error: {0}")]
    Format(String),

    /// Underlying storage unreadable or unwritable.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural inconsistency such as a sample-count-per-frame mismatch
    /// between pattern and target. Unrecoverable for the whole run.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}
