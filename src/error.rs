use std::io;

use thiserror::Error;

/// Errors produced by index construction, persistence and range extraction.
#[derive(Error, Debug)]
pub enum Error {
    /// The gzip or deflate structure is invalid. Never retried.
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// The compressed input ended before the current block or member completed.
    #[error("compressed input ended unexpectedly")]
    TruncatedInput,

    /// A persisted index failed validation and must be rebuilt.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// The source changed since the index was built.
    #[error(
        "index does not match source (index: {expected_size} bytes, crc {expected_checksum:#010x}; \
         source: {actual_size} bytes, crc {actual_checksum:#010x})"
    )]
    IndexMismatch {
        expected_size: u64,
        expected_checksum: u64,
        actual_size: u64,
        actual_checksum: u64,
    },

    #[error("range {start}+{length} is outside the uncompressed size {size}")]
    OutOfRange { start: u64, length: u64, size: u64 },

    /// The range accessor failed to deliver `[start, end)`.
    #[error("failed to fetch bytes {start}..{end}: {message}")]
    FetchFailure { start: u64, end: u64, message: String },

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    pub fn malformed<T: std::fmt::Display>(msg: T) -> Self {
        Error::MalformedStream(msg.to_string())
    }

    pub fn corrupt<T: std::fmt::Display>(msg: T) -> Self {
        Error::CorruptIndex(msg.to_string())
    }

    pub fn fetch(start: u64, end: u64, err: anyhow::Error) -> Self {
        Error::FetchFailure {
            start,
            end,
            message: format!("{err:#}"),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FetchFailure { .. } | Error::Aborted(_))
    }

    /// Wrap this error so it can travel through `std::io::Read` boundaries.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let err = match err.downcast::<Error>() {
            Ok(inner) => return inner,
            Err(err) => err,
        };
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Error::TruncatedInput;
        }
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
