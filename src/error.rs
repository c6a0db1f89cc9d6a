use std::fmt::Display;

/// Directory store errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid on-disk data: truncated reads, checksum mismatches, bad
    /// footer magic, or handle decoding failures.
    Corruption(String),
    /// Invalid user input, typically an empty key.
    InvalidArgument(String),
    /// An IO error.
    Io(String),
    /// Both write buffers are in use and the caller asked not to block.
    BufferFull,
    /// The encoder reached the epoch cap for one directory.
    TooManyEpochs,
    /// The encoder reached the per-epoch table cap.
    TooManyTables,
    /// A write was attempted on a finished or closed structure.
    ReadOnly,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::BufferFull => write!(f, "write buffers full"),
            Error::TooManyEpochs => write!(f, "too many epochs"),
            Error::TooManyTables => write!(f, "too many tables in epoch"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A directory store Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
