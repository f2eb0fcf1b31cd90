use serde_derive::{Deserialize, Serialize};

/// A kythira error. All errors are string-based, to allow them to cross the
/// wire and the storage boundary as plain data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried. This typically happens
    /// when the leader or term changed before an entry committed, or when a
    /// pending request was cancelled.
    Abort,
    /// Invalid data, e.g. a malformed wire message or a corrupt storage value.
    InvalidData(String),
    /// Invalid user input, e.g. a reconfiguration while one is in flight.
    InvalidInput(String),
    /// An IO or storage error. A node that can't write durably must not
    /// acknowledge appends or grant votes, so these are fatal to the node.
    IO(String),
    /// The node is not the leader. The client must retry against the leader.
    NotLeader,
    /// The transport is over capacity and is shedding load. Recoverable once
    /// load subsides.
    Overloaded,
    /// The operation timed out.
    Timeout,
    /// A quorum of the cluster is unreachable.
    Unavailable,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader => write!(f, "not the leader"),
            Error::Overloaded => write!(f, "overloaded"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Unavailable => write!(f, "cluster unavailable"),
        }
    }
}

impl Error {
    /// Returns whether the error is deterministic, i.e. whether applying the
    /// same command on a different node is guaranteed to yield the same error.
    /// State machines must only return deterministic errors to clients;
    /// non-deterministic ones (e.g. IO errors) would diverge the replicas.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Error::InvalidData(_) | Error::InvalidInput(_) => true,
            Error::Abort
            | Error::IO(_)
            | Error::NotLeader
            | Error::Overloaded
            | Error::Timeout
            | Error::Unavailable => false,
        }
    }
}

/// Constructs an Error::InvalidData via format!().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A kythira result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows converting an Error into a Result<T>, to simplify the errdata! and
/// errinput! macros. T is covered by Result, so the orphan rule permits this.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    // A dropped response sender means the request was abandoned, e.g. because
    // leadership was lost while the request was pending.
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Abort
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
