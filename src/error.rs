use crate::ZkError;
use failure::Fail;
use std::fmt;

/// The client operation an [`Error`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Establishing a session.
    Connect,
    /// A `create` request.
    Create,
    /// A `get_data` request.
    GetData,
    /// A `set_data` request.
    SetData,
    /// A `delete` request.
    Delete,
    /// An `exists` request.
    Exists,
    /// A `get_children` request.
    GetChildren,
    /// A `check` inside a transaction.
    Check,
    /// Committing a transaction.
    Transaction,
    /// Closing the session.
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Operation::Connect => "connect",
            Operation::Create => "create",
            Operation::GetData => "get_data",
            Operation::SetData => "set_data",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
            Operation::GetChildren => "get_children",
            Operation::Check => "check",
            Operation::Transaction => "transaction",
            Operation::Close => "close",
        };
        f.write_str(name)
    }
}

/// Why an operation failed.
#[derive(Clone, PartialEq, Eq, Debug, Fail)]
pub enum ErrorKind {
    /// The connection to the ensemble was lost before the operation completed, or the client was
    /// not connected when the operation was issued. The operation may or may not have been
    /// applied.
    #[fail(display = "connection to the ensemble was lost")]
    ConnectionLoss,

    /// The session expired. Ephemeral nodes and watches that belonged to it are gone.
    #[fail(display = "session expired")]
    SessionExpired,

    /// A node with the given path already exists.
    #[fail(display = "target node already exists")]
    NodeExists,

    /// No node exists with the given path (or, for `create`, its parent does not exist).
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than the one the call expected.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },

    /// The target node has child nodes, and therefore cannot be deleted.
    #[fail(display = "target node has children, and cannot be deleted")]
    NotEmpty,

    /// The parent node of the given path is ephemeral, and cannot have children.
    #[fail(display = "parent node is ephemeral, and cannot have children")]
    NoChildrenForEphemerals,

    /// An operation inside a transaction failed, so none of them took effect.
    #[fail(
        display = "operation {} of the transaction failed: {}",
        failed_index, cause
    )]
    Transaction {
        /// Position of the failed operation in the transaction.
        failed_index: usize,
        /// The failure of that operation.
        cause: Box<Error>,
    },

    /// The call was rejected before anything was sent.
    #[fail(display = "bad arguments: {}", _0)]
    BadArguments(String),

    /// The operation did not complete within the configured operation timeout.
    #[fail(display = "operation timed out")]
    Timeout,

    /// The background operation was cancelled.
    #[fail(display = "operation was cancelled")]
    Cancelled,

    /// The client was closed.
    #[fail(display = "client is closed")]
    Closed,

    /// The ensemble answered with an error this client does not map to a more specific kind.
    #[fail(display = "ensemble reported {}", _0)]
    Unexpected(ZkError),

    /// The ensemble answered with something that does not fit the request.
    #[fail(display = "protocol violation: {}", _0)]
    Protocol(String),
}

impl ErrorKind {
    /// Whether the failure says something about the ensemble's data rather than the connection.
    ///
    /// Such failures are never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ErrorKind::NodeExists
                | ErrorKind::NoNode
                | ErrorKind::BadVersion { .. }
                | ErrorKind::NotEmpty
                | ErrorKind::NoChildrenForEphemerals
                | ErrorKind::Transaction { .. }
        )
    }
}

/// A failed operation: what was attempted, on which path, and why it failed.
#[derive(Clone, PartialEq, Eq, Debug, Fail)]
pub struct Error {
    op: Operation,
    path: String,
    kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(op: Operation, path: impl Into<String>, kind: ErrorKind) -> Self {
        Error {
            op,
            path: path.into(),
            kind,
        }
    }

    /// Why the operation failed.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Consumes the error, returning why the operation failed.
    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// The path the operation targeted. Empty for operations without a single path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The operation that failed.
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Whether trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::ConnectionLoss
    }

    /// See [`ErrorKind::is_precondition`].
    pub fn is_precondition(&self) -> bool {
        self.kind.is_precondition()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} failed: {}", self.op, self.kind)
        } else {
            write!(f, "{} {} failed: {}", self.op, self.path, self.kind)
        }
    }
}
