use std::fmt;

/// Error codes carried in the reply header of every ensemble response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum ZkError {
    /// Success. Inside a failed transaction: applied, then rolled back.
    Ok = 0,
    /// Lower bound of the system error range; never sent.
    SystemError = -1,
    /// Inside a failed transaction: skipped because an earlier operation failed.
    RuntimeInconsistency = -2,
    DataInconsistency = -3,
    /// The connection dropped before the reply arrived.
    ConnectionLoss = -4,
    MarshallingError = -5,
    Unimplemented = -6,
    OperationTimeout = -7,
    BadArguments = -8,
    /// Lower bound of the API error range; never sent.
    APIError = -100,
    NoNode = -101,
    NoAuth = -102,
    /// The expected version did not match the node's.
    BadVersion = -103,
    NoChildrenForEphemerals = -108,
    NodeExists = -110,
    NotEmpty = -111,
    /// The ensemble no longer knows the session.
    SessionExpired = -112,
    InvalidCallback = -113,
    InvalidACL = -114,
    AuthFailed = -115,
    SessionMoved = -118,
    /// A write reached a read-only member.
    NotReadOnly = -119,
    EphemeralOnLocalSession = -120,
    NoWatcher = -121,
}

impl From<i32> for ZkError {
    fn from(code: i32) -> Self {
        match code {
            -100 => ZkError::APIError,
            -115 => ZkError::AuthFailed,
            -8 => ZkError::BadArguments,
            -103 => ZkError::BadVersion,
            -4 => ZkError::ConnectionLoss,
            -3 => ZkError::DataInconsistency,
            -120 => ZkError::EphemeralOnLocalSession,
            -114 => ZkError::InvalidACL,
            -113 => ZkError::InvalidCallback,
            -5 => ZkError::MarshallingError,
            -102 => ZkError::NoAuth,
            -108 => ZkError::NoChildrenForEphemerals,
            -110 => ZkError::NodeExists,
            -101 => ZkError::NoNode,
            -111 => ZkError::NotEmpty,
            -119 => ZkError::NotReadOnly,
            -121 => ZkError::NoWatcher,
            -7 => ZkError::OperationTimeout,
            -2 => ZkError::RuntimeInconsistency,
            -112 => ZkError::SessionExpired,
            -118 => ZkError::SessionMoved,
            -1 => ZkError::SystemError,
            -6 => ZkError::Unimplemented,
            0 => ZkError::Ok,
            // codes newer than this client are treated as generic server failures
            _ => ZkError::SystemError,
        }
    }
}

impl fmt::Display for ZkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}
