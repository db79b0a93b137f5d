mod multi;
pub use self::multi::*;

mod watch;
pub use self::watch::*;

/// Version value that disables the version check of a write.
///
/// Passing this to `set_data`, `delete` or `check` makes the ensemble apply the operation no
/// matter what the node's current version is.
pub const ANY_VERSION: i32 = -1;

/// Metadata the ensemble keeps for every node.
///
/// `*zxid` fields are transaction ids: every change to the tree gets one, and they are totally
/// ordered. Version counters start at 0 and grow by one per change of the respective part.
/// Timestamps are milliseconds since the epoch and informational only.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Stat {
    /// Transaction that created the node.
    pub czxid: i64,
    /// Transaction that last wrote the node's data.
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    /// Data version, checked by versioned writes.
    pub version: i32,
    /// Child list version.
    pub cversion: i32,
    pub aversion: i32,
    /// Owning session of an ephemeral node, 0 otherwise.
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    /// Transaction that last added or removed a child.
    pub pzxid: i64,
}

/// Lifetime and naming of a created node.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Stays until deleted.
    #[default]
    Persistent = 0,
    /// Removed by the ensemble when the creating session ends.
    Ephemeral = 1,
    /// Persistent, and the ensemble appends a 10-digit zero-padded counter taken from the
    /// parent to the name.
    PersistentSequential = 2,
    /// Ephemeral and sequential.
    EphemeralSequential = 3,
    // bit 0: ephemeral, bit 1: sequential
}

impl CreateMode {
    /// Whether the ensemble appends a sequence number to the node name.
    pub fn is_sequential(self) -> bool {
        (self as i32) & 0b10 != 0
    }

    /// Whether the node disappears with the session that created it.
    pub fn is_ephemeral(self) -> bool {
        (self as i32) & 0b01 != 0
    }
}

impl TryFrom<i32> for CreateMode {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        match code {
            0 => Ok(CreateMode::Persistent),
            1 => Ok(CreateMode::Ephemeral),
            2 => Ok(CreateMode::PersistentSequential),
            3 => Ok(CreateMode::EphemeralSequential),
            _ => Err(code),
        }
    }
}
