use super::Stat;

/// The result of one operation in a committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    /// The response to a `create` operation: the path of the node that was created.
    Create(String),
    /// The response to a `set_data` operation: the node's new `Stat`.
    SetData(Stat),
    /// The response to a `delete` operation.
    Delete,
    /// The response to a `check` operation.
    Check,
}
