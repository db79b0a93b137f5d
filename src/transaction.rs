use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::Request;
use crate::transform::{self, RequestMarker};
use crate::{paths, CreateMode, Curator, TransactionResult};
use futures::future::{self, BoxFuture, FutureExt};

/// Collects operations that are applied atomically: either all of them take effect, or none.
///
/// Operations are applied in the order they were added, and later ones see the effects of
/// earlier ones.
///
/// ```no_run
/// # async fn run(client: tokio_curator::Curator) -> Result<(), tokio_curator::Error> {
/// use tokio_curator::{CreateMode, TransactionResult};
///
/// let results = client
///     .transaction()
///     .create("/config", b"v1".to_vec(), CreateMode::Persistent)
///     .set_data("/config", b"v2".to_vec(), 0)
///     .commit()
///     .await?;
/// assert!(matches!(results[1], TransactionResult::SetData(_)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "transactions do nothing until committed"]
pub struct TransactionBuilder {
    client: Curator,
    ops: Vec<Request>,
    invalid: Option<Error>,
}

impl TransactionBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        TransactionBuilder {
            client,
            ops: Vec::new(),
            invalid: None,
        }
    }

    fn push(mut self, op: Operation, path: &str, request: Request) -> Self {
        if self.invalid.is_none() {
            if let Err(kind) = paths::validate(path) {
                self.invalid = Some(Error::new(op, path, kind));
            }
        }
        self.ops.push(request);
        self
    }

    /// Adds the creation of a node.
    pub fn create(self, path: &str, data: impl Into<Vec<u8>>, mode: CreateMode) -> Self {
        let request = Request::Create {
            path: path.to_string(),
            data: data.into(),
            mode,
        };
        self.push(Operation::Create, path, request)
    }

    /// Adds a data write, conditional on `version` unless it is `ANY_VERSION`.
    pub fn set_data(self, path: &str, data: impl Into<Vec<u8>>, version: i32) -> Self {
        let request = Request::SetData {
            path: path.to_string(),
            data: data.into(),
            version,
        };
        self.push(Operation::SetData, path, request)
    }

    /// Adds the deletion of a node, conditional on `version` unless it is `ANY_VERSION`.
    pub fn delete(self, path: &str, version: i32) -> Self {
        let request = Request::Delete {
            path: path.to_string(),
            version,
        };
        self.push(Operation::Delete, path, request)
    }

    /// Adds an assertion that the node is at `version`, without changing it.
    pub fn check(self, path: &str, version: i32) -> Self {
        let request = Request::Check {
            path: path.to_string(),
            version,
        };
        self.push(Operation::Check, path, request)
    }

    /// Applies the operations and returns one result per operation, in order.
    ///
    /// If any operation fails, nothing is applied and the error is `ErrorKind::Transaction`,
    /// naming the first failed operation and its cause. A transaction is never retried: if the
    /// connection drops before the outcome is known, it fails with `ConnectionLoss`.
    pub async fn commit(self) -> Result<Vec<TransactionResult>, Error> {
        self.dispatch().await
    }

    /// Queues the commit and returns a handle to its result.
    pub fn commit_in_background(self) -> Background<Vec<TransactionResult>> {
        executor::background(Operation::Transaction, "", self.dispatch())
    }

    fn dispatch(self) -> BoxFuture<'static, Result<Vec<TransactionResult>, Error>> {
        let TransactionBuilder {
            client,
            ops,
            invalid,
        } = self;
        if let Some(e) = invalid {
            let kind = ErrorKind::BadArguments(e.to_string());
            return future::ready(Err(Error::new(Operation::Transaction, "", kind))).boxed();
        }
        if ops.is_empty() {
            return future::ready(Ok(Vec::new())).boxed();
        }
        if let Err(kind) = client.admit() {
            return future::ready(Err(Error::new(Operation::Transaction, "", kind))).boxed();
        }

        let markers: Vec<RequestMarker> = ops.iter().filter_map(RequestMarker::of).collect();
        let response = client.request(Request::Multi(ops));
        client.complete(Operation::Transaction, "", async move {
            transform::multi(&markers, response.await)
        })
    }
}
