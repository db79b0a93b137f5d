use super::{fail, Persistence};
use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::Request;
use crate::{paths, transform, Curator, ANY_VERSION};
use futures::future::{BoxFuture, FutureExt};

/// Deletes a node.
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct DeleteBuilder {
    client: Curator,
    version: i32,
    children: bool,
    guaranteed: bool,
}

impl DeleteBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        DeleteBuilder {
            client,
            version: ANY_VERSION,
            children: false,
            guaranteed: false,
        }
    }

    /// Only delete if the node is at `version`. Fails with `BadVersion` otherwise.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Deletes the node's descendants first instead of failing with `NotEmpty`.
    pub fn deleting_children_if_needed(mut self) -> Self {
        self.children = true;
        self
    }

    /// Keeps retrying across connection and session loss until the node is confirmed gone.
    ///
    /// Only an answer from the ensemble (or closing the client) ends a guaranteed delete.
    pub fn guaranteed(mut self) -> Self {
        self.guaranteed = true;
        self
    }

    /// Deletes the node at `path`.
    pub async fn for_path(self, path: &str) -> Result<(), Error> {
        self.dispatch(path).await
    }

    /// Queues the delete and returns a handle to its result.
    pub fn in_background(self, path: &str) -> Background<()> {
        executor::background(Operation::Delete, path, self.dispatch(path))
    }

    /// Queues the delete and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(self, path: &str, callback: F) -> Background<()>
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path);
        executor::with_callback(&pool, Operation::Delete, path, fut, callback)
    }

    fn dispatch(self, path: &str) -> BoxFuture<'static, Result<(), Error>> {
        let DeleteBuilder {
            client,
            version,
            children,
            guaranteed,
        } = self;
        let persistence = if guaranteed {
            if let Err(kind) = paths::validate(path) {
                return fail(Error::new(Operation::Delete, path, kind));
            }
            Persistence::Guaranteed
        } else {
            if let Err(e) = client.precheck(Operation::Delete, path) {
                return fail(e);
            }
            Persistence::Policy
        };
        if path == "/" {
            return fail(Error::new(
                Operation::Delete,
                path,
                ErrorKind::BadArguments("the root node cannot be deleted".to_string()),
            ));
        }

        let target = path.to_string();
        let attempt = move |client: &Curator, n: u32| {
            let path = target.clone();
            let response = client.request(Request::Delete {
                path: path.clone(),
                version,
            });
            let client = client.clone();
            async move {
                match transform::delete(version, response.await) {
                    // an earlier attempt went through before its reply was lost
                    Err(ErrorKind::NoNode) if guaranteed && n > 0 => Ok(()),
                    Err(ErrorKind::NotEmpty) if children => {
                        client.delete_children(&path).await?;
                        let response = client.request(Request::Delete {
                            path: path.clone(),
                            version,
                        });
                        transform::delete(version, response.await)
                    }
                    r => r,
                }
            }
            .boxed()
        };
        client.retrying(Operation::Delete, path, persistence, Box::new(attempt))
    }
}
