use super::{fail, Persistence};
use crate::error::{Error, Operation};
use crate::executor::{self, Background};
use crate::proto::Request;
use crate::{transform, Curator, Stat, ANY_VERSION};
use futures::future::{BoxFuture, FutureExt};

/// Replaces a node's data.
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct SetDataBuilder {
    client: Curator,
    version: i32,
}

impl SetDataBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        SetDataBuilder {
            client,
            version: ANY_VERSION,
        }
    }

    /// Only write if the node is at `version`. Fails with `BadVersion` otherwise.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Writes `data` to the node at `path` and returns its new `Stat`.
    pub async fn for_path(self, path: &str, data: impl Into<Vec<u8>>) -> Result<Stat, Error> {
        self.dispatch(path, data.into()).await
    }

    /// Queues the write and returns a handle to its result.
    pub fn in_background(self, path: &str, data: impl Into<Vec<u8>>) -> Background<Stat> {
        executor::background(Operation::SetData, path, self.dispatch(path, data.into()))
    }

    /// Queues the write and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(
        self,
        path: &str,
        data: impl Into<Vec<u8>>,
        callback: F,
    ) -> Background<()>
    where
        F: FnOnce(Result<Stat, Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path, data.into());
        executor::with_callback(&pool, Operation::SetData, path, fut, callback)
    }

    fn dispatch(self, path: &str, data: Vec<u8>) -> BoxFuture<'static, Result<Stat, Error>> {
        let SetDataBuilder { client, version } = self;
        if let Err(e) = client.precheck(Operation::SetData, path) {
            return fail(e);
        }
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let response = client.request(Request::SetData {
                path: target.clone(),
                data: data.clone(),
                version,
            });
            async move { transform::set_data(version, response.await) }.boxed()
        };
        client.retrying(
            Operation::SetData,
            path,
            Persistence::Policy,
            Box::new(attempt),
        )
    }
}
