use super::{fail, Persistence};
use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::{Request, Watch};
use crate::{transform, Curator, Stat, Watcher};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};

/// Reads a node's data together with its `Stat`.
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct GetDataBuilder {
    client: Curator,
}

impl GetDataBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        GetDataBuilder { client }
    }

    /// Reads the node at `path`.
    pub async fn for_path(self, path: &str) -> Result<(Vec<u8>, Stat), Error> {
        self.dispatch(path).await
    }

    /// Reads the node at `path` and leaves a data watch on it.
    ///
    /// The watch fires when the node's data changes or the node is deleted.
    pub async fn for_path_watched(self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), Error> {
        let GetDataBuilder { client } = self;
        client.precheck(Operation::GetData, path)?;
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let (tx, rx) = oneshot::channel();
            let response = client.request(Request::GetData {
                path: target.clone(),
                watch: Watch::Custom(tx),
            });
            async move {
                let (data, stat) = transform::get_data(response.await)?;
                Ok::<_, ErrorKind>((data, stat, Watcher::new(rx)))
            }
            .boxed()
        };
        client
            .retrying(
                Operation::GetData,
                path,
                Persistence::Policy,
                Box::new(attempt),
            )
            .await
    }

    /// Queues the read and returns a handle to its result.
    pub fn in_background(self, path: &str) -> Background<(Vec<u8>, Stat)> {
        executor::background(Operation::GetData, path, self.dispatch(path))
    }

    /// Queues the read and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(self, path: &str, callback: F) -> Background<()>
    where
        F: FnOnce(Result<(Vec<u8>, Stat), Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path);
        executor::with_callback(&pool, Operation::GetData, path, fut, callback)
    }

    fn dispatch(self, path: &str) -> BoxFuture<'static, Result<(Vec<u8>, Stat), Error>> {
        let GetDataBuilder { client } = self;
        if let Err(e) = client.precheck(Operation::GetData, path) {
            return fail(e);
        }
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let response = client.request(Request::GetData {
                path: target.clone(),
                watch: Watch::None,
            });
            async move { transform::get_data(response.await) }.boxed()
        };
        client.retrying(
            Operation::GetData,
            path,
            Persistence::Policy,
            Box::new(attempt),
        )
    }
}
