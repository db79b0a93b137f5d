use super::{fail, Persistence};
use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::{Request, Watch};
use crate::{transform, Curator, Stat, Watcher};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};

/// Checks whether a node exists. A missing node is not an error.
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct ExistsBuilder {
    client: Curator,
}

impl ExistsBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        ExistsBuilder { client }
    }

    /// Returns the `Stat` of the node at `path`, or `None` if there is no such node.
    pub async fn for_path(self, path: &str) -> Result<Option<Stat>, Error> {
        self.dispatch(path).await
    }

    /// Like [`for_path`](ExistsBuilder::for_path), but also leaves a watch on `path`.
    ///
    /// If the node exists, the watch fires when its data changes or it is deleted. If it does
    /// not, the watch fires when it is created.
    pub async fn for_path_watched(self, path: &str) -> Result<(Option<Stat>, Watcher), Error> {
        let ExistsBuilder { client } = self;
        client.precheck(Operation::Exists, path)?;
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let (tx, rx) = oneshot::channel();
            let response = client.request(Request::Exists {
                path: target.clone(),
                watch: Watch::Custom(tx),
            });
            async move {
                let stat = transform::exists(response.await)?;
                Ok::<_, ErrorKind>((stat, Watcher::new(rx)))
            }
            .boxed()
        };
        client
            .retrying(
                Operation::Exists,
                path,
                Persistence::Policy,
                Box::new(attempt),
            )
            .await
    }

    /// Queues the check and returns a handle to its result.
    pub fn in_background(self, path: &str) -> Background<Option<Stat>> {
        executor::background(Operation::Exists, path, self.dispatch(path))
    }

    /// Queues the check and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(self, path: &str, callback: F) -> Background<()>
    where
        F: FnOnce(Result<Option<Stat>, Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path);
        executor::with_callback(&pool, Operation::Exists, path, fut, callback)
    }

    fn dispatch(self, path: &str) -> BoxFuture<'static, Result<Option<Stat>, Error>> {
        let ExistsBuilder { client } = self;
        if let Err(e) = client.precheck(Operation::Exists, path) {
            return fail(e);
        }
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let response = client.request(Request::Exists {
                path: target.clone(),
                watch: Watch::None,
            });
            async move { transform::exists(response.await) }.boxed()
        };
        client.retrying(
            Operation::Exists,
            path,
            Persistence::Policy,
            Box::new(attempt),
        )
    }
}
