use super::{fail, Persistence};
use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::{Request, Watch};
use crate::{transform, Curator, Watcher};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};

/// Lists the names of a node's children.
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct GetChildrenBuilder {
    client: Curator,
}

impl GetChildrenBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        GetChildrenBuilder { client }
    }

    /// Returns the names (not full paths) of the children of `path`, in no particular order.
    pub async fn for_path(self, path: &str) -> Result<Vec<String>, Error> {
        self.dispatch(path).await
    }

    /// Like [`for_path`](GetChildrenBuilder::for_path), but also leaves a child watch on `path`.
    ///
    /// The watch fires when a child is added or removed, or when the node itself is deleted.
    pub async fn for_path_watched(self, path: &str) -> Result<(Vec<String>, Watcher), Error> {
        let GetChildrenBuilder { client } = self;
        client.precheck(Operation::GetChildren, path)?;
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let (tx, rx) = oneshot::channel();
            let response = client.request(Request::GetChildren {
                path: target.clone(),
                watch: Watch::Custom(tx),
            });
            async move {
                let children = transform::get_children(response.await)?;
                Ok::<_, ErrorKind>((children, Watcher::new(rx)))
            }
            .boxed()
        };
        client
            .retrying(
                Operation::GetChildren,
                path,
                Persistence::Policy,
                Box::new(attempt),
            )
            .await
    }

    /// Queues the listing and returns a handle to its result.
    pub fn in_background(self, path: &str) -> Background<Vec<String>> {
        executor::background(Operation::GetChildren, path, self.dispatch(path))
    }

    /// Queues the listing and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(self, path: &str, callback: F) -> Background<()>
    where
        F: FnOnce(Result<Vec<String>, Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path);
        executor::with_callback(&pool, Operation::GetChildren, path, fut, callback)
    }

    fn dispatch(self, path: &str) -> BoxFuture<'static, Result<Vec<String>, Error>> {
        let GetChildrenBuilder { client } = self;
        if let Err(e) = client.precheck(Operation::GetChildren, path) {
            return fail(e);
        }
        let target = path.to_string();
        let attempt = move |client: &Curator, _: u32| {
            let response = client.request(Request::GetChildren {
                path: target.clone(),
                watch: Watch::None,
            });
            async move { transform::get_children(response.await) }.boxed()
        };
        client.retrying(
            Operation::GetChildren,
            path,
            Persistence::Policy,
            Box::new(attempt),
        )
    }
}
