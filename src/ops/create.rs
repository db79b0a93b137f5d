use super::{fail, Persistence};
use crate::error::{Error, ErrorKind, Operation};
use crate::executor::{self, Background};
use crate::proto::{Request, Watch};
use crate::{paths, transform, CreateMode, Curator};
use futures::future::{BoxFuture, FutureExt};
use uuid::Uuid;

/// Creates a node.
///
/// ```no_run
/// # async fn run(client: tokio_curator::Curator) -> Result<(), tokio_curator::Error> {
/// use tokio_curator::CreateMode;
///
/// let path = client
///     .create()
///     .mode(CreateMode::EphemeralSequential)
///     .creating_parents_if_needed()
///     .with_protection()
///     .for_path("/locks/lock-", b"")
///     .await?;
/// # let _ = path;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "builders do nothing until a terminal call"]
pub struct CreateBuilder {
    client: Curator,
    mode: CreateMode,
    parents: bool,
    protection: bool,
}

impl CreateBuilder {
    pub(crate) fn new(client: Curator) -> Self {
        CreateBuilder {
            client,
            mode: CreateMode::Persistent,
            parents: false,
            protection: false,
        }
    }

    /// How the node is created. Defaults to `Persistent`.
    pub fn mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Creates missing ancestors as empty persistent nodes instead of failing with `NoNode`.
    pub fn creating_parents_if_needed(mut self) -> Self {
        self.parents = true;
        self
    }

    /// Prefixes the node name with a unique token.
    ///
    /// If the connection drops before the response arrives, the retry looks for a child that
    /// carries the token and returns it instead of creating a second node. Mostly useful for
    /// sequential nodes, whose name is not known up front.
    pub fn with_protection(mut self) -> Self {
        self.protection = true;
        self
    }

    /// Creates the node and returns its actual path.
    pub async fn for_path(self, path: &str, data: impl Into<Vec<u8>>) -> Result<String, Error> {
        self.dispatch(path, data.into()).await
    }

    /// Queues the create and returns a handle to its result.
    pub fn in_background(self, path: &str, data: impl Into<Vec<u8>>) -> Background<String> {
        executor::background(Operation::Create, path, self.dispatch(path, data.into()))
    }

    /// Queues the create and runs `callback` with its result on the callback pool.
    pub fn in_background_with<F>(
        self,
        path: &str,
        data: impl Into<Vec<u8>>,
        callback: F,
    ) -> Background<()>
    where
        F: FnOnce(Result<String, Error>) + Send + 'static,
    {
        let pool = self.client.inner.callbacks.clone();
        let fut = self.dispatch(path, data.into());
        executor::with_callback(&pool, Operation::Create, path, fut, callback)
    }

    fn dispatch(self, path: &str, data: Vec<u8>) -> BoxFuture<'static, Result<String, Error>> {
        let CreateBuilder {
            client,
            mode,
            parents,
            protection,
        } = self;
        if let Err(e) = client.precheck(Operation::Create, path) {
            return fail(e);
        }
        if path == "/" {
            return fail(Error::new(Operation::Create, path, ErrorKind::NodeExists));
        }

        let token = protection.then(|| Uuid::new_v4().to_string());
        let target = match token {
            Some(ref token) => paths::protected_path(path, token),
            None => path.to_string(),
        };

        let attempt = move |client: &Curator, n: u32| {
            let once = CreateOnce {
                path: target.clone(),
                data: data.clone(),
                mode,
                parents,
            };
            match token.clone() {
                // the previous attempt may have created the node before its reply was lost
                Some(token) if n > 0 => recover(client.clone(), token, once),
                _ => once.send(client),
            }
        };
        client.retrying(
            Operation::Create,
            path,
            Persistence::Policy,
            Box::new(attempt),
        )
    }
}

struct CreateOnce {
    path: String,
    data: Vec<u8>,
    mode: CreateMode,
    parents: bool,
}

impl CreateOnce {
    fn request(&self) -> Request {
        Request::Create {
            path: self.path.clone(),
            data: self.data.clone(),
            mode: self.mode,
        }
    }

    fn send(self, client: &Curator) -> BoxFuture<'static, Result<String, ErrorKind>> {
        let response = client.request(self.request());
        let client = client.clone();
        async move {
            match transform::create(response.await) {
                Err(ErrorKind::NoNode) if self.parents => {
                    client.create_parents(&self.path).await?;
                    transform::create(client.request(self.request()).await)
                }
                r => r,
            }
        }
        .boxed()
    }
}

fn recover(
    client: Curator,
    token: String,
    once: CreateOnce,
) -> BoxFuture<'static, Result<String, ErrorKind>> {
    async move {
        let parent = paths::parent(&once.path).to_string();
        let children = client.request(Request::GetChildren {
            path: parent.clone(),
            watch: Watch::None,
        });
        match transform::get_children(children.await) {
            Ok(children) => {
                if let Some(name) = paths::find_protected_child(&children, &token) {
                    return Ok(paths::join(&parent, name));
                }
            }
            Err(ErrorKind::NoNode) => {}
            Err(e) => return Err(e),
        }
        once.send(&client).await
    }
    .boxed()
}
