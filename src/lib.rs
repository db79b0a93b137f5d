//! An asynchronous, Curator-style client for ZooKeeper ensembles.
//!
//! [`Curator`] wraps a single session with the ensemble. Operations are issued through builders
//! (`client.create().mode(..).for_path(..)`), transparently retried after a lost connection
//! according to a [`RetryPolicy`], and reported as [`Error`]s that name the operation and path
//! that failed. On top of the raw operations the crate offers atomic transactions
//! ([`TransactionBuilder`]) and self-updating caches ([`NodeCache`], [`ChildrenCache`]).
//!
//! The session survives short connection drops: the client reconnects on its own, re-arms every
//! watch, and reports its state through [`SessionListener`]. If the ensemble expires the session,
//! the client establishes a new one.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_curator::{CreateMode, Curator};
//!
//! # async fn run() -> Result<(), tokio_curator::Error> {
//! let (client, _default_watcher) = Curator::builder()
//!     .set_session_timeout(Duration::from_secs(15))
//!     .connect("127.0.0.1:2181")
//!     .await?;
//!
//! let path = client
//!     .create()
//!     .mode(CreateMode::Ephemeral)
//!     .creating_parents_if_needed()
//!     .for_path("/services/web/instance", b"10.0.0.7:80".to_vec())
//!     .await?;
//!
//! let (data, stat) = client.get_data().for_path(&path).await?;
//! assert_eq!(stat.version, 0);
//! assert_eq!(data, b"10.0.0.7:80".to_vec());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use futures::{channel::mpsc, Stream};
use parking_lot::Mutex;
use slog::{debug, info};
use std::{fmt, sync::Arc, time::Duration};
use tokio::net::TcpStream;

mod cache;
mod config;
mod error;
mod executor;
#[cfg(test)]
mod mock;
mod ops;
pub mod paths;
mod proto;
mod session;
mod transaction;
mod transform;
mod types;

pub use crate::cache::{CacheEvent, CacheEventKind, ChildData, ChildrenCache, NodeCache};
pub use crate::config::{parse_connect_string, ClientConfig, RetryPolicy};
pub use crate::error::{Error, ErrorKind, Operation};
pub use crate::executor::{Background, Cancellation};
pub use crate::ops::{
    CreateBuilder, DeleteBuilder, ExistsBuilder, GetChildrenBuilder, GetDataBuilder,
    SetDataBuilder,
};
pub use crate::proto::{Transport, ZkError};
pub use crate::session::{SessionListener, SessionSnapshot, SessionState};
pub use crate::transaction::TransactionBuilder;
pub use crate::types::*;

use crate::executor::CallbackPool;
use crate::proto::{ConnectParams, Enqueuer, Packetizer, WatchRegistry};
use crate::session::SessionTracker;

/// A handle to a session with the ensemble.
///
/// Cloning is cheap and every clone shares the session. The session is closed by
/// [`close`](Curator::close), or once every clone (and every cache built from one) is dropped.
#[derive(Clone)]
pub struct Curator {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Enqueuer,
    session: Arc<SessionTracker>,
    closer: Mutex<Option<futures::channel::oneshot::Sender<()>>>,
    retry_policy: RetryPolicy,
    connect_timeout: Duration,
    operation_timeout: Option<Duration>,
    queue_while_disconnected: bool,
    callbacks: CallbackPool,
    logger: slog::Logger,
}

impl fmt::Debug for Curator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Curator")
            .field("session", &self.inner.session.snapshot())
            .finish()
    }
}

impl Curator {
    /// Starts configuring a client.
    pub fn builder() -> CuratorBuilder {
        CuratorBuilder::default()
    }

    /// Connects to the ensemble described by `config` over TCP.
    ///
    /// Also returns the default watcher: a stream of every session event and every watch
    /// notification the client receives.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Curator, impl Stream<Item = WatchedEvent>), Error> {
        let addrs = config.endpoints.clone();
        CuratorBuilder { config }
            .connect_with::<TcpStream>(addrs)
            .await
    }

    /// Creates a node.
    pub fn create(&self) -> CreateBuilder {
        CreateBuilder::new(self.clone())
    }

    /// Reads a node's data.
    pub fn get_data(&self) -> GetDataBuilder {
        GetDataBuilder::new(self.clone())
    }

    /// Replaces a node's data.
    pub fn set_data(&self) -> SetDataBuilder {
        SetDataBuilder::new(self.clone())
    }

    /// Deletes a node.
    pub fn delete(&self) -> DeleteBuilder {
        DeleteBuilder::new(self.clone())
    }

    /// Checks whether a node exists.
    pub fn exists(&self) -> ExistsBuilder {
        ExistsBuilder::new(self.clone())
    }

    /// Lists a node's children.
    pub fn get_children(&self) -> GetChildrenBuilder {
        GetChildrenBuilder::new(self.clone())
    }

    /// Starts an atomic transaction.
    pub fn transaction(&self) -> TransactionBuilder {
        TransactionBuilder::new(self.clone())
    }

    /// The current state of the session.
    pub fn session_state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// The id of the current (or last) session.
    pub fn session_id(&self) -> i64 {
        self.inner.session.snapshot().session_id
    }

    /// Observes session transitions from now on.
    pub fn session_listener(&self) -> SessionListener {
        self.inner.session.listen()
    }

    /// Waits until the session is connected.
    ///
    /// Fails with `Timeout` if that takes longer than `timeout`, and with `Closed` if the client
    /// is closed.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<SessionSnapshot, Error> {
        self.inner
            .session
            .wait_connected(timeout)
            .await
            .map_err(|state| {
                let kind = match state {
                    SessionState::Closed => ErrorKind::Closed,
                    _ => ErrorKind::Timeout,
                };
                Error::new(Operation::Connect, "", kind)
            })
    }

    /// Closes the session.
    ///
    /// The ensemble removes the session's ephemeral nodes. Operations still in flight fail with
    /// `Closed`, and so does everything issued afterwards. Closing twice is harmless.
    pub async fn close(&self) -> Result<(), Error> {
        if let Some(closer) = self.inner.closer.lock().take() {
            info!(self.inner.logger, "closing client"; "session_id" => self.session_id());
            let _ = closer.send(());
        }

        let mut listener = self.session_listener();
        let closed = async {
            while listener.current().state != SessionState::Closed {
                if listener.changed().await.is_none() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.inner.connect_timeout, closed)
            .await
            .is_err()
        {
            debug!(self.inner.logger, "ensemble did not confirm close in time");
            self.inner.session.set_state(SessionState::Closed);
        }
        Ok(())
    }

    pub(crate) fn logger(&self) -> &slog::Logger {
        &self.inner.logger
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy
    }
}

/// Configures and connects a [`Curator`].
#[derive(Clone, Debug, Default)]
pub struct CuratorBuilder {
    config: ClientConfig,
}

impl From<ClientConfig> for CuratorBuilder {
    fn from(config: ClientConfig) -> Self {
        CuratorBuilder { config }
    }
}

impl CuratorBuilder {
    /// Session timeout requested from the ensemble. Defaults to 30 seconds.
    pub fn set_session_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Bound on connecting to a single member. Defaults to 3 seconds.
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) -> &mut Self {
        self.config.retry_policy = policy;
        self
    }

    /// Bound on a whole operation, retries included. Unbounded by default.
    pub fn set_operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.operation_timeout = Some(timeout);
        self
    }

    /// Buffer operations while disconnected instead of failing them right away.
    pub fn set_queue_while_disconnected(&mut self, queue: bool) -> &mut Self {
        self.config.queue_while_disconnected = queue;
        self
    }

    /// Number of workers running background callbacks, and how many callbacks may wait for one.
    pub fn set_callback_workers(&mut self, workers: usize, queue: usize) -> &mut Self {
        self.config.callback_workers = workers;
        self.config.callback_queue = queue;
        self
    }

    /// Set the logger that should be used internally in the client.
    ///
    /// By default, all logging is disabled. See also [the `slog`
    /// documentation](https://docs.rs/slog).
    pub fn set_logger(&mut self, logger: slog::Logger) -> &mut Self {
        self.config.logger = logger;
        self
    }

    /// Connects over TCP to the members in `connect_string`, such as `"zk1:2181,zk2:2181"`.
    pub async fn connect(
        &self,
        connect_string: &str,
    ) -> Result<(Curator, impl Stream<Item = WatchedEvent>), Error> {
        let endpoints = parse_connect_string(connect_string)?;
        self.connect_with::<TcpStream>(endpoints).await
    }

    /// Connects to the members at `addrs` over the transport `S`.
    pub async fn connect_with<S>(
        &self,
        addrs: Vec<S::Addr>,
    ) -> Result<(Curator, impl Stream<Item = WatchedEvent>), Error>
    where
        S: Transport,
    {
        let config = self.config.clone();
        let log = config.logger.clone();
        if addrs.is_empty() {
            let kind = ErrorKind::BadArguments("no ensemble members given".to_string());
            return Err(Error::new(Operation::Connect, "", kind));
        }

        let params = Arc::new(ConnectParams {
            addrs,
            session_timeout: config.session_timeout,
            connect_timeout: config.connect_timeout,
            retry: config.retry_policy,
            queue_while_disconnected: config.queue_while_disconnected,
        });
        let ap = proto::connect::<S>(&params, &log).await.map_err(|e| {
            info!(log, "could not establish a session"; "error" => %e);
            Error::new(Operation::Connect, "", ErrorKind::ConnectionLoss)
        })?;

        let session = Arc::new(SessionTracker::default());
        let watches = Arc::new(WatchRegistry::default());
        let (default_watcher, events) = mpsc::unbounded();
        let (connection, closer) = Packetizer::spawn(
            ap,
            params,
            session.clone(),
            watches,
            default_watcher,
            log.clone(),
        );
        let callbacks = CallbackPool::start(config.callback_workers, config.callback_queue, &log);

        let client = Curator {
            inner: Arc::new(Inner {
                connection,
                session,
                closer: Mutex::new(Some(closer)),
                retry_policy: config.retry_policy,
                connect_timeout: config.connect_timeout,
                operation_timeout: config.operation_timeout,
                queue_while_disconnected: config.queue_while_disconnected,
                callbacks,
                logger: log,
            }),
        };
        Ok((client, events))
    }
}
