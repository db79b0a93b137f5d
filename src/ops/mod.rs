//! Builders for single-node operations, and the retry machinery they share.

use crate::error::{Error, ErrorKind, Operation};
use crate::proto::{Request, Response, Watch, ZkError};
use crate::session::SessionState;
use crate::{paths, transform, CreateMode, Curator, ANY_VERSION};
use futures::future::{self, BoxFuture, FutureExt};
use slog::{debug, trace};
use std::future::Future;

mod children;
mod create;
mod delete;
mod exists;
mod get_data;
mod set_data;

pub use self::children::GetChildrenBuilder;
pub use self::create::CreateBuilder;
pub use self::delete::DeleteBuilder;
pub use self::exists::ExistsBuilder;
pub use self::get_data::GetDataBuilder;
pub use self::set_data::SetDataBuilder;

/// One attempt of an operation. Gets the attempt number, starting at zero.
pub(crate) type Attempt<T> =
    Box<dyn FnMut(&Curator, u32) -> BoxFuture<'static, Result<T, ErrorKind>> + Send>;

/// How persistently an operation is retried after losing its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Persistence {
    /// Retried per the client's retry policy.
    Policy,
    /// Retried until it completes or the client is closed, across session loss too.
    Guaranteed,
}

pub(crate) fn fail<T: Send + 'static>(e: Error) -> BoxFuture<'static, Result<T, Error>> {
    future::ready(Err(e)).boxed()
}

impl Curator {
    /// Sends `request` right away.
    pub(crate) fn request(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, ZkError>> + Send + 'static {
        self.inner.connection.enqueue(request)
    }

    /// Fails fast if operations cannot be issued right now.
    pub(crate) fn admit(&self) -> Result<(), ErrorKind> {
        match self.inner.session.state() {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(ErrorKind::Closed),
            _ if self.inner.queue_while_disconnected => Ok(()),
            _ => Err(ErrorKind::ConnectionLoss),
        }
    }

    /// Validates `path` and checks that the operation may be issued.
    pub(crate) fn precheck(&self, op: Operation, path: &str) -> Result<(), Error> {
        paths::validate(path)
            .and_then(|_| self.admit())
            .map_err(|kind| Error::new(op, path, kind))
    }

    /// Runs `attempt` until it succeeds, fails for a reason other than a lost connection, or
    /// `persistence` says to stop.
    ///
    /// The first attempt is started before this returns, so its request is queued in call order.
    pub(crate) fn retrying<T>(
        &self,
        op: Operation,
        path: &str,
        persistence: Persistence,
        mut attempt: Attempt<T>,
    ) -> BoxFuture<'static, Result<T, Error>>
    where
        T: Send + 'static,
    {
        let client = self.clone();
        let first = attempt(&client, 0);
        let policy = self.inner.retry_policy;
        let connect_timeout = self.inner.connect_timeout;
        let log = self.inner.logger.clone();
        let target = path.to_string();
        let started = self.inner.session.snapshot().session_id;

        let retried = async move {
            let mut first = Some(first);
            let mut n = 0u32;
            loop {
                let r = match first.take() {
                    Some(fut) => fut.await,
                    None => attempt(&client, n).await,
                };
                let retry = match (&r, persistence) {
                    (Err(ErrorKind::ConnectionLoss), Persistence::Policy) => n < policy.max_retries,
                    (Err(ErrorKind::ConnectionLoss), Persistence::Guaranteed)
                    | (Err(ErrorKind::SessionExpired), Persistence::Guaranteed) => true,
                    _ => false,
                };
                if !retry || client.session_state() == SessionState::Closed {
                    return r;
                }

                let backoff = policy.backoff(n);
                debug!(log, "retrying after connection loss";
                       "op" => %op, "path" => &target, "attempt" => n, "backoff" => ?backoff);
                tokio::time::sleep(backoff).await;
                n = n.saturating_add(1);
                if let Err(state) = client.inner.session.wait_connected(connect_timeout).await {
                    trace!(log, "still not connected"; "state" => ?state);
                }
                // only guaranteed operations may carry over into a new session
                if let Persistence::Policy = persistence {
                    let now = client.inner.session.snapshot();
                    if now.state == SessionState::Lost
                        || (started != 0 && now.session_id != started)
                    {
                        debug!(log, "session changed while retrying";
                               "op" => %op, "path" => &target,
                               "from" => started, "to" => now.session_id);
                        return Err(ErrorKind::SessionExpired);
                    }
                }
            }
        };
        self.complete(op, path, retried)
    }

    /// Attaches `op` and `path` to the outcome, and applies the operation timeout.
    pub(crate) fn complete<T, F>(
        &self,
        op: Operation,
        path: &str,
        fut: F,
    ) -> BoxFuture<'static, Result<T, Error>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ErrorKind>> + Send + 'static,
    {
        let client = self.clone();
        let timeout = self.inner.operation_timeout;
        let path = path.to_string();
        async move {
            let r = match timeout {
                Some(t) => tokio::time::timeout(t, fut)
                    .await
                    .unwrap_or(Err(ErrorKind::Timeout)),
                None => fut.await,
            };
            r.map_err(|kind| {
                let kind = match (kind, client.session_state()) {
                    (ErrorKind::ConnectionLoss, SessionState::Closed) => ErrorKind::Closed,
                    (ErrorKind::ConnectionLoss, SessionState::Lost) => ErrorKind::SessionExpired,
                    (kind, _) => kind,
                };
                Error::new(op, path, kind)
            })
        }
        .boxed()
    }

    /// Creates every missing ancestor of `path` as an empty persistent node.
    pub(crate) fn create_parents(&self, path: &str) -> BoxFuture<'static, Result<(), ErrorKind>> {
        let client = self.clone();
        let ancestors: Vec<String> = paths::ancestors(path)
            .into_iter()
            .map(String::from)
            .collect();
        async move {
            for ancestor in ancestors {
                let r = client
                    .request(Request::Create {
                        path: ancestor,
                        data: Vec::new(),
                        mode: CreateMode::Persistent,
                    })
                    .await;
                match transform::create(r) {
                    // someone else got there first
                    Ok(_) | Err(ErrorKind::NodeExists) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Deletes everything below `path`, depth first.
    pub(crate) fn delete_children(&self, path: &str) -> BoxFuture<'static, Result<(), ErrorKind>> {
        let client = self.clone();
        let path = path.to_string();
        async move {
            let children = client.request(Request::GetChildren {
                path: path.clone(),
                watch: Watch::None,
            });
            let children = match transform::get_children(children.await) {
                Ok(children) => children,
                Err(ErrorKind::NoNode) => return Ok(()),
                Err(e) => return Err(e),
            };
            for child in children {
                let child = paths::join(&path, &child);
                client.delete_children(&child).await?;
                let r = client
                    .request(Request::Delete {
                        path: child,
                        version: ANY_VERSION,
                    })
                    .await;
                match transform::delete(ANY_VERSION, r) {
                    Ok(()) | Err(ErrorKind::NoNode) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        .boxed()
    }
}
