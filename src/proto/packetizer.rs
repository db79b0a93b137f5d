use super::{
    active_packetizer::{ActivePacketizer, Credentials, Reply},
    establish,
    watch::WatchType,
    ConnectParams, HandshakeError, Request, Response, Transport, Watch, WatchRegistry,
};
use crate::session::{SessionState, SessionTracker};
use crate::{KeeperState, WatchedEvent, ZkError};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture, Either},
    FutureExt, StreamExt,
};
use pin_project::pin_project;
use slog::{debug, error, info, trace, warn};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

#[pin_project]
pub(crate) struct Packetizer<S>
where
    S: Transport,
{
    /// Ensemble members and retry settings.
    params: Arc<ConnectParams<S::Addr>>,

    /// Current state
    #[pin]
    state: PacketizerState<S>,

    /// Watcher to send watch events to.
    default_watcher: mpsc::UnboundedSender<WatchedEvent>,

    /// Incoming requests
    rx: mpsc::UnboundedReceiver<(Request, Reply)>,

    /// Resolves when the client asks for the session to be closed.
    closer: oneshot::Receiver<()>,

    watches: Arc<WatchRegistry>,
    session: Arc<SessionTracker>,

    /// Next xid to issue
    xid: i32,

    logger: slog::Logger,

    exiting: bool,
}

impl<S> Packetizer<S>
where
    S: Transport,
{
    /// Spawns the connection task for an established session.
    ///
    /// Returns the handle requests are submitted through, and the sender that closes the session.
    pub(crate) fn spawn(
        ap: ActivePacketizer<S>,
        params: Arc<ConnectParams<S::Addr>>,
        session: Arc<SessionTracker>,
        watches: Arc<WatchRegistry>,
        default_watcher: mpsc::UnboundedSender<WatchedEvent>,
        log: slog::Logger,
    ) -> (Enqueuer, oneshot::Sender<()>) {
        let (tx, rx) = mpsc::unbounded();
        let (close_tx, closer) = oneshot::channel();

        session.set_connected(ap.session_id);
        let enqueuer = Enqueuer {
            tx,
            session: session.clone(),
            queue_while_disconnected: params.queue_while_disconnected,
        };

        let exitlogger = log.clone();
        let exitsession = session.clone();
        tokio::spawn(
            Packetizer {
                params,
                state: PacketizerState::Connected(ap),
                xid: 1,
                default_watcher,
                rx,
                closer,
                watches,
                session,
                logger: log,
                exiting: false,
            }
            .map(move |r| {
                if let Err(e) = r {
                    error!(exitlogger, "packetizer exiting: {:?}", e);
                }
                exitsession.set_state(SessionState::Closed);
            }),
        );

        (enqueuer, close_tx)
    }
}

/// Outcome of a reconnect attempt.
enum Reconnect<S> {
    /// The same session continues on a new connection.
    Resumed(ActivePacketizer<S>),
    /// A new session replaces one that was lost.
    Fresh(ActivePacketizer<S>),
    /// The session cannot be resumed.
    Expired,
}

#[pin_project(project = PacketizerStateProj)]
enum PacketizerState<S> {
    Connected(ActivePacketizer<S>),
    Reconnecting(BoxFuture<'static, Reconnect<S>>),
}

/// Resumes `credentials` on any member, giving up after the retry policy is exhausted.
async fn resume<S>(
    params: Arc<ConnectParams<S::Addr>>,
    credentials: Credentials,
    log: slog::Logger,
) -> Reconnect<S>
where
    S: Transport,
{
    for attempt in 0..=params.retry.max_retries {
        if attempt > 0 {
            tokio::time::sleep(params.retry.backoff(attempt - 1)).await;
        }
        match establish::<S>(&params, &credentials, &log).await {
            Ok(ap) => return Reconnect::Resumed(ap),
            Err(HandshakeError::Expired) => return Reconnect::Expired,
            Err(HandshakeError::Unreachable(e)) => {
                info!(log, "reconnect attempt failed";
                      "attempt" => attempt, "session_id" => credentials.session_id, "error" => %e);
            }
        }
    }
    warn!(log, "giving up on session"; "session_id" => credentials.session_id);
    Reconnect::Expired
}

/// Opens a new session, retrying without limit.
async fn fresh<S>(params: Arc<ConnectParams<S::Addr>>, log: slog::Logger) -> Reconnect<S>
where
    S: Transport,
{
    let mut attempt = 0;
    loop {
        match establish::<S>(&params, &Credentials::default(), &log).await {
            Ok(ap) => return Reconnect::Fresh(ap),
            Err(HandshakeError::Expired) => {
                warn!(log, "ensemble refused a new session"; "attempt" => attempt);
            }
            Err(HandshakeError::Unreachable(e)) => {
                info!(log, "new session attempt failed"; "attempt" => attempt, "error" => %e);
            }
        }
        tokio::time::sleep(params.retry.backoff(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// What the poll loop does after driving the current state.
enum Step<S> {
    Done,
    Lost(failure::Error),
    Reconnected(Reconnect<S>),
}

impl<S> Packetizer<S>
where
    S: Transport,
{
    fn poll_enqueue(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), ()>> {
        let mut this = self.project();
        while let PacketizerStateProj::Connected(ap) = this.state.as_mut().project() {
            let (mut item, tx) = match futures::ready!(this.rx.poll_next_unpin(cx)) {
                Some((request, response)) => (request, response),
                None => return Poll::Ready(Err(())),
            };

            if tx.is_canceled() {
                trace!(this.logger, "skipping abandoned request {:?}", item);
                continue;
            }
            debug!(this.logger, "enqueueing request {:?}", item; "xid" => *this.xid);

            match item {
                Request::GetData {
                    ref path,
                    ref mut watch,
                    ..
                }
                | Request::GetChildren {
                    ref path,
                    ref mut watch,
                    ..
                }
                | Request::Exists {
                    ref path,
                    ref mut watch,
                    ..
                } => {
                    if let Watch::Custom(_) = *watch {
                        // set to Global so that watch will be sent as 1u8
                        let w = mem::replace(watch, Watch::Global);
                        if let Watch::Custom(w) = w {
                            let wtype = match item {
                                Request::GetData { .. } => WatchType::Data,
                                Request::GetChildren { .. } => WatchType::Child,
                                _ => WatchType::Exist,
                            };
                            trace!(
                                this.logger,
                                "adding pending watcher";
                                "xid" => *this.xid,
                                "path" => path,
                                "wtype" => ?wtype
                            );
                            ap.pending_watchers()
                                .insert(*this.xid, (path.to_string(), w, wtype));
                        }
                    }
                }
                _ => {}
            }

            ap.enqueue(*this.xid, item, tx);
            *this.xid = if *this.xid == i32::MAX { 1 } else { *this.xid + 1 };
        }
        Poll::Pending
    }

}

fn notify(default_watcher: &mpsc::UnboundedSender<WatchedEvent>, state: KeeperState) {
    // NOTE: ignoring error, because the user may not care about events
    let _ = default_watcher.unbounded_send(WatchedEvent::session(state));
}

impl<S> Future for Packetizer<S>
where
    S: Transport,
{
    type Output = Result<(), failure::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        loop {
            trace!(self.logger, "packetizer polled");
            if !self.exiting {
                let closing = self.as_mut().project().closer.poll_unpin(cx).is_ready();
                // no more requests will be enqueued once every handle is gone
                if closing || self.as_mut().poll_enqueue(cx) == Poll::Ready(Err(())) {
                    *self.as_mut().project().exiting = true;
                }

                if self.exiting {
                    let this = self.as_mut().project();
                    match this.state.project() {
                        PacketizerStateProj::Connected(ap) => {
                            info!(this.logger, "closing session"; "session_id" => ap.session_id);
                            ap.enqueue_close();
                        }
                        PacketizerStateProj::Reconnecting(_) => {
                            debug!(this.logger, "closed while reconnecting");
                            this.session.set_state(SessionState::Closed);
                            this.watches.clear();
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
            }

            let step = {
                let mut this = self.as_mut().project();
                match this.state.as_mut().project() {
                    PacketizerStateProj::Connected(ap) => {
                        match ap.poll(
                            cx,
                            *this.exiting,
                            this.logger,
                            this.default_watcher,
                            this.watches,
                        ) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Ok(())) => Step::Done,
                            Poll::Ready(Err(e)) if *this.exiting => {
                                debug!(this.logger, "connection lost during exit"; "error" => %e);
                                Step::Done
                            }
                            Poll::Ready(Err(e)) => Step::Lost(e),
                        }
                    }
                    PacketizerStateProj::Reconnecting(c) => match c.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(r) => Step::Reconnected(r),
                    },
                }
            };

            match step {
                Step::Done => {
                    let this = self.as_mut().project();
                    this.session.set_state(SessionState::Closed);
                    let dropped = this.watches.clear();
                    debug!(this.logger, "session closed"; "dropped_watches" => dropped);
                    return Poll::Ready(Ok(()));
                }
                Step::Lost(e) => {
                    // dropping the old state will also fail in-flight requests
                    let credentials = match self.as_mut().project().state.project() {
                        PacketizerStateProj::Connected(ap) => ap.credentials(),
                        PacketizerStateProj::Reconnecting(_) => Credentials::default(),
                    };
                    let mut this = self.as_mut().project();
                    info!(this.logger, "connection lost; reconnecting";
                          "session_id" => credentials.session_id,
                          "last_zxid" => credentials.last_zxid_seen,
                          "error" => %e
                    );
                    this.session.set_state(SessionState::Suspended);
                    let retry = resume::<S>(this.params.clone(), credentials, this.logger.clone());
                    this.state
                        .set(PacketizerState::Reconnecting(Box::pin(retry)));
                    notify(self.as_mut().project().default_watcher, KeeperState::Disconnected);
                }
                Step::Reconnected(Reconnect::Resumed(mut ap)) => {
                    let mut this = self.as_mut().project();
                    let armed = this.watches.armed();
                    if !armed.is_empty() {
                        debug!(this.logger, "re-arming watches";
                               "data" => armed.data.len(),
                               "exist" => armed.exist.len(),
                               "child" => armed.child.len());
                        ap.enqueue_set_watches(armed);
                    }
                    let epoch = this.session.set_connected(ap.session_id);
                    info!(this.logger, "session resumed";
                          "session_id" => ap.session_id, "epoch" => epoch);
                    this.state.set(PacketizerState::Connected(ap));
                    notify(self.as_mut().project().default_watcher, KeeperState::SyncConnected);
                }
                Step::Reconnected(Reconnect::Fresh(ap)) => {
                    let mut this = self.as_mut().project();
                    let epoch = this.session.set_connected(ap.session_id);
                    info!(this.logger, "new session established";
                          "session_id" => ap.session_id, "epoch" => epoch);
                    this.state.set(PacketizerState::Connected(ap));
                    notify(self.as_mut().project().default_watcher, KeeperState::SyncConnected);
                }
                Step::Reconnected(Reconnect::Expired) => {
                    let mut this = self.as_mut().project();
                    this.session.set_state(SessionState::Lost);
                    let dropped = this.watches.clear();
                    // requests queued for the expired session must not run on the next one
                    let mut failed = 0;
                    while let Ok(Some((_, tx))) = this.rx.try_next() {
                        let _ = tx.send(Err(ZkError::SessionExpired));
                        failed += 1;
                    }
                    warn!(this.logger, "session lost";
                          "dropped_watches" => dropped, "failed_requests" => failed);
                    let retry = fresh::<S>(this.params.clone(), this.logger.clone());
                    this.state
                        .set(PacketizerState::Reconnecting(Box::pin(retry)));
                    notify(self.as_mut().project().default_watcher, KeeperState::Expired);
                }
            }
        }
    }
}

/// Submits requests to the connection task.
#[derive(Clone, Debug)]
pub(crate) struct Enqueuer {
    tx: mpsc::UnboundedSender<(Request, Reply)>,
    session: Arc<SessionTracker>,
    queue_while_disconnected: bool,
}

impl Enqueuer {
    /// Queues `request` right away and returns a future for its response.
    ///
    /// Requests are written in the order they were queued. A request that can not be delivered
    /// (the client is not connected and may not queue, or the connection went away before the
    /// response arrived) resolves to `ConnectionLoss`.
    pub(crate) fn enqueue(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, ZkError>> + Send + 'static {
        let admit = match self.session.state() {
            SessionState::Connected => true,
            SessionState::Closed => false,
            _ => self.queue_while_disconnected,
        };
        let (tx, rx) = oneshot::channel();
        if admit && self.tx.unbounded_send((request, tx)).is_ok() {
            Either::Left(rx.map(|r| r.unwrap_or(Err(ZkError::ConnectionLoss))))
        } else {
            Either::Right(future::ready(Err(ZkError::ConnectionLoss)))
        }
    }
}
