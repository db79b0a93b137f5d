use crate::error::{Error, ErrorKind, Operation};
use futures::{
    channel::{mpsc, oneshot},
    future::BoxFuture,
    FutureExt, SinkExt, StreamExt,
};
use slog::{trace, warn};
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::{watch, Mutex};

/// A flag that, once raised, asks the work it was handed to to stop.
#[derive(Clone, Debug)]
pub struct Cancellation(Arc<watch::Sender<bool>>);

impl Default for Cancellation {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Cancellation(Arc::new(tx))
    }
}

impl Cancellation {
    /// Raises the flag.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // unreachable while `self` holds the sender
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// An operation running in the background.
///
/// Resolves to the operation's result. The request was queued when the handle was created, so
/// requests issued one after another reach the ensemble in that order even if their handles are
/// awaited in a different one.
#[derive(Debug)]
#[must_use = "dropping the handle discards the result, but does not stop the operation"]
pub struct Background<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    cancel: Cancellation,
    op: Operation,
    path: String,
}

impl<T> Background<T> {
    /// Gives up on the operation.
    ///
    /// A request that has not been written to the ensemble yet is never sent. One that has been
    /// written may still take effect; its result is discarded. The handle resolves to
    /// `ErrorKind::Cancelled` unless the result was already in.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Background::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A handle that cancels this operation when raised.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }
}

impl<T> Future for Background<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures::ready!(self.rx.poll_unpin(cx)) {
            Ok(r) => Poll::Ready(r),
            Err(oneshot::Canceled) => Poll::Ready(Err(Error::new(
                self.op,
                self.path.clone(),
                ErrorKind::Cancelled,
            ))),
        }
    }
}

/// Drives `fut` on its own task.
///
/// `fut` must already have queued its first request, which keeps issue order intact.
pub(crate) fn background<T>(
    op: Operation,
    path: &str,
    fut: BoxFuture<'static, Result<T, Error>>,
) -> Background<T>
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let cancel = Cancellation::default();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            // dropping `fut` drops its pending response, so the request is skipped if unsent
            _ = token.cancelled() => {}
            r = fut => {
                let _ = tx.send(r);
            }
        }
    });
    Background {
        rx,
        cancel,
        op,
        path: path.to_string(),
    }
}

/// Like [`background`], but hands the result to `callback` on the client's callback pool.
///
/// The returned handle resolves once the callback has been queued.
pub(crate) fn with_callback<T, F>(
    pool: &CallbackPool,
    op: Operation,
    path: &str,
    fut: BoxFuture<'static, Result<T, Error>>,
    callback: F,
) -> Background<()>
where
    T: Send + 'static,
    F: FnOnce(Result<T, Error>) + Send + 'static,
{
    let pool = pool.clone();
    let target = path.to_string();
    let queued = async move {
        let r = fut.await;
        pool.submit(Box::new(move || callback(r)))
            .await
            .map_err(|kind| Error::new(op, target, kind))
    };
    background(op, path, queued.boxed())
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of worker tasks running completion callbacks off a bounded queue.
#[derive(Clone, Debug)]
pub(crate) struct CallbackPool {
    tx: mpsc::Sender<Job>,
}

impl CallbackPool {
    pub(crate) fn start(workers: usize, queue: usize, log: &slog::Logger) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue);
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let log = log.new(slog::o!("callback_worker" => worker));
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.next().await;
                    let job = match job {
                        Some(job) => job,
                        None => break,
                    };
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!(log, "background callback panicked");
                    }
                }
                trace!(log, "callback worker exiting");
            });
        }
        CallbackPool { tx }
    }

    /// Queues `job`, waiting for room if the queue is full.
    pub(crate) async fn submit(&self, job: Job) -> Result<(), ErrorKind> {
        self.tx
            .clone()
            .send(job)
            .await
            .map_err(|_| ErrorKind::Closed)
    }
}
