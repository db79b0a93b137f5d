use super::{
    emit, fired, transition, until, CacheEvent, CacheEventKind, ChildData, Degraded, Transition,
};
use crate::error::{Error, ErrorKind, Operation};
use crate::{paths, Curator, SessionListener, Watcher};
use futures::channel::{mpsc, oneshot};
use parking_lot::RwLock;
use slog::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Shared {
    current: RwLock<Option<ChildData>>,
    degraded: Degraded,
}

/// Keeps a copy of a single node's data and `Stat`.
///
/// The node does not have to exist: the cache reports `Added` when it appears and `Removed` when
/// it goes away.
#[derive(Debug)]
pub struct NodeCache {
    path: String,
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedReceiver<CacheEvent>>,
    stop: Option<oneshot::Sender<()>>,
}

impl NodeCache {
    /// Loads the node at `path` and starts following it.
    ///
    /// Fails if the initial load fails. If the node exists, an `Added` event for it is the first
    /// event.
    pub async fn start(client: &Curator, path: &str) -> Result<NodeCache, Error> {
        paths::validate(path).map_err(|kind| Error::new(Operation::GetData, path, kind))?;
        let log = client.logger().new(slog::o!("cache" => path.to_string()));
        let shared = Arc::new(Shared::default());
        let (tx, events) = mpsc::unbounded();
        let listener = client.session_listener();
        let epoch = listener.current().epoch;

        let mut task = NodeTask {
            client: client.clone(),
            path: path.to_string(),
            shared: shared.clone(),
            tx,
            watcher: None,
            listener,
            epoch,
            log,
        };
        task.refresh().await?;
        let (stop, stopped) = oneshot::channel();
        tokio::spawn(task.run(stopped));

        Ok(NodeCache {
            path: path.to_string(),
            shared,
            events: Some(events),
            stop: Some(stop),
        })
    }

    /// The path being cached.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The node as last seen, or `None` if it does not exist.
    pub fn current(&self) -> Option<ChildData> {
        self.shared.current.read().clone()
    }

    /// Whether the cache may be stale because the client is not connected or a refresh failed.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.get()
    }

    /// The stream of changes. Can be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<CacheEvent>> {
        self.events.take()
    }

    /// Stops following the node. The event stream ends.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for NodeCache {
    fn drop(&mut self) {
        self.close();
    }
}

struct NodeTask {
    client: Curator,
    path: String,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<CacheEvent>,
    watcher: Option<Watcher>,
    listener: SessionListener,
    epoch: u64,
    log: slog::Logger,
}

impl NodeTask {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut retry: Option<Instant> = None;
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = fired(&mut self.watcher) => {
                    self.watcher = None;
                    match event {
                        Some(e) => trace!(self.log, "watch fired"; "event" => ?e.event_type),
                        // the registration was dropped; wait for the session to come back
                        None if !self.client.session_state().is_connected() => continue,
                        None => {}
                    }
                }
                snapshot = self.listener.changed() => {
                    let snapshot = match snapshot {
                        Some(snapshot) => snapshot,
                        None => break,
                    };
                    match transition(snapshot.state, snapshot.epoch, &mut self.epoch) {
                        Transition::Ignore => continue,
                        Transition::Suspend => {
                            self.shared.degraded.set(true);
                            continue;
                        }
                        Transition::Lose => {
                            self.shared.degraded.set(true);
                            self.watcher = None;
                            continue;
                        }
                        Transition::Resync => {
                            debug!(self.log, "resyncing"; "epoch" => snapshot.epoch);
                        }
                        Transition::Stop => break,
                    }
                }
                _ = until(retry) => {}
            }

            retry = None;
            match self.refresh().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    self.shared.degraded.set(true);
                    let backoff = self.client.retry_policy().backoff(failures);
                    warn!(self.log, "refresh failed"; "error" => %e, "backoff" => ?backoff);
                    failures = failures.saturating_add(1);
                    retry = Some(Instant::now() + backoff);
                }
            }
        }
        info!(self.log, "node cache stopped");
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        let fresh = self.fetch().await?;
        if self.client.session_state().is_connected() {
            self.shared.degraded.set(false);
        }
        self.apply(fresh);
        Ok(())
    }

    /// Reads the node, arming the watch first if it is not armed yet.
    async fn fetch(&mut self) -> Result<Option<ChildData>, Error> {
        if self.watcher.is_none() {
            let (stat, watcher) = self.client.exists().for_path_watched(&self.path).await?;
            self.watcher = Some(watcher);
            if stat.is_none() {
                return Ok(None);
            }
        }
        match self.client.get_data().for_path(&self.path).await {
            Ok((data, stat)) => Ok(Some(ChildData {
                path: self.path.clone(),
                data,
                stat,
            })),
            Err(e) if *e.kind() == ErrorKind::NoNode => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn apply(&self, fresh: Option<ChildData>) {
        let mut current = self.shared.current.write();
        let event = match (current.as_ref(), fresh.as_ref()) {
            (None, Some(new)) => Some(new.event(CacheEventKind::Added)),
            (Some(old), None) => Some(old.event(CacheEventKind::Removed)),
            (Some(old), Some(new)) if old.differs_from(new) => {
                Some(new.event(CacheEventKind::Updated))
            }
            _ => None,
        };
        *current = fresh;
        drop(current);
        if let Some(event) = event {
            debug!(self.log, "node changed"; "kind" => ?event.kind);
            emit(&self.tx, event);
        }
    }
}
