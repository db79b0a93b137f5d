use super::{
    emit, fired, transition, until, CacheEvent, CacheEventKind, ChildData, Degraded, Transition,
};
use crate::error::{Error, ErrorKind, Operation};
use crate::{paths, Curator, SessionListener, WatchedEvent, Watcher};
use futures::{
    channel::{mpsc, oneshot},
    future::BoxFuture,
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use parking_lot::RwLock;
use slog::{debug, info, trace, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Shared {
    children: RwLock<BTreeMap<String, ChildData>>,
    degraded: Degraded,
}

type ChildWatch = BoxFuture<'static, (String, Option<WatchedEvent>)>;

/// Keeps a copy of every direct child of a node, with its data.
///
/// The parent does not have to exist. Grandchildren are not followed.
#[derive(Debug)]
pub struct ChildrenCache {
    path: String,
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedReceiver<CacheEvent>>,
    stop: Option<oneshot::Sender<()>>,
}

impl ChildrenCache {
    /// Loads the children of `path` and starts following them.
    ///
    /// Every child present at start is reported as `Added`, in name order.
    pub async fn start(client: &Curator, path: &str) -> Result<ChildrenCache, Error> {
        paths::validate(path).map_err(|kind| Error::new(Operation::GetChildren, path, kind))?;
        let log = client
            .logger()
            .new(slog::o!("cache" => path.to_string()));
        let shared = Arc::new(Shared::default());
        let (tx, events) = mpsc::unbounded();
        let listener = client.session_listener();
        let epoch = listener.current().epoch;

        let mut task = ChildrenTask {
            client: client.clone(),
            path: path.to_string(),
            shared: shared.clone(),
            tx,
            parent: None,
            watches: FuturesUnordered::new(),
            armed: HashSet::new(),
            listener,
            epoch,
            log,
        };
        task.refresh().await?;
        let (stop, stopped) = oneshot::channel();
        tokio::spawn(task.run(stopped));

        Ok(ChildrenCache {
            path: path.to_string(),
            shared,
            events: Some(events),
            stop: Some(stop),
        })
    }

    /// The parent path being cached.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The children as last seen, sorted by path.
    pub fn current(&self) -> Vec<ChildData> {
        self.shared.children.read().values().cloned().collect()
    }

    /// The child named `name`, if the cache has it.
    pub fn child(&self, name: &str) -> Option<ChildData> {
        let path = paths::join(&self.path, name);
        self.shared.children.read().get(&path).cloned()
    }

    /// Whether the cache may be stale because the client is not connected or a refresh failed.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.get()
    }

    /// The stream of changes. Can be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<CacheEvent>> {
        self.events.take()
    }

    /// Stops following the children. The event stream ends.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for ChildrenCache {
    fn drop(&mut self) {
        self.close();
    }
}

struct ChildrenTask {
    client: Curator,
    path: String,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<CacheEvent>,
    /// Child watch on the parent, or an existence watch while the parent is missing.
    parent: Option<Watcher>,
    /// Data watches on the children.
    watches: FuturesUnordered<ChildWatch>,
    /// Children whose data watch is in `watches`.
    armed: HashSet<String>,
    listener: SessionListener,
    epoch: u64,
    log: slog::Logger,
}

impl ChildrenTask {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut retry: Option<Instant> = None;
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = fired(&mut self.parent) => {
                    self.parent = None;
                    match event {
                        Some(e) => trace!(self.log, "parent watch fired"; "event" => ?e.event_type),
                        None if !self.client.session_state().is_connected() => continue,
                        None => {}
                    }
                }
                Some((child, event)) = self.watches.next(), if !self.watches.is_empty() => {
                    self.armed.remove(&child);
                    match event {
                        Some(e) => trace!(self.log, "child watch fired";
                                          "path" => &child, "event" => ?e.event_type),
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
                            // every registration went with the session
                            self.shared.degraded.set(true);
                            self.parent = None;
                            self.watches = FuturesUnordered::new();
                            self.armed.clear();
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
        info!(self.log, "children cache stopped");
    }

    /// Lists the children, arming the parent watch if it is not armed yet.
    async fn list(&mut self) -> Result<Vec<String>, Error> {
        loop {
            if self.parent.is_some() {
                return match self.client.get_children().for_path(&self.path).await {
                    Ok(names) => Ok(names),
                    Err(e) if *e.kind() == ErrorKind::NoNode => Ok(Vec::new()),
                    Err(e) => Err(e),
                };
            }
            match self.client.get_children().for_path_watched(&self.path).await {
                Ok((names, watcher)) => {
                    self.parent = Some(watcher);
                    return Ok(names);
                }
                Err(e) if *e.kind() == ErrorKind::NoNode => {}
                Err(e) => return Err(e),
            }
            let (stat, watcher) = self.client.exists().for_path_watched(&self.path).await?;
            if stat.is_none() {
                // fires once the parent is created
                self.parent = Some(watcher);
                return Ok(Vec::new());
            }
            // created in between; list it again with a child watch
        }
    }

    /// Reads one child, arming its data watch if it is not armed yet.
    async fn read(&mut self, path: String) -> Result<Option<ChildData>, Error> {
        let r = if self.armed.contains(&path) {
            self.client.get_data().for_path(&path).await
        } else {
            match self.client.get_data().for_path_watched(&path).await {
                Ok((data, stat, watcher)) => {
                    self.armed.insert(path.clone());
                    let child = path.clone();
                    self.watches
                        .push(async move { (child, watcher.await) }.boxed());
                    Ok((data, stat))
                }
                Err(e) => Err(e),
            }
        };
        match r {
            Ok((data, stat)) => Ok(Some(ChildData { path, data, stat })),
            // removed since it was listed
            Err(e) if *e.kind() == ErrorKind::NoNode => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        let names = self.list().await?;
        let mut fresh = BTreeMap::new();
        for name in names {
            let path = paths::join(&self.path, &name);
            if let Some(child) = self.read(path.clone()).await? {
                fresh.insert(path, child);
            }
        }
        if self.client.session_state().is_connected() {
            self.shared.degraded.set(false);
        }
        self.apply(fresh);
        Ok(())
    }

    fn apply(&self, fresh: BTreeMap<String, ChildData>) {
        let mut events = Vec::new();
        let mut children = self.shared.children.write();
        for (path, old) in children.iter() {
            match fresh.get(path) {
                None => events.push(old.event(CacheEventKind::Removed)),
                Some(new) if old.differs_from(new) => {
                    events.push(new.event(CacheEventKind::Updated))
                }
                Some(_) => {}
            }
        }
        for (path, new) in &fresh {
            if !children.contains_key(path) {
                events.push(new.event(CacheEventKind::Added));
            }
        }
        *children = fresh;
        drop(children);

        for event in events {
            debug!(self.log, "child changed"; "path" => &event.path, "kind" => ?event.kind);
            emit(&self.tx, event);
        }
    }
}
