use crate::{WatchedEvent, WatchedEventType};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) enum Watch {
    None,
    /// A watch is set on the server, but its sender has already been moved into the registry.
    Global,
    Custom(oneshot::Sender<WatchedEvent>),
}

impl Watch {
    pub(crate) fn to_u8(&self) -> u8 {
        if let Watch::None = *self {
            0
        } else {
            1
        }
    }
}

/// Describes what a `Watch` is looking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum WatchType {
    /// Watching for changes to children.
    Child,
    /// Watching for changes to data.
    Data,
    /// Watching for the creation of a node at the given path.
    Exist,
}

impl WatchType {
    fn triggered_by(self, event: WatchedEventType) -> bool {
        match (self, event) {
            (WatchType::Child, WatchedEventType::NodeDeleted)
            | (WatchType::Child, WatchedEventType::NodeChildrenChanged) => true,
            (WatchType::Child, _) => false,
            (WatchType::Data, WatchedEventType::NodeDeleted)
            | (WatchType::Data, WatchedEventType::NodeDataChanged) => true,
            (WatchType::Data, _) => false,
            (WatchType::Exist, WatchedEventType::NodeChildrenChanged)
            | (WatchType::Exist, WatchedEventType::None) => false,
            (WatchType::Exist, _) => true,
        }
    }
}

/// Paths with live watches, grouped the way `SetWatches` expects them.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ArmedWatches {
    pub(crate) data: Vec<String>,
    pub(crate) exist: Vec<String>,
    pub(crate) child: Vec<String>,
}

impl ArmedWatches {
    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }
}

/// One-shot watches that the ensemble has acknowledged, keyed by path.
///
/// Shared between the client handle and the connection task. It lives as long as the session:
/// it survives reconnects (the connection task re-arms it with `SetWatches`) and is emptied when
/// the session is lost or closed, which resolves every outstanding `Watcher` to `None`.
#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    watchers: Mutex<HashMap<String, Vec<(oneshot::Sender<WatchedEvent>, WatchType)>>>,
}

impl WatchRegistry {
    pub(crate) fn add(&self, path: String, tx: oneshot::Sender<WatchedEvent>, wtype: WatchType) {
        self.watchers
            .lock()
            .entry(path)
            .or_insert_with(Vec::new)
            .push((tx, wtype));
    }

    /// Delivers `e` to every watcher on its path that it triggers, and forgets those watchers.
    ///
    /// Returns how many watchers fired.
    pub(crate) fn trigger(&self, e: &WatchedEvent) -> usize {
        let mut watchers = self.watchers.lock();
        let mut fired = 0;
        let mut remove = false;
        if let Some(list) = watchers.get_mut(&e.path) {
            let mut i = list.len();
            while i > 0 {
                i -= 1;
                if list[i].1.triggered_by(e.event_type) {
                    // this watcher is no longer active
                    let (tx, _) = list.swap_remove(i);
                    // NOTE: ignore the case where the receiver has been dropped
                    let _ = tx.send(e.clone());
                    fired += 1;
                }
            }
            remove = list.is_empty();
        }
        if remove {
            watchers.remove(&e.path);
        }
        fired
    }

    /// Paths that still have a watcher someone is waiting on.
    ///
    /// Watchers whose `Watcher` has been dropped are pruned along the way.
    pub(crate) fn armed(&self) -> ArmedWatches {
        let mut watchers = self.watchers.lock();
        let mut armed = ArmedWatches::default();
        watchers.retain(|path, list| {
            list.retain(|(tx, _)| !tx.is_canceled());
            let mut kinds = (false, false, false);
            for (_, wtype) in list.iter() {
                match wtype {
                    WatchType::Data => kinds.0 = true,
                    WatchType::Exist => kinds.1 = true,
                    WatchType::Child => kinds.2 = true,
                }
            }
            if kinds.0 {
                armed.data.push(path.clone());
            }
            if kinds.1 {
                armed.exist.push(path.clone());
            }
            if kinds.2 {
                armed.child.push(path.clone());
            }
            !list.is_empty()
        });
        armed.data.sort();
        armed.exist.sort();
        armed.child.sort();
        armed
    }

    /// Drops every registration. Outstanding watchers resolve to `None`.
    pub(crate) fn clear(&self) -> usize {
        let mut watchers = self.watchers.lock();
        let n = watchers.values().map(Vec::len).sum();
        watchers.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.lock().values().map(Vec::len).sum()
    }
}
