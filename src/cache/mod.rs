//! Local copies of parts of the tree that keep themselves up to date.
//!
//! A cache reacts to its own watches firing and to the client reconnecting by fetching the
//! observed state again in full and comparing it with what it had. Every difference is reported
//! as a [`CacheEvent`].

use crate::{SessionState, Stat, Watcher, WatchedEvent};
use futures::channel::mpsc;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

mod children;
mod node;

pub use self::children::ChildrenCache;
pub use self::node::NodeCache;

/// What happened to a cached node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// The node appeared, or was seen for the first time.
    Added,
    /// The node's data or version changed.
    Updated,
    /// The node went away.
    Removed,
}

/// A change observed by a cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub path: String,
    /// The data after the change. For `Removed`, the last data the cache saw.
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// A cached node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildData {
    pub path: String,
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl ChildData {
    /// Compares what a cache reports on, ignoring bookkeeping such as the number of children.
    fn differs_from(&self, other: &ChildData) -> bool {
        self.data != other.data
            || self.stat.version != other.stat.version
            || self.stat.czxid != other.stat.czxid
            || self.stat.mzxid != other.stat.mzxid
    }

    fn event(&self, kind: CacheEventKind) -> CacheEvent {
        CacheEvent {
            kind,
            path: self.path.clone(),
            data: self.data.clone(),
            stat: self.stat,
        }
    }
}

/// Set while the client is not connected or a refresh failed, so the cache may be stale.
#[derive(Debug, Default)]
struct Degraded(AtomicBool);

impl Degraded {
    fn set(&self, degraded: bool) {
        self.0.store(degraded, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a cache task should do about a session transition.
enum Transition {
    /// Nothing to do.
    Ignore,
    /// Connection dropped; the cache may fall behind.
    Suspend,
    /// The session is gone together with every watch the cache had.
    Lose,
    /// Connected on a new epoch; fetch everything again.
    Resync,
    /// The client is closed.
    Stop,
}

fn transition(state: SessionState, epoch: u64, seen: &mut u64) -> Transition {
    match state {
        SessionState::Suspended => Transition::Suspend,
        SessionState::Lost => Transition::Lose,
        SessionState::Closed => Transition::Stop,
        SessionState::Connected if epoch != *seen => {
            *seen = epoch;
            Transition::Resync
        }
        SessionState::Connected | SessionState::Connecting => Transition::Ignore,
    }
}

/// Resolves when `watcher` fires, or never if there is none.
async fn fired(watcher: &mut Option<Watcher>) -> Option<WatchedEvent> {
    match watcher {
        Some(w) => w.await,
        None => future::pending().await,
    }
}

/// Resolves at `deadline`, or never if there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn emit(tx: &mpsc::UnboundedSender<CacheEvent>, event: CacheEvent) {
    // nobody may be listening
    let _ = tx.unbounded_send(event);
}
