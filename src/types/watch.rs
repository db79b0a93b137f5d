use futures::channel::oneshot;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A notification delivered to a watcher or to the default watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: WatchedEventType,
    /// Connection state when the event was generated.
    pub keeper_state: KeeperState,
    /// Empty for session events.
    pub path: String,
}

impl WatchedEvent {
    /// An event describing a change of the session rather than of a znode.
    pub(crate) fn session(keeper_state: KeeperState) -> Self {
        WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state,
            path: String::new(),
        }
    }
}

/// Session state carried by a [`WatchedEvent`].
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeeperState {
    /// The connection dropped; the client is reconnecting.
    Disconnected = 0,
    /// Connected to a member, on a new or resumed session.
    SyncConnected = 3,
    AuthFailed = 4,
    ConnectedReadOnly = 5,
    SaslAuthenticated = 6,
    /// The ensemble expired the session, dropping its ephemeral nodes and watches.
    Expired = -112,
}

impl TryFrom<i32> for KeeperState {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        match code {
            0 => Ok(KeeperState::Disconnected),
            3 => Ok(KeeperState::SyncConnected),
            4 => Ok(KeeperState::AuthFailed),
            5 => Ok(KeeperState::ConnectedReadOnly),
            6 => Ok(KeeperState::SaslAuthenticated),
            -112 => Ok(KeeperState::Expired),
            _ => Err(code),
        }
    }
}

/// What happened to a watched node.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchedEventType {
    /// Session events carry no node change.
    None = -1,
    NodeCreated = 1,
    NodeDeleted = 2,
    /// A write to the node's data; the bytes may be unchanged.
    NodeDataChanged = 3,
    /// A child was added or removed. Changes to a child's data do not count.
    NodeChildrenChanged = 4,
}

impl TryFrom<i32> for WatchedEventType {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        match code {
            -1 => Ok(WatchedEventType::None),
            1 => Ok(WatchedEventType::NodeCreated),
            2 => Ok(WatchedEventType::NodeDeleted),
            3 => Ok(WatchedEventType::NodeDataChanged),
            4 => Ok(WatchedEventType::NodeChildrenChanged),
            _ => Err(code),
        }
    }
}

/// A one-shot watch set by a watched read.
///
/// Resolves to the first matching event on the watched path. Resolves to `None` if the
/// registration was dropped before it fired: the session was lost or the client was closed. To
/// keep observing a path, issue another watched read after the watch fires.
#[derive(Debug)]
#[must_use = "watchers do nothing unless polled"]
pub struct Watcher(oneshot::Receiver<WatchedEvent>);

impl Watcher {
    pub(crate) fn new(rx: oneshot::Receiver<WatchedEvent>) -> Self {
        Watcher(rx)
    }
}

impl Future for Watcher {
    type Output = Option<WatchedEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(Result::ok)
    }
}
