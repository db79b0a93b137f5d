use std::time::Duration;
use tokio::sync::watch;

/// Where a client's session with the ensemble currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session has been established yet.
    Connecting,
    /// The session is established and requests flow.
    Connected,
    /// The connection dropped. The session may still be alive on the ensemble and is being
    /// resumed.
    Suspended,
    /// The session is gone: the ensemble expired it or it could not be resumed in time. Ephemeral
    /// nodes and watches that belonged to it are gone as well. A new session is being established.
    Lost,
    /// The client was closed. This state is terminal.
    Closed,
}

impl SessionState {
    /// Whether requests can currently be written to the ensemble.
    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

/// A consistent view of the session at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// The state of the session.
    pub state: SessionState,
    /// The ensemble-assigned id of the current (or last) session. Zero before the first connect.
    pub session_id: i64,
    /// Incremented on every successful connect or reconnect.
    ///
    /// Two snapshots with the same epoch were taken on the same connection, so an observer that
    /// sees a new epoch knows it may have missed events in between.
    pub epoch: u64,
}

/// The single source of truth for session state, shared by the connection task and every client
/// handle.
#[derive(Debug)]
pub(crate) struct SessionTracker {
    tx: watch::Sender<SessionSnapshot>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        let (tx, _) = watch::channel(SessionSnapshot {
            state: SessionState::Connecting,
            session_id: 0,
            epoch: 0,
        });
        SessionTracker { tx }
    }
}

impl SessionTracker {
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        *self.tx.borrow()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.tx.borrow().state
    }

    /// Records a successful (re)connect and returns the new epoch.
    pub(crate) fn set_connected(&self, session_id: i64) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|s| {
            if s.state != SessionState::Closed {
                s.state = SessionState::Connected;
                s.session_id = session_id;
                s.epoch += 1;
            }
            epoch = s.epoch;
        });
        epoch
    }

    /// Moves to `state`, unless the session is already closed.
    pub(crate) fn set_state(&self, state: SessionState) {
        self.tx.send_if_modified(|s| {
            if s.state == SessionState::Closed || s.state == state {
                return false;
            }
            s.state = state;
            true
        });
    }

    pub(crate) fn listen(&self) -> SessionListener {
        SessionListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Waits until the session is `Connected`.
    ///
    /// Gives up with the last observed state once `timeout` elapsed or the client closed.
    pub(crate) async fn wait_connected(
        &self,
        timeout: Duration,
    ) -> Result<SessionSnapshot, SessionState> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                let snapshot = *rx.borrow_and_update();
                match snapshot.state {
                    SessionState::Connected => return Ok(snapshot),
                    SessionState::Closed => return Err(SessionState::Closed),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SessionState::Closed);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(r) => r,
            Err(_) => Err(self.state()),
        }
    }
}

/// Observes session transitions of a client.
///
/// Intermediate states may be coalesced when several transitions happen before the listener looks;
/// compare `epoch`s to detect a reconnect that happened in between.
#[derive(Debug, Clone)]
pub struct SessionListener {
    rx: watch::Receiver<SessionSnapshot>,
}

impl SessionListener {
    /// The most recent snapshot.
    pub fn current(&self) -> SessionSnapshot {
        *self.rx.borrow()
    }

    /// Waits for the next change and returns the snapshot after it.
    ///
    /// Returns `None` once the client and its connection task are gone.
    pub async fn changed(&mut self) -> Option<SessionSnapshot> {
        self.rx.changed().await.ok()?;
        let snapshot = *self.rx.borrow_and_update();
        Some(snapshot)
    }
}
