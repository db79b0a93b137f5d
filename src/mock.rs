//! An in-memory ensemble speaking the wire protocol over `tokio::io::duplex` streams, with knobs
//! for breaking the connection in the ways a real deployment does.

use crate::proto::request::{MultiHeader, OpCode, Request, WriteTo};
use crate::proto::response::{BufferReader, StringReader};
use crate::proto::{Transport, Watch, ZkError};
use crate::{
    paths, CreateMode, Curator, CuratorBuilder, KeeperState, RetryPolicy, Stat, WatchedEventType,
};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::bail;
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use slog::Drain;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::{fmt, io, sync::Arc, time::Duration};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const XID_NOTIFICATION: i32 = -1;

/// A logger that prints to the terminal, for following what a failing test did.
pub(crate) fn test_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(slog::Level::Info).fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Address of one member of a [`MockEnsemble`].
#[derive(Clone)]
pub struct MockAddr {
    name: String,
    ensemble: MockEnsemble,
}

impl fmt::Debug for MockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock://{}", self.name)
    }
}

#[async_trait]
impl Transport for DuplexStream {
    type Addr = MockAddr;
    type ConnectError = failure::Error;

    async fn connect(addr: MockAddr) -> Result<Self, failure::Error> {
        addr.ensemble.accept(&addr.name)
    }
}

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
}

struct Session {
    password: Vec<u8>,
    timeout: i32,
    conn: Option<u64>,
}

struct Conn {
    session_id: i64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

type Fired = Vec<(u64, WatchedEventType, String)>;

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    next_session: i64,
    sessions: HashMap<i64, Session>,
    next_conn: u64,
    conns: HashMap<u64, Conn>,
    unreachable: HashSet<String>,
    drop_reply: Option<OpCode>,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
}

/// Everything a failed multi must leave untouched.
struct Snapshot {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
}

enum Flow {
    Continue,
    Close,
    Severed,
}

/// An ensemble whose members all share one in-memory tree.
#[derive(Clone)]
pub(crate) struct MockEnsemble {
    state: Arc<Mutex<State>>,
}

impl MockEnsemble {
    pub(crate) fn new() -> Self {
        let mut state = State {
            next_session: 0x100,
            ..State::default()
        };
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
            },
        );
        MockEnsemble {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn addr(&self, name: &str) -> MockAddr {
        MockAddr {
            name: name.to_string(),
            ensemble: self.clone(),
        }
    }

    /// The three members clients connect to by default.
    pub(crate) fn addrs(&self) -> Vec<MockAddr> {
        vec![self.addr("zk1"), self.addr("zk2"), self.addr("zk3")]
    }

    /// A builder with timeouts short enough for tests.
    pub(crate) fn builder(log: slog::Logger) -> CuratorBuilder {
        let mut builder = Curator::builder();
        builder
            .set_session_timeout(Duration::from_secs(10))
            .set_connect_timeout(Duration::from_millis(500))
            .set_retry_policy(RetryPolicy::exponential(Duration::from_millis(10), 3))
            .set_logger(log);
        builder
    }

    pub(crate) async fn client(&self, log: slog::Logger) -> Curator {
        let (client, _events) = Self::builder(log)
            .connect_with::<DuplexStream>(self.addrs())
            .await
            .unwrap();
        client
    }

    pub(crate) fn set_reachable(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(name);
        } else {
            state.unreachable.insert(name.to_string());
        }
    }

    /// Drops every open connection without closing the sessions on them.
    pub(crate) fn sever_connections(&self) {
        let mut state = self.state.lock();
        let conns: Vec<u64> = state.conns.keys().copied().collect();
        for conn in conns {
            state.sever(conn);
        }
    }

    /// Applies the next request with `opcode`, then drops the connection instead of replying.
    pub(crate) fn drop_next_reply(&self, opcode: OpCode) {
        self.state.lock().drop_reply = Some(opcode);
    }

    /// Expires every session, as if their clients had been silent for too long.
    pub(crate) fn expire_sessions(&self) {
        let mut state = self.state.lock();
        let mut fired = Fired::new();
        let ids: Vec<i64> = state.sessions.keys().copied().collect();
        for id in ids {
            if let Some(conn) = state.end_session(id, &mut fired) {
                state.sever(conn);
            }
        }
        state.deliver(fired);
    }

    pub(crate) fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Creates `path` with `data`, along with any missing ancestors.
    pub(crate) fn put(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let mut fired = Fired::new();
        for ancestor in paths::ancestors(path) {
            let _ = state.create(0, ancestor, Vec::new(), CreateMode::Persistent, &mut fired);
        }
        state
            .create(0, path, data.to_vec(), CreateMode::Persistent, &mut fired)
            .unwrap();
        state.deliver(fired);
    }

    /// Overwrites the data of `path` as another client would.
    pub(crate) fn set(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let mut fired = Fired::new();
        state
            .set_data(path, data.to_vec(), -1, &mut fired)
            .unwrap();
        state.deliver(fired);
    }

    /// Deletes `path` as another client would.
    pub(crate) fn remove(&self, path: &str) {
        let mut state = self.state.lock();
        let mut fired = Fired::new();
        state.delete(path, -1, &mut fired).unwrap();
        state.deliver(fired);
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub(crate) fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    pub(crate) fn stat(&self, path: &str) -> Option<Stat> {
        self.state.lock().stat_of(path)
    }

    /// Names of the children of `path`, sorted.
    pub(crate) fn children(&self, path: &str) -> Vec<String> {
        self.state.lock().children_of(path)
    }

    fn accept(&self, name: &str) -> Result<DuplexStream, failure::Error> {
        let mut state = self.state.lock();
        if state.unreachable.contains(name) {
            bail!("connection to {} refused", name);
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(server);
        let (tx, rx) = mpsc::unbounded();
        let id = state.next_conn;
        state.next_conn += 1;
        let writer = tokio::spawn(write_frames(write, rx));
        let reader = tokio::spawn(self.clone().serve(id, read));
        state.conns.insert(
            id,
            Conn {
                session_id: 0,
                tx,
                tasks: vec![reader, writer],
            },
        );
        Ok(client)
    }

    async fn serve(self, conn: u64, mut read: ReadHalf<DuplexStream>) {
        let connected = match read_frame(&mut read).await {
            Ok(frame) => self.handshake(conn, &frame).unwrap_or(false),
            Err(_) => false,
        };
        if connected {
            while let Ok(frame) = read_frame(&mut read).await {
                match self.handle(conn, &frame) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) | Err(_) => break,
                    Ok(Flow::Severed) => return,
                }
            }
        }
        self.state.lock().disconnect(conn);
    }

    fn handshake(&self, conn: u64, frame: &[u8]) -> io::Result<bool> {
        let mut r = frame;
        let _protocol_version = r.read_i32::<BigEndian>()?;
        let _last_zxid_seen = r.read_i64::<BigEndian>()?;
        let requested = r.read_i32::<BigEndian>()?;
        let session_id = r.read_i64::<BigEndian>()?;
        let password = r.read_buffer()?;

        let mut state = self.state.lock();
        let (timeout, session_id, password) = if session_id == 0 {
            let id = state.next_session;
            state.next_session += 1;
            let password = id.to_be_bytes().repeat(2);
            state.sessions.insert(
                id,
                Session {
                    password: password.clone(),
                    timeout: requested,
                    conn: Some(conn),
                },
            );
            (requested, id, password)
        } else {
            let resumed = match state.sessions.get_mut(&session_id) {
                Some(s) if s.password == password => {
                    let old = s.conn.replace(conn);
                    Some((s.timeout, old))
                }
                _ => None,
            };
            match resumed {
                Some((timeout, old)) => {
                    if let Some(old) = old.filter(|&old| old != conn) {
                        state.sever(old);
                    }
                    (timeout, session_id, password)
                }
                None => (0, 0, Vec::new()),
            }
        };

        let mut body = Vec::new();
        body.write_i32::<BigEndian>(0)?;
        body.write_i32::<BigEndian>(timeout)?;
        body.write_i64::<BigEndian>(session_id)?;
        password[..].write_to(&mut body)?;
        body.write_u8(0)?;
        let mut frame = Vec::new();
        frame.write_i32::<BigEndian>(body.len() as i32)?;
        frame.extend_from_slice(&body);

        if let Some(c) = state.conns.get_mut(&conn) {
            c.session_id = session_id;
            let _ = c.tx.unbounded_send(frame);
        }
        Ok(timeout > 0)
    }

    fn handle(&self, conn: u64, frame: &[u8]) -> io::Result<Flow> {
        let mut r = frame;
        let xid = r.read_i32::<BigEndian>()?;
        let opcode = OpCode::try_from(r.read_i32::<BigEndian>()?)
            .map_err(|c| io::Error::new(io::ErrorKind::InvalidData, format!("opcode {}", c)))?;

        let mut state = self.state.lock();
        let session_id = match state.conns.get(&conn) {
            Some(c) => c.session_id,
            None => return Ok(Flow::Severed),
        };
        let mut fired = Fired::new();
        let mut flow = Flow::Continue;

        let (err, body) = match opcode {
            OpCode::Ping => (ZkError::Ok, Vec::new()),
            OpCode::CloseSession => {
                state.end_session(session_id, &mut fired);
                flow = Flow::Close;
                (ZkError::Ok, Vec::new())
            }
            opcode => {
                let request = decode(opcode, &mut r)?;
                match state.apply(conn, session_id, request, &mut fired)? {
                    Ok(body) => (ZkError::Ok, body),
                    Err((e, body)) => (e, body),
                }
            }
        };

        if state.drop_reply == Some(opcode) {
            state.drop_reply = None;
            state.sever(conn);
            state.deliver(fired);
            return Ok(Flow::Severed);
        }
        state.deliver(fired);
        let zxid = state.zxid;
        state.send(conn, xid, zxid, err, &body)?;
        Ok(flow)
    }
}

impl State {
    fn children_of(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|k| k.as_str() != "/" && paths::parent(k) == path)
            .map(|k| paths::node_name(k).to_string())
            .collect()
    }

    fn stat_of(&self, path: &str) -> Option<Stat> {
        let node = self.nodes.get(path)?;
        let mut stat = node.stat;
        stat.data_length = node.data.len() as i32;
        stat.num_children = self.children_of(path).len() as i32;
        Some(stat)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            nodes: self.nodes.clone(),
            zxid: self.zxid,
            data_watches: self.data_watches.clone(),
            child_watches: self.child_watches.clone(),
        }
    }

    fn restore(&mut self, s: Snapshot) {
        self.nodes = s.nodes;
        self.zxid = s.zxid;
        self.data_watches = s.data_watches;
        self.child_watches = s.child_watches;
    }

    fn fire(
        watches: &mut HashMap<String, HashSet<u64>>,
        path: &str,
        event: WatchedEventType,
        fired: &mut Fired,
    ) {
        if let Some(conns) = watches.remove(path) {
            for conn in conns {
                if !fired.iter().any(|(c, _, p)| *c == conn && p == path) {
                    fired.push((conn, event, path.to_string()));
                }
            }
        }
    }

    fn create(
        &mut self,
        session_id: i64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        fired: &mut Fired,
    ) -> Result<String, ZkError> {
        if paths::validate(path).is_err() || path == "/" {
            return Err(ZkError::BadArguments);
        }
        let parent = paths::parent(path).to_string();
        let parent_stat = self.nodes.get(&parent).ok_or(ZkError::NoNode)?.stat;
        if parent_stat.ephemeral_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals);
        }
        let path = if mode.is_sequential() {
            format!("{}{:010}", path, parent_stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&path) {
            return Err(ZkError::NodeExists);
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: zxid,
            mtime: zxid,
            ephemeral_owner: if mode.is_ephemeral() { session_id } else { 0 },
            ..Stat::default()
        };
        self.nodes.insert(path.clone(), Node { data, stat });
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.stat.cversion += 1;
            p.stat.pzxid = zxid;
        }
        Self::fire(&mut self.data_watches, &path, WatchedEventType::NodeCreated, fired);
        Self::fire(
            &mut self.child_watches,
            &parent,
            WatchedEventType::NodeChildrenChanged,
            fired,
        );
        Ok(path)
    }

    fn delete(&mut self, path: &str, version: i32, fired: &mut Fired) -> Result<(), ZkError> {
        if path == "/" {
            return Err(ZkError::BadArguments);
        }
        let stat = self.nodes.get(path).ok_or(ZkError::NoNode)?.stat;
        if version != -1 && version != stat.version {
            return Err(ZkError::BadVersion);
        }
        if !self.children_of(path).is_empty() {
            return Err(ZkError::NotEmpty);
        }

        self.zxid += 1;
        self.nodes.remove(path);
        let parent = paths::parent(path).to_string();
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.stat.cversion += 1;
            p.stat.pzxid = self.zxid;
        }
        Self::fire(&mut self.data_watches, path, WatchedEventType::NodeDeleted, fired);
        Self::fire(&mut self.child_watches, path, WatchedEventType::NodeDeleted, fired);
        Self::fire(
            &mut self.child_watches,
            &parent,
            WatchedEventType::NodeChildrenChanged,
            fired,
        );
        Ok(())
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        version: i32,
        fired: &mut Fired,
    ) -> Result<Stat, ZkError> {
        self.zxid += 1;
        let zxid = self.zxid;
        let node = match self.nodes.get_mut(path) {
            Some(node) => node,
            None => {
                self.zxid -= 1;
                return Err(ZkError::NoNode);
            }
        };
        if version != -1 && version != node.stat.version {
            self.zxid -= 1;
            return Err(ZkError::BadVersion);
        }
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = zxid;
        Self::fire(&mut self.data_watches, path, WatchedEventType::NodeDataChanged, fired);
        self.stat_of(path).ok_or(ZkError::NoNode)
    }

    fn check(&self, path: &str, version: i32) -> Result<(), ZkError> {
        let stat = self.nodes.get(path).ok_or(ZkError::NoNode)?.stat;
        if version != -1 && version != stat.version {
            return Err(ZkError::BadVersion);
        }
        Ok(())
    }

    fn watch(&mut self, child: bool, path: &str, conn: u64) {
        let watches = if child {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        watches.entry(path.to_string()).or_default().insert(conn);
    }

    /// Runs one request. The inner error carries the body that goes with it.
    #[allow(clippy::type_complexity)]
    fn apply(
        &mut self,
        conn: u64,
        session_id: i64,
        request: Request,
        fired: &mut Fired,
    ) -> io::Result<Result<Vec<u8>, (ZkError, Vec<u8>)>> {
        let mut body = Vec::new();
        let r = match request {
            Request::Create { path, data, mode } => self
                .create(session_id, &path, data, mode, fired)
                .and_then(|p| p.write_to(&mut body).map_err(|_| ZkError::MarshallingError)),
            Request::Delete { path, version } => self.delete(&path, version, fired),
            Request::SetData {
                path,
                data,
                version,
            } => self
                .set_data(&path, data, version, fired)
                .map(|stat| write_stat(&mut body, &stat)),
            Request::Check { path, version } => self.check(&path, version),
            Request::Exists { path, watch } => {
                if watch.to_u8() != 0 {
                    self.watch(false, &path, conn);
                }
                self.stat_of(&path)
                    .map(|stat| write_stat(&mut body, &stat))
                    .ok_or(ZkError::NoNode)
            }
            Request::GetData { path, watch } => match self.nodes.get(&path).cloned() {
                Some(node) => {
                    if watch.to_u8() != 0 {
                        self.watch(false, &path, conn);
                    }
                    node.data[..].write_to(&mut body)?;
                    let stat = self.stat_of(&path).unwrap_or(node.stat);
                    write_stat(&mut body, &stat);
                    Ok(())
                }
                None => Err(ZkError::NoNode),
            },
            Request::GetChildren { path, watch } => {
                if self.nodes.contains_key(&path) {
                    if watch.to_u8() != 0 {
                        self.watch(true, &path, conn);
                    }
                    crate::proto::request::write_list(&mut body, &self.children_of(&path))?;
                    Ok(())
                } else {
                    Err(ZkError::NoNode)
                }
            }
            Request::Multi(ops) => return self.multi(session_id, ops, fired),
            Request::SetWatches {
                relative_zxid,
                data,
                exist,
                child,
            } => {
                self.set_watches(conn, relative_zxid, data, exist, child, fired);
                Ok(())
            }
            Request::Connect { .. } => Err(ZkError::Unimplemented),
        };
        Ok(r.map(|_| body).map_err(|e| (e, Vec::new())))
    }

    #[allow(clippy::type_complexity)]
    fn multi(
        &mut self,
        session_id: i64,
        ops: Vec<Request>,
        fired: &mut Fired,
    ) -> io::Result<Result<Vec<u8>, (ZkError, Vec<u8>)>> {
        let snapshot = self.snapshot();
        let mut staged = Fired::new();
        let mut body = Vec::new();
        let count = ops.len();
        for (i, op) in ops.into_iter().enumerate() {
            let opcode = op.opcode();
            let mut out = Vec::new();
            let r = match op {
                Request::Create { path, data, mode } => self
                    .create(session_id, &path, data, mode, &mut staged)
                    .map(|p| p.write_to(&mut out)),
                Request::Delete { path, version } => {
                    self.delete(&path, version, &mut staged).map(|_| Ok(()))
                }
                Request::SetData {
                    path,
                    data,
                    version,
                } => self
                    .set_data(&path, data, version, &mut staged)
                    .map(|stat| Ok(write_stat(&mut out, &stat))),
                Request::Check { path, version } => self.check(&path, version).map(|_| Ok(())),
                _ => Err(ZkError::BadArguments),
            };
            match r {
                Ok(written) => {
                    written?;
                    MultiHeader::NextOk(opcode).write_to(&mut body)?;
                    body.extend_from_slice(&out);
                }
                Err(e) => {
                    self.restore(snapshot);
                    let mut body = Vec::new();
                    for j in 0..count {
                        let code = match j {
                            j if j < i => ZkError::Ok,
                            j if j == i => e,
                            _ => ZkError::RuntimeInconsistency,
                        };
                        MultiHeader::NextErr(code).write_to(&mut body)?;
                        body.write_i32::<BigEndian>(code as i32)?;
                    }
                    MultiHeader::Done.write_to(&mut body)?;
                    return Ok(Err((e, body)));
                }
            }
        }
        MultiHeader::Done.write_to(&mut body)?;
        fired.extend(staged);
        Ok(Ok(body))
    }

    fn set_watches(
        &mut self,
        conn: u64,
        relative_zxid: i64,
        data: Vec<String>,
        exist: Vec<String>,
        child: Vec<String>,
        fired: &mut Fired,
    ) {
        for path in data {
            match self.nodes.get(&path).map(|n| n.stat.mzxid) {
                None => fired.push((conn, WatchedEventType::NodeDeleted, path)),
                Some(mzxid) if mzxid > relative_zxid => {
                    fired.push((conn, WatchedEventType::NodeDataChanged, path))
                }
                Some(_) => self.watch(false, &path, conn),
            }
        }
        for path in exist {
            if self.nodes.contains_key(&path) {
                fired.push((conn, WatchedEventType::NodeCreated, path));
            } else {
                self.watch(false, &path, conn);
            }
        }
        for path in child {
            match self.nodes.get(&path).map(|n| n.stat.pzxid) {
                None => fired.push((conn, WatchedEventType::NodeDeleted, path)),
                Some(pzxid) if pzxid > relative_zxid => {
                    fired.push((conn, WatchedEventType::NodeChildrenChanged, path))
                }
                Some(_) => self.watch(true, &path, conn),
            }
        }
    }

    /// Removes a session and its ephemeral nodes. Returns the connection it was attached to.
    fn end_session(&mut self, session_id: i64, fired: &mut Fired) -> Option<u64> {
        let session = self.sessions.remove(&session_id)?;
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session_id)
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            let _ = self.delete(&path, -1, fired);
        }
        session.conn
    }

    fn forget_watches(&mut self, conn: u64) {
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            watches.retain(|_, conns| {
                conns.remove(&conn);
                !conns.is_empty()
            });
        }
    }

    fn disconnect(&mut self, conn: u64) {
        if self.conns.remove(&conn).is_some() {
            self.forget_watches(conn);
        }
    }

    fn sever(&mut self, conn: u64) {
        if let Some(c) = self.conns.remove(&conn) {
            for task in c.tasks {
                task.abort();
            }
            self.forget_watches(conn);
        }
    }

    fn deliver(&mut self, fired: Fired) {
        for (conn, event, path) in fired {
            let mut body = Vec::new();
            let encoded = body
                .write_i32::<BigEndian>(event as i32)
                .and_then(|_| body.write_i32::<BigEndian>(KeeperState::SyncConnected as i32))
                .and_then(|_| path.write_to(&mut body));
            if encoded.is_ok() {
                let _ = self.send(conn, XID_NOTIFICATION, -1, ZkError::Ok, &body);
            }
        }
    }

    fn send(&self, conn: u64, xid: i32, zxid: i64, err: ZkError, body: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(20 + body.len());
        frame.write_i32::<BigEndian>(16 + body.len() as i32)?;
        frame.write_i32::<BigEndian>(xid)?;
        frame.write_i64::<BigEndian>(zxid)?;
        frame.write_i32::<BigEndian>(err as i32)?;
        frame.extend_from_slice(body);
        if let Some(c) = self.conns.get(&conn) {
            let _ = c.tx.unbounded_send(frame);
        }
        Ok(())
    }
}

fn write_stat(out: &mut Vec<u8>, stat: &Stat) {
    // writing to a Vec cannot fail
    let _ = (|| -> io::Result<()> {
        out.write_i64::<BigEndian>(stat.czxid)?;
        out.write_i64::<BigEndian>(stat.mzxid)?;
        out.write_i64::<BigEndian>(stat.ctime)?;
        out.write_i64::<BigEndian>(stat.mtime)?;
        out.write_i32::<BigEndian>(stat.version)?;
        out.write_i32::<BigEndian>(stat.cversion)?;
        out.write_i32::<BigEndian>(stat.aversion)?;
        out.write_i64::<BigEndian>(stat.ephemeral_owner)?;
        out.write_i32::<BigEndian>(stat.data_length)?;
        out.write_i32::<BigEndian>(stat.num_children)?;
        out.write_i64::<BigEndian>(stat.pzxid)
    })();
}

fn decode(opcode: OpCode, r: &mut &[u8]) -> io::Result<Request> {
    let watched = |r: &mut &[u8]| -> io::Result<Watch> {
        Ok(if r.read_u8()? != 0 {
            Watch::Global
        } else {
            Watch::None
        })
    };
    Ok(match opcode {
        OpCode::Create => {
            let path = r.read_string()?;
            let data = r.read_buffer()?;
            for _ in 0..r.read_i32::<BigEndian>()? {
                let _perms = r.read_i32::<BigEndian>()?;
                let _scheme = r.read_string()?;
                let _id = r.read_string()?;
            }
            let mode = CreateMode::try_from(r.read_i32::<BigEndian>()?).map_err(|c| {
                io::Error::new(io::ErrorKind::InvalidData, format!("create mode {}", c))
            })?;
            Request::Create { path, data, mode }
        }
        OpCode::Delete => Request::Delete {
            path: r.read_string()?,
            version: r.read_i32::<BigEndian>()?,
        },
        OpCode::Check => Request::Check {
            path: r.read_string()?,
            version: r.read_i32::<BigEndian>()?,
        },
        OpCode::SetData => Request::SetData {
            path: r.read_string()?,
            data: r.read_buffer()?,
            version: r.read_i32::<BigEndian>()?,
        },
        OpCode::Exists => Request::Exists {
            path: r.read_string()?,
            watch: watched(r)?,
        },
        OpCode::GetData => Request::GetData {
            path: r.read_string()?,
            watch: watched(r)?,
        },
        OpCode::GetChildren => Request::GetChildren {
            path: r.read_string()?,
            watch: watched(r)?,
        },
        OpCode::Multi => {
            let mut ops = Vec::new();
            loop {
                let opcode = r.read_i32::<BigEndian>()?;
                let done = r.read_u8()? != 0;
                let _err = r.read_i32::<BigEndian>()?;
                if done {
                    break;
                }
                let opcode = OpCode::try_from(opcode).map_err(|c| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("opcode {}", c))
                })?;
                ops.push(decode(opcode, r)?);
            }
            Request::Multi(ops)
        }
        OpCode::SetWatches => Request::SetWatches {
            relative_zxid: r.read_i64::<BigEndian>()?,
            data: r.read_string_list()?,
            exist: r.read_string_list()?,
            child: r.read_string_list()?,
        },
        opcode => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no request body for {:?}", opcode),
            ))
        }
    })
}

async fn read_frame(read: &mut ReadHalf<DuplexStream>) -> io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let length = read.read_i32().await?;
    let mut frame = vec![0; length.max(0) as usize];
    read.read_exact(&mut frame).await?;
    Ok(frame)
}

async fn write_frames(mut write: WriteHalf<DuplexStream>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.next().await {
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
    let _ = write.shutdown().await;
}
