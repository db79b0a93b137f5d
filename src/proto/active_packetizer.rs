use super::{
    request::{self, OpCode},
    response::ReadFrom,
    watch::{ArmedWatches, WatchRegistry, WatchType},
    Request, Response,
};
use crate::{WatchedEvent, ZkError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::format_err;
use futures::channel::{mpsc, oneshot};
use slog::{debug, info, trace, warn};
use std::collections::HashMap;
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reserved xids.
pub(super) const XID_CLOSE: i32 = 0;
const XID_NOTIFICATION: i32 = -1;
const XID_PING: i32 = -2;
const XID_SET_WATCHES: i32 = -8;

/// Largest frame accepted from the ensemble.
pub(super) const MAX_FRAME_LEN: i32 = 4096 * 1024;

pub(super) type Reply = oneshot::Sender<Result<Response, ZkError>>;

/// Session identity carried from one connection to the next.
#[derive(Clone, Debug, Default)]
pub(crate) struct Credentials {
    pub(crate) session_id: i64,
    pub(crate) password: Vec<u8>,
    pub(crate) last_zxid_seen: i64,
}

pub(crate) struct ActivePacketizer<S> {
    stream: Pin<Box<S>>,

    /// Heartbeat timer,
    timer: Pin<Box<tokio::time::Sleep>>,
    timeout: time::Duration,

    /// Bytes we have not yet set.
    outbox: Vec<u8>,

    /// Prefix of outbox that has been sent.
    outstart: usize,

    /// Bytes we have not yet deserialized.
    inbox: Vec<u8>,

    /// Prefix of inbox that has been sent.
    instart: usize,

    /// What operation are we waiting for a response for?
    reply: HashMap<i32, (OpCode, Reply)>,

    /// Custom registered watchers (xid -> watcher to add when ok)
    pending_watchers: HashMap<i32, (String, oneshot::Sender<WatchedEvent>, WatchType)>,

    /// Fields for re-connection
    pub(super) last_zxid_seen: i64,
    pub(super) session_id: i64,
    password: Vec<u8>,
}

impl<S> ActivePacketizer<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps a stream whose handshake has completed.
    ///
    /// `negotiated_timeout` is the session timeout the ensemble agreed to, in milliseconds.
    pub(super) fn new(
        stream: S,
        negotiated_timeout: i32,
        session_id: i64,
        password: Vec<u8>,
        last_zxid_seen: i64,
    ) -> Self {
        // ping when a third of the session timeout passed without us writing anything
        let timeout = time::Duration::from_millis(negotiated_timeout.max(3) as u64 / 3);
        ActivePacketizer {
            stream: Box::pin(stream),
            timer: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            outbox: Vec::new(),
            outstart: 0,
            inbox: Vec::new(),
            instart: 0,
            reply: Default::default(),
            pending_watchers: Default::default(),

            last_zxid_seen,
            session_id,
            password,
        }
    }

    pub(super) fn credentials(&self) -> Credentials {
        Credentials {
            session_id: self.session_id,
            password: self.password.clone(),
            last_zxid_seen: self.last_zxid_seen,
        }
    }

    pub(super) fn pending_watchers(
        &mut self,
    ) -> &mut HashMap<i32, (String, oneshot::Sender<WatchedEvent>, WatchType)> {
        &mut self.pending_watchers
    }

    fn outlen(&self) -> usize {
        self.outbox.len() - self.outstart
    }

    fn inlen(&self) -> usize {
        self.inbox.len() - self.instart
    }

    /// Appends one length-prefixed frame to the outbox.
    fn frame(&mut self, xid: i32, item: &Request) {
        let lengthi = self.outbox.len();
        // dummy length
        self.outbox.extend_from_slice(&[0, 0, 0, 0]);

        // xid
        self.outbox
            .write_i32::<BigEndian>(xid)
            .expect("Vec::write should never fail");
        // opcode
        self.outbox
            .write_i32::<BigEndian>(item.opcode() as i32)
            .expect("Vec::write should never fail");

        // type and payload
        item.serialize_into(&mut self.outbox)
            .expect("Vec::write should never fail");
        // set true length
        let written = self.outbox.len() - lengthi - 4;
        let mut length = &mut self.outbox[lengthi..lengthi + 4];
        length
            .write_i32::<BigEndian>(written as i32)
            .expect("Vec::write should never fail");
    }

    /// Writes a frame that has a header but no body.
    fn bare_frame(&mut self, xid: i32, opcode: OpCode) {
        // length is fixed
        self.outbox
            .write_i32::<BigEndian>(8)
            .expect("Vec::write should never fail");
        self.outbox
            .write_i32::<BigEndian>(xid)
            .expect("Vec::write should never fail");
        self.outbox
            .write_i32::<BigEndian>(opcode as i32)
            .expect("Vec::write should never fail");
    }

    pub(super) fn enqueue(&mut self, xid: i32, item: Request, tx: Reply) {
        let old = self.reply.insert(xid, (item.opcode(), tx));
        assert!(old.is_none(), "xid {} reused while in flight", xid);
        self.frame(xid, &item);
    }

    pub(super) fn enqueue_close(&mut self) {
        self.bare_frame(XID_CLOSE, OpCode::CloseSession);
    }

    /// Asks the ensemble to re-arm watches that were set before this connection existed.
    ///
    /// Watches whose path changed after `last_zxid_seen` fire right away.
    pub(super) fn enqueue_set_watches(&mut self, armed: ArmedWatches) {
        let request = Request::SetWatches {
            relative_zxid: self.last_zxid_seen,
            data: armed.data,
            exist: armed.exist,
            child: armed.child,
        };
        self.frame(XID_SET_WATCHES, &request);
    }

    fn poll_write(
        &mut self,
        cx: &mut Context,
        exiting: bool,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>>
    where
        S: AsyncWrite,
    {
        let mut wrote = false;
        while self.outlen() != 0 {
            let n = ready!(self
                .stream
                .as_mut()
                .poll_write(cx, &self.outbox[self.outstart..])?);
            if n == 0 {
                return Poll::Ready(Err(format_err!("connection refused further writes")));
            }
            wrote = true;
            self.outstart += n;
            if self.outstart == self.outbox.len() {
                self.outbox.clear();
                self.outstart = 0;
            }
        }

        if wrote {
            // heartbeat is since last write traffic!
            trace!(logger, "resetting heartbeat timer");
            self.timer
                .as_mut()
                .reset(tokio::time::Instant::now() + self.timeout);
        }

        ready!(self
            .stream
            .as_mut()
            .poll_flush(cx)
            .map_err(failure::Error::from)?);

        if exiting {
            debug!(logger, "shutting down writer");
            ready!(self.stream.as_mut().poll_shutdown(cx)?);
        }

        Poll::Ready(Ok(()))
    }

    fn poll_read(
        &mut self,
        cx: &mut Context,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        watches: &WatchRegistry,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>>
    where
        S: AsyncRead,
    {
        loop {
            let mut need = if self.inlen() >= 4 {
                let length = (&mut &self.inbox[self.instart..]).read_i32::<BigEndian>()?;
                if !(0..MAX_FRAME_LEN).contains(&length) {
                    return Poll::Ready(Err(format_err!("invalid frame length {}", length)));
                }
                length as usize + 4
            } else {
                4
            };
            trace!(logger, "need {} bytes, have {}", need, self.inlen());

            while self.inlen() < need {
                let read_from = self.inbox.len();
                self.inbox.resize(self.instart + need, 0);
                let mut inbox_buf = ReadBuf::new(&mut self.inbox[read_from..]);
                match self.stream.as_mut().poll_read(cx, &mut inbox_buf)? {
                    Poll::Ready(()) => {
                        let n = inbox_buf.filled().len();
                        self.inbox.truncate(read_from + n);
                        if n == 0 {
                            if self.inlen() != 0 {
                                return Poll::Ready(Err(format_err!(
                                    "connection closed with {} bytes left in buffer: {:x?}",
                                    self.inlen(),
                                    &self.inbox[self.instart..]
                                )));
                            } else {
                                // Server closed session with no bytes left in buffer
                                debug!(logger, "server closed connection");
                                return Poll::Ready(Ok(()));
                            }
                        }

                        if self.inlen() >= 4 && need == 4 {
                            let length = (&mut &self.inbox[self.instart..])
                                .read_i32::<BigEndian>()?
                                as usize;
                            need += length;
                        }
                    }
                    Poll::Pending => {
                        self.inbox.truncate(read_from);
                        return Poll::Pending;
                    }
                }
            }

            {
                let mut err = None;
                let mut buf = &self.inbox[self.instart + 4..self.instart + need];
                self.instart += need;

                let xid = buf.read_i32::<BigEndian>()?;
                let zxid = buf.read_i64::<BigEndian>()?;
                if zxid > self.last_zxid_seen {
                    trace!(
                        logger,
                        "updated zxid from {} to {}",
                        self.last_zxid_seen,
                        zxid
                    );
                    self.last_zxid_seen = zxid;
                }
                let zk_err: ZkError = buf.read_i32::<BigEndian>()?.into();
                if zk_err != ZkError::Ok {
                    err = Some(zk_err);
                }

                if xid == XID_CLOSE {
                    // response to shutdown -- empty response
                    // XXX: in theory, server should now shut down receive end
                    trace!(logger, "got response to CloseSession");
                    if let Some(e) = err {
                        return Poll::Ready(Err(format_err!("failed to close session: {:?}", e)));
                    }
                } else if xid == XID_NOTIFICATION {
                    // watch event
                    let e = WatchedEvent::read_from(&mut buf)?;
                    trace!(logger, "got watcher event {:?}", e);

                    let fired = watches.trigger(&e);
                    if fired > 0 {
                        trace!(logger, "notified custom watchers"; "n" => fired);
                    }

                    // NOTE: ignoring error, because the user may not care about events
                    let _ = default_watcher.unbounded_send(e);
                } else if xid == XID_PING {
                    // response to ping -- empty response
                    trace!(logger, "got response to heartbeat");
                    if let Some(e) = err {
                        return Poll::Ready(Err(format_err!("bad response to ping: {:?}", e)));
                    }
                } else if xid == XID_SET_WATCHES {
                    match err {
                        Some(e) => warn!(logger, "ensemble refused to re-arm watches: {:?}", e),
                        None => debug!(logger, "watches re-armed"),
                    }
                } else {
                    // response to user request

                    // find the waiting request future
                    let (opcode, tx) = match self.reply.remove(&xid) {
                        Some(reply) => reply,
                        None => {
                            return Poll::Ready(Err(format_err!(
                                "response to unknown xid {}",
                                xid
                            )))
                        }
                    };

                    if let Some((path, w, wtype)) = self.pending_watchers.remove(&xid) {
                        // normally, watches are *only* added for successful operations
                        // the exception to this is if an exists call fails with NoNode
                        if err.is_none() || (opcode == OpCode::Exists && err == Some(ZkError::NoNode))
                        {
                            trace!(logger, "pending watcher turned into real watcher"; "xid" => xid);
                            // the ensemble files an exists watch on a live node as a data watch
                            let wtype = if wtype == WatchType::Exist && err.is_none() {
                                WatchType::Data
                            } else {
                                wtype
                            };
                            watches.add(path, w, wtype);
                        } else {
                            trace!(logger,
                                   "pending watcher not turned into real watcher: {:?}",
                                   err;
                                   "xid" => xid
                            );
                        }
                    }

                    match err {
                        // a failed multi still reports the outcome of every operation
                        Some(e) if opcode == OpCode::Multi && !buf.is_empty() => {
                            let r = Response::parse(opcode, &mut buf)?;
                            debug!(logger,
                                   "handling failed multi: {:?}", e;
                                   "xid" => xid);
                            let _ = tx.send(Ok(r));
                        }
                        Some(e) => {
                            info!(logger,
                                   "handling server error response: {:?}", e;
                                   "xid" => xid, "opcode" => ?opcode);

                            let _ = tx.send(Err(e));
                        }
                        None => {
                            let r = Response::parse(opcode, &mut buf)?;

                            debug!(logger,
                                   "handling server response: {:?}", r;
                                   "xid" => xid, "opcode" => ?opcode);

                            let _ = tx.send(Ok(r)); // if receiver doesn't care, we don't either
                        }
                    }
                }
            }

            if self.instart == self.inbox.len() {
                self.inbox.clear();
                self.instart = 0;
            }
        }
    }

    pub(super) fn poll(
        &mut self,
        cx: &mut Context,
        exiting: bool,
        logger: &mut slog::Logger,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        watches: &WatchRegistry,
    ) -> Poll<Result<(), failure::Error>> {
        trace!(logger, "poll_read");
        let r = self.poll_read(cx, default_watcher, watches, logger)?;

        if let Poll::Ready(()) = self.timer.as_mut().poll(cx) {
            if self.outbox.is_empty() && !exiting {
                // send a ping!
                self.bare_frame(XID_PING, request::OpCode::Ping);
                trace!(logger, "sending heartbeat");
            } else {
                // already request in flight, so no need to also send heartbeat
            }

            self.timer
                .as_mut()
                .reset(tokio::time::Instant::now() + self.timeout);
        }

        trace!(logger, "poll_write");
        let w = self.poll_write(cx, exiting, logger)?;

        match (r, w) {
            (Poll::Ready(()), Poll::Ready(())) if exiting => {
                debug!(logger, "packetizer done");
                Poll::Ready(Ok(()))
            }
            (Poll::Ready(()), Poll::Ready(())) => Poll::Ready(Err(format_err!(
                "Not exiting, but server closed connection"
            ))),
            (Poll::Ready(()), _) => Poll::Ready(Err(format_err!(
                "outstanding requests, but response channel closed"
            ))),
            _ => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::request::WriteTo;
    use crate::proto::Watch;
    use crate::{KeeperState, WatchedEventType};
    use futures::future::poll_fn;
    
    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn reply_frame(xid: i32, zxid: i64, err: i32, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame
            .write_i32::<BigEndian>(16 + body.len() as i32)
            .unwrap();
        frame.write_i32::<BigEndian>(xid).unwrap();
        frame.write_i64::<BigEndian>(zxid).unwrap();
        frame.write_i32::<BigEndian>(err).unwrap();
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn frames_requests_and_routes_replies() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut ap = ActivePacketizer::new(client, 30_000, 1, vec![0; 16], 0);
        let (mut events, _events_rx) = mpsc::unbounded();
        let watches = WatchRegistry::default();
        let mut log = logger();

        let (tx, rx) = oneshot::channel();
        let (wtx, wrx) = oneshot::channel();
        ap.pending_watchers()
            .insert(5, ("/p".to_string(), wtx, WatchType::Data));
        ap.enqueue(
            5,
            Request::GetData {
                path: "/p".to_string(),
                watch: Watch::Global,
            },
            tx,
        );

        // flush the request
        let _ = poll_fn(|cx| {
            let _ = ap.poll(cx, false, &mut log, &mut events, &watches);
            Poll::Ready(())
        })
        .await;

        let len = tokio::io::AsyncReadExt::read_i32(&mut server).await.unwrap();
        let mut body = vec![0; len as usize];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut body).await.unwrap();
        let mut body = &body[..];
        assert_eq!(body.read_i32::<BigEndian>().unwrap(), 5);
        assert_eq!(body.read_i32::<BigEndian>().unwrap(), OpCode::GetData as i32);

        let mut payload = Vec::new();
        b"v"[..].write_to(&mut payload).unwrap();
        payload.extend_from_slice(&[0; 68]);
        tokio::io::AsyncWriteExt::write_all(&mut server, &reply_frame(5, 9, 0, &payload))
            .await
            .unwrap();

        let mut rx = rx;
        let response = poll_fn(|cx| {
            let _ = ap.poll(cx, false, &mut log, &mut events, &watches);
            match futures::FutureExt::poll_unpin(&mut rx, cx) {
                Poll::Ready(r) => Poll::Ready(r.unwrap()),
                Poll::Pending => Poll::Pending,
            }
        })
        .await;

        match response {
            Ok(Response::GetData { bytes, .. }) => assert_eq!(bytes, b"v"),
            r => panic!("unexpected response {:?}", r),
        }
        assert_eq!(ap.last_zxid_seen, 9);
        assert_eq!(watches.len(), 1);

        // a notification for the path fires the promoted watcher
        let mut note = Vec::new();
        note.write_i32::<BigEndian>(WatchedEventType::NodeDataChanged as i32)
            .unwrap();
        note.write_i32::<BigEndian>(KeeperState::SyncConnected as i32)
            .unwrap();
        "/p".write_to(&mut note).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut server, &reply_frame(-1, -1, 0, &note))
            .await
            .unwrap();

        let mut wrx = wrx;
        let fired = poll_fn(|cx| {
            let _ = ap.poll(cx, false, &mut log, &mut events, &watches);
            futures::FutureExt::poll_unpin(&mut wrx, cx)
        })
        .await
        .unwrap();
        assert_eq!(fired.path, "/p");
        assert_eq!(watches.len(), 0);
    }

    #[tokio::test]
    async fn rejects_bad_frame_lengths() {
        for length in [-1, MAX_FRAME_LEN, i32::MAX] {
            let (client, mut server) = tokio::io::duplex(64);
            let mut ap = ActivePacketizer::new(client, 30_000, 1, Vec::new(), 0);
            let (mut events, _events_rx) = mpsc::unbounded();
            let watches = WatchRegistry::default();
            let mut log = logger();

            let mut frame = Vec::new();
            frame.write_i32::<BigEndian>(length).unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut server, &frame)
                .await
                .unwrap();

            let r = poll_fn(|cx| ap.poll(cx, false, &mut log, &mut events, &watches)).await;
            let e = r.unwrap_err();
            assert!(e.to_string().contains("invalid frame length"), "{}", e);
        }
    }

    #[tokio::test]
    async fn server_hangup_is_an_error_unless_exiting() {
        let (client, server) = tokio::io::duplex(64);
        let mut ap = ActivePacketizer::new(client, 30_000, 1, Vec::new(), 0);
        let (mut events, _events_rx) = mpsc::unbounded();
        let watches = WatchRegistry::default();
        let mut log = logger();
        drop(server);

        let r = poll_fn(|cx| ap.poll(cx, false, &mut log, &mut events, &watches)).await;
        assert!(r.is_err());
    }
}
