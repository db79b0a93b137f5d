use crate::RetryPolicy;
use async_trait::async_trait;
use byteorder::{BigEndian, WriteBytesExt};
use failure::format_err;
use slog::{debug, info, trace};
use std::{fmt, io, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

mod active_packetizer;
mod error;
mod packetizer;
pub(crate) mod request;
pub(crate) mod response;
mod watch;

pub(crate) use self::active_packetizer::{ActivePacketizer, Credentials};
use self::active_packetizer::MAX_FRAME_LEN;
pub use self::error::ZkError;
pub(crate) use self::packetizer::{Enqueuer, Packetizer};
pub(crate) use self::request::{OpCode, Request};
pub(crate) use self::response::Response;
pub(crate) use self::watch::{Watch, WatchRegistry, WatchType};

/// A byte stream that can carry a session with the ensemble.
///
/// Implemented for `tokio::net::TcpStream` with `host:port` addresses.
#[async_trait]
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Sized + Send + 'static {
    /// Address of one ensemble member.
    type Addr: Send + Sync + Clone + fmt::Debug + 'static;
    /// The error returned when a member cannot be reached.
    type ConnectError: Into<failure::Error> + 'static;
    /// Opens a stream to the member at `addr`.
    async fn connect(addr: Self::Addr) -> Result<Self, Self::ConnectError>;
}

#[async_trait]
impl Transport for TcpStream {
    type Addr = String;
    type ConnectError = io::Error;
    async fn connect(addr: String) -> Result<Self, Self::ConnectError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// What the connection task needs to know to (re)establish a session.
#[derive(Debug)]
pub(crate) struct ConnectParams<A> {
    pub(crate) addrs: Vec<A>,
    pub(crate) session_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) queue_while_disconnected: bool,
}

#[derive(Debug)]
pub(crate) enum HandshakeError {
    /// No member could be reached or the handshake failed midway.
    Unreachable(failure::Error),
    /// The ensemble refused to resume the session.
    Expired,
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        HandshakeError::Unreachable(e.into())
    }
}

impl From<failure::Error> for HandshakeError {
    fn from(e: failure::Error) -> Self {
        HandshakeError::Unreachable(e)
    }
}

/// Establishes the first session, retrying according to the retry policy.
pub(crate) async fn connect<S>(
    params: &ConnectParams<S::Addr>,
    log: &slog::Logger,
) -> Result<ActivePacketizer<S>, failure::Error>
where
    S: Transport,
{
    let mut attempt = 0;
    loop {
        match establish::<S>(params, &Credentials::default(), log).await {
            Ok(ap) => return Ok(ap),
            Err(HandshakeError::Expired) => {
                return Err(format_err!("ensemble refused to open a session"))
            }
            Err(HandshakeError::Unreachable(e)) if attempt >= params.retry.max_retries => {
                return Err(e)
            }
            Err(HandshakeError::Unreachable(e)) => {
                let backoff = params.retry.backoff(attempt);
                info!(log, "could not connect to ensemble; retrying";
                      "attempt" => attempt, "backoff" => ?backoff, "error" => %e);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Walks the configured members in order until one completes a handshake.
///
/// Each member gets `connect_timeout` to accept the connection and answer the handshake.
pub(crate) async fn establish<S>(
    params: &ConnectParams<S::Addr>,
    credentials: &Credentials,
    log: &slog::Logger,
) -> Result<ActivePacketizer<S>, HandshakeError>
where
    S: Transport,
{
    let mut last = None;
    for addr in &params.addrs {
        trace!(log, "connecting"; "addr" => ?addr, "session_id" => credentials.session_id);
        let attempt = handshake::<S>(addr.clone(), params.session_timeout, credentials);
        match tokio::time::timeout(params.connect_timeout, attempt).await {
            Ok(Ok(ap)) => {
                info!(log, "connected to ensemble";
                      "addr" => ?addr, "session_id" => ap.session_id);
                return Ok(ap);
            }
            Ok(Err(HandshakeError::Expired)) => {
                info!(log, "ensemble expired session"; "session_id" => credentials.session_id);
                return Err(HandshakeError::Expired);
            }
            Ok(Err(HandshakeError::Unreachable(e))) => {
                debug!(log, "member unreachable"; "addr" => ?addr, "error" => %e);
                last = Some(e);
            }
            Err(_) => {
                debug!(log, "member did not answer in time"; "addr" => ?addr);
                last = Some(format_err!("timed out connecting to {:?}", addr));
            }
        }
    }
    Err(HandshakeError::Unreachable(
        last.unwrap_or_else(|| format_err!("no ensemble members configured")),
    ))
}

async fn handshake<S>(
    addr: S::Addr,
    session_timeout: Duration,
    credentials: &Credentials,
) -> Result<ActivePacketizer<S>, HandshakeError>
where
    S: Transport,
{
    let mut stream = S::connect(addr)
        .await
        .map_err(|e| HandshakeError::Unreachable(e.into()))?;

    let request = Request::Connect {
        protocol_version: 0,
        last_zxid_seen: credentials.last_zxid_seen,
        timeout: session_timeout.as_millis().min(i32::MAX as u128) as i32,
        session_id: credentials.session_id,
        passwd: credentials.password.clone(),
        read_only: false,
    };

    // the connect request is framed without a request header
    let mut frame = vec![0, 0, 0, 0];
    request.serialize_into(&mut frame)?;
    let written = frame.len() - 4;
    (&mut frame[..4]).write_i32::<BigEndian>(written as i32)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let length = stream.read_i32().await?;
    if !(0..MAX_FRAME_LEN).contains(&length) {
        return Err(format_err!("invalid handshake response length {}", length).into());
    }
    let mut body = vec![0; length as usize];
    stream.read_exact(&mut body).await?;

    match Response::parse(OpCode::CreateSession, &mut &body[..])? {
        Response::Connect { timeout, .. } if timeout <= 0 => Err(HandshakeError::Expired),
        Response::Connect {
            timeout,
            session_id,
            password,
            ..
        } => Ok(ActivePacketizer::new(
            stream,
            timeout,
            session_id,
            password,
            credentials.last_zxid_seen,
        )),
        r => Err(format_err!("unexpected handshake response {:?}", r).into()),
    }
}
