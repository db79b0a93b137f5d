use crate::error::{Error, ErrorKind, Operation};
use std::time::Duration;

/// How long to wait between attempts of an operation that lost its connection.
///
/// Attempt `n` (counting from zero) waits `initial_backoff * backoff_multiplier^n`, capped at
/// `max_backoff`. There is no jitter: two clients with the same policy retry in lockstep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub initial_backoff: Duration,
    /// How many times an operation is retried before its `ConnectionLoss` is surfaced. The same
    /// limit bounds how often a suspended session is resumed before it is declared lost.
    pub max_retries: u32,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Upper bound for a single wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(Duration::from_secs(1), 3)
    }
}

impl RetryPolicy {
    /// Doubles the wait after every attempt, starting at `initial_backoff`.
    pub fn exponential(initial_backoff: Duration, max_retries: u32) -> Self {
        RetryPolicy {
            initial_backoff,
            max_retries,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Never waits and never retries.
    pub fn never() -> Self {
        RetryPolicy {
            initial_backoff: Duration::ZERO,
            max_retries: 0,
            backoff_multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// The wait before retry number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Everything a client needs to know before it connects.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Ensemble members as `host:port`, tried in order.
    pub endpoints: Vec<String>,
    /// Session timeout requested from the ensemble.
    pub session_timeout: Duration,
    /// Bound on connecting to and handshaking with a single member. Also bounds how long a retried
    /// operation waits for the session to come back.
    pub connect_timeout: Duration,
    /// Retry policy for operations and for resuming a suspended session.
    pub retry_policy: RetryPolicy,
    /// Bound on the whole of a single operation, retries included.
    pub operation_timeout: Option<Duration>,
    /// Buffer operations issued while not connected instead of failing them with
    /// `ConnectionLoss`.
    pub queue_while_disconnected: bool,
    /// Number of tasks running background callbacks.
    pub callback_workers: usize,
    /// Number of callbacks that may wait for a worker before completions apply backpressure.
    pub callback_queue: usize,
    /// Where the client logs to.
    pub logger: slog::Logger,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoints: Vec::new(),
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(3),
            retry_policy: RetryPolicy::default(),
            operation_timeout: None,
            queue_while_disconnected: false,
            callback_workers: 4,
            callback_queue: 64,
            logger: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }
}

/// Splits a connect string such as `"zk1:2181,zk2:2181"` into its endpoints.
pub fn parse_connect_string(connect: &str) -> Result<Vec<String>, Error> {
    let invalid = |msg: String| Error::new(Operation::Connect, connect, ErrorKind::BadArguments(msg));

    let mut endpoints = Vec::new();
    for endpoint in connect.split(',').map(str::trim) {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("endpoint {:?} has no port", endpoint)))?;
        if host.is_empty() {
            return Err(invalid(format!("endpoint {:?} has no host", endpoint)));
        }
        if port.parse::<u16>().is_err() {
            return Err(invalid(format!("endpoint {:?} has an invalid port", endpoint)));
        }
        endpoints.push(endpoint.to_string());
    }
    Ok(endpoints)
}
