//! Error taxonomy for the crawling runtime.
//!
//! Each fallible subsystem gets its own `thiserror` enum; [`CrawlerError`]
//! composes the ones that can reject the top-level `run()` future. Handler
//! and per-attempt errors (`CrawlError`) never reject `run()` on their own —
//! they are funneled into the retry pipeline by `crawler.rs`.

use thiserror::Error;

/// Outcome of a single request attempt, as seen by the dispatch loop.
///
/// This is the "tagged result type" the crawler's retry dispatcher switches
/// on, replacing exceptions-as-control-flow for retries.
#[derive(Error, Debug, Clone)]
pub enum CrawlError {
    /// Network-level failure of a single attempt. Recoverable by retry.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The user handler exceeded `requestHandlerTimeoutSecs`. Treated
    /// identically to `TransientTransport` by the retry dispatcher.
    #[error("request handler timed out")]
    HandlerTimeout,

    /// Status code observed is in the session pool's blocked set.
    #[error("blocked by server (status {0})")]
    BlockedByServer(u16),

    /// `req.noRetry` was set, or the handler explicitly signalled
    /// permanence. Terminal; no further attempts.
    #[error("permanent failure, no retry: {0}")]
    PermanentNoRetry(String),

    /// Non-fatal input-shape problem (invalid URL, invalid cookie string).
    /// The offending input is dropped and logged, not retried.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The request carries a label with no registered handler, and no
    /// default handler is registered either.
    #[error("no route registered for label: {0}")]
    MissingRoute(String),
}

impl CrawlError {
    /// Whether this error terminal-fails the request rather than being
    /// eligible for another attempt, independent of `retryCount`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlError::PermanentNoRetry(_) | CrawlError::MissingRoute(_)
        )
    }

    /// Whether observing this error should retire the owning session.
    pub fn retires_session(&self) -> bool {
        matches!(self, CrawlError::BlockedByServer(_))
    }
}

/// Errors surfaced by the durable request queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// No progress observed for longer than `CRAWLEE_INTERNAL_TIMEOUT`.
    /// Recovered internally by the auto-reset sweep; this variant exists
    /// for logging/metrics and never escapes `request_queue.rs`.
    #[error("queue stalled: no progress within internal timeout")]
    Stalled,

    #[error("queue storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by the session pool.
#[derive(Error, Debug)]
pub enum SessionPoolError {
    /// `getSession()` exhausted its retry budget without finding or
    /// constructing a usable session.
    #[error("no usable session available")]
    NoUsableSession,

    #[error("session pool storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("session pool serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration errors, descriptive and raised at construction time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("unrecognized configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },

    #[error("{field} must satisfy: {constraint}")]
    InvalidCombination { field: String, constraint: String },
}

/// Errors that can reject the crawler's top-level `run()` future.
///
/// Per §7's propagation policy: handler errors never reach here. Only pool
/// machinery failures and invalid configuration reject `run()`.
#[derive(Error, Debug)]
pub enum CrawlerError {
    /// An exception propagated out of the pool's own machinery (not a
    /// task's handler) — e.g. a panicked task join, a poisoned lock.
    #[error("pool fatal error: {0}")]
    PoolFatal(String),

    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(#[from] ConfigError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("session pool error: {0}")]
    SessionPool(#[from] SessionPoolError),
}
