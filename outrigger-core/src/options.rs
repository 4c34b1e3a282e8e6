//! Socket and per-operation configuration options.
//!
//! `SocketOptions` configures a socket for its whole lifetime; the smaller
//! option structs configure a single bind, connect, send, receive, accept,
//! or shutdown request.

use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::transport::{Direction, Token};

/// Socket configuration options.
///
/// These options control queue watermarks, buffer sizes, half-open policy,
/// and datagram limits.
///
/// # Examples
///
/// ```
/// use outrigger_core::options::SocketOptions;
///
/// let opts = SocketOptions::default()
///     .with_write_queue_high_watermark(64 * 1024)
///     .with_keep_half_open(true);
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Endpoint to bind to when the socket is opened implicitly.
    ///
    /// - `None` (default): bind on demand to an any-address ephemeral port
    pub source_endpoint: Option<Endpoint>,

    /// Allow rebinding an address in the time-wait state.
    pub reuse_address: bool,

    /// Half-open policy.
    ///
    /// - `false` (default): shutdown of one direction implies the other
    /// - `true`: each direction shuts down independently
    pub keep_half_open: bool,

    /// Write queue low watermark in bytes.
    ///
    /// A low-watermark event is announced when the queue size drops to or
    /// below this mark after previously exceeding it. Default: 0.
    pub write_queue_low_watermark: usize,

    /// Write queue high watermark in bytes.
    ///
    /// A send that would push the queue past this mark is rejected with
    /// would-block and a one-shot high-watermark event. Default: 64 KiB.
    pub write_queue_high_watermark: usize,

    /// Read queue low watermark in bytes. Default: 0.
    ///
    /// Once buffered data has exceeded the high watermark, receives are
    /// submitted again only after the queue drains to this mark.
    pub read_queue_low_watermark: usize,

    /// Read queue high watermark in bytes. Default: 64 KiB.
    ///
    /// When buffered data exceeds this mark the engine stops submitting
    /// receives until the queue drains below the low watermark.
    pub read_queue_high_watermark: usize,

    /// Largest datagram accepted by `send`. Default: 65507 bytes.
    pub max_datagram_size: usize,

    /// Send buffer size requested from the system. Default: 256 KiB.
    pub send_buffer_size: usize,

    /// Receive buffer size requested from the system. Default: 256 KiB.
    pub receive_buffer_size: usize,

    /// Size of each receive submission handed to the dispatcher.
    /// Default: 8192 bytes.
    pub receive_chunk_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            source_endpoint: None,
            reuse_address: false,
            keep_half_open: false,
            write_queue_low_watermark: 0,
            write_queue_high_watermark: 64 * 1024,
            read_queue_low_watermark: 0,
            read_queue_high_watermark: 64 * 1024,
            max_datagram_size: 65507,
            send_buffer_size: 256 * 1024,
            receive_buffer_size: 256 * 1024,
            receive_chunk_size: 8192,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source endpoint used by implicit binds.
    #[must_use]
    pub fn with_source_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.source_endpoint = Some(endpoint);
        self
    }

    /// Enable or disable address reuse.
    #[must_use]
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Enable or disable the half-open policy.
    #[must_use]
    pub fn with_keep_half_open(mut self, enabled: bool) -> Self {
        self.keep_half_open = enabled;
        self
    }

    /// Set the write queue low watermark.
    #[must_use]
    pub fn with_write_queue_low_watermark(mut self, bytes: usize) -> Self {
        self.write_queue_low_watermark = bytes;
        self
    }

    /// Set the write queue high watermark.
    #[must_use]
    pub fn with_write_queue_high_watermark(mut self, bytes: usize) -> Self {
        self.write_queue_high_watermark = bytes;
        self
    }

    /// Set the read queue low watermark.
    #[must_use]
    pub fn with_read_queue_low_watermark(mut self, bytes: usize) -> Self {
        self.read_queue_low_watermark = bytes;
        self
    }

    /// Set the read queue high watermark.
    #[must_use]
    pub fn with_read_queue_high_watermark(mut self, bytes: usize) -> Self {
        self.read_queue_high_watermark = bytes;
        self
    }

    /// Set the maximum datagram size.
    #[must_use]
    pub fn with_max_datagram_size(mut self, bytes: usize) -> Self {
        self.max_datagram_size = bytes;
        self
    }

    /// Set the send buffer size.
    #[must_use]
    pub fn with_send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    /// Set the receive buffer size.
    #[must_use]
    pub fn with_receive_buffer_size(mut self, bytes: usize) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    /// Set the receive submission chunk size.
    #[must_use]
    pub fn with_receive_chunk_size(mut self, bytes: usize) -> Self {
        self.receive_chunk_size = bytes;
        self
    }
}

/// Options for a single bind request.
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Allow rebinding an address in the time-wait state.
    pub reuse_address: bool,
}

impl BindOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }
}

/// Options for a single connect request.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Number of additional attempts after the first fails. Default: 0.
    pub retry_count: u32,

    /// Initial pause between attempts. Default: 1 second.
    ///
    /// Use with `retry_interval_max` for exponential backoff.
    pub retry_interval: Duration,

    /// Maximum pause between attempts for exponential backoff.
    ///
    /// - Default: 0 (no maximum, use `retry_interval` always)
    /// - When > 0: doubles `retry_interval` per attempt up to this value
    pub retry_interval_max: Duration,

    /// Deadline for each individual attempt.
    pub attempt_deadline: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_interval: Duration::from_secs(1),
            retry_interval_max: Duration::ZERO, // No maximum
            attempt_deadline: None,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the maximum retry interval for exponential backoff.
    #[must_use]
    pub fn with_retry_interval_max(mut self, max: Duration) -> Self {
        self.retry_interval_max = max;
        self
    }

    #[must_use]
    pub fn with_attempt_deadline(mut self, deadline: Duration) -> Self {
        self.attempt_deadline = Some(deadline);
        self
    }

    /// Get the pause before the next attempt with exponential backoff.
    ///
    /// Returns the interval to use after `attempt` failed attempts,
    /// considering exponential backoff and the maximum interval setting.
    #[must_use]
    pub fn next_retry_interval(&self, attempt: u32) -> Duration {
        if self.retry_interval_max.is_zero() {
            // No exponential backoff, always use base interval
            return self.retry_interval;
        }

        // Calculate exponential backoff: base * 2^attempt
        let backoff = self
            .retry_interval
            .saturating_mul(2u32.saturating_pow(attempt));

        // Cap at maximum interval
        backoff.min(self.retry_interval_max)
    }
}

/// Options for a single send request.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Token by which the pending send may be cancelled.
    pub token: Option<Token>,

    /// Destination endpoint; required unless the socket has a default
    /// remote endpoint.
    pub endpoint: Option<Endpoint>,

    /// Deadline after which a still-queued send completes with would-block.
    pub deadline: Option<Instant>,

    /// Overriding high watermark for this request's admission check.
    pub high_watermark: Option<usize>,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_high_watermark(mut self, bytes: usize) -> Self {
        self.high_watermark = Some(bytes);
        self
    }
}

/// Options for a single receive request.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Token by which the pending receive may be cancelled.
    pub token: Option<Token>,

    /// Deadline after which a still-pending receive completes with
    /// would-block.
    pub deadline: Option<Instant>,

    /// Minimum bytes before a stream receive completes. Default: 1.
    ///
    /// Ignored by datagram sockets, which always deliver whole messages.
    pub min_size: usize,

    /// Maximum bytes delivered to a stream receive. Default: `usize::MAX`.
    pub max_size: usize,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            token: None,
            deadline: None,
            min_size: 1,
            max_size: usize::MAX,
        }
    }
}

impl ReceiveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_min_size(mut self, bytes: usize) -> Self {
        self.min_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }
}

/// The urgency of a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Transition at once, discarding queued writes.
    Immediate,
    /// Drain queued writes first; the transition is marked by a sentinel
    /// entry at the back of the write queue.
    Graceful,
}

/// Options for a single shutdown request.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOptions {
    pub direction: Direction,
    pub mode: ShutdownMode,
}

impl ShutdownOptions {
    #[must_use]
    pub const fn new(direction: Direction, mode: ShutdownMode) -> Self {
        Self { direction, mode }
    }
}

/// Options for a single accept request.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Token by which the pending accept may be cancelled.
    pub token: Option<Token>,

    /// Deadline after which a still-pending accept completes with
    /// would-block.
    pub deadline: Option<Instant>,
}

impl AcceptOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = SocketOptions::default();
        assert!(opts.source_endpoint.is_none());
        assert!(!opts.keep_half_open);
        assert_eq!(opts.write_queue_high_watermark, 64 * 1024);
        assert_eq!(opts.max_datagram_size, 65507);
    }

    #[test]
    fn test_builder_pattern() {
        let opts = SocketOptions::new()
            .with_write_queue_high_watermark(1024)
            .with_read_queue_low_watermark(16)
            .with_keep_half_open(true);

        assert_eq!(opts.write_queue_high_watermark, 1024);
        assert_eq!(opts.read_queue_low_watermark, 16);
        assert!(opts.keep_half_open);
    }

    #[test]
    fn test_receive_defaults() {
        let opts = ReceiveOptions::default();
        assert_eq!(opts.min_size, 1);
        assert_eq!(opts.max_size, usize::MAX);
    }

    #[test]
    fn test_connect_retry_exponential_backoff() {
        let opts = ConnectOptions::new()
            .with_retry_interval(Duration::from_millis(100))
            .with_retry_interval_max(Duration::from_secs(10));

        // First retry: base interval
        assert_eq!(opts.next_retry_interval(0), Duration::from_millis(100));

        // Second retry: doubled
        assert_eq!(opts.next_retry_interval(1), Duration::from_millis(200));

        // Third retry: doubled again
        assert_eq!(opts.next_retry_interval(2), Duration::from_millis(400));

        // Eventually caps at 10s
        assert_eq!(opts.next_retry_interval(10), Duration::from_secs(10));
    }

    #[test]
    fn test_connect_retry_no_backoff_by_default() {
        let opts = ConnectOptions::new().with_retry_interval(Duration::from_millis(100));
        // retry_interval_max is 0 by default

        // Always returns base interval
        assert_eq!(opts.next_retry_interval(0), Duration::from_millis(100));
        assert_eq!(opts.next_retry_interval(1), Duration::from_millis(100));
        assert_eq!(opts.next_retry_interval(10), Duration::from_millis(100));
    }
}
