//! Events and contexts announced by the socket engines.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::queue::QueueContext;
use outrigger_core::shutdown::ShutdownOrigin;
use outrigger_core::transport::{Handle, Token};

use crate::compress::CompressionContext;

/// Whether a completion succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Complete,
    Error,
}

/// The condition a read queue event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadQueueEventKind {
    FlowControlRelaxed,
    FlowControlApplied,
    LowWatermark,
    HighWatermark,
    Discarded,
    RateLimitApplied,
    RateLimitRelaxed,
}

/// A read queue condition with the queue snapshot that caused it.
#[derive(Debug, Clone, Copy)]
pub struct ReadQueueEvent {
    pub kind: ReadQueueEventKind,
    pub context: QueueContext,
}

/// The condition a write queue event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteQueueEventKind {
    FlowControlRelaxed,
    FlowControlApplied,
    LowWatermark,
    HighWatermark,
    Discarded,
    RateLimitApplied,
    RateLimitRelaxed,
}

/// A write queue condition with the queue snapshot that caused it.
#[derive(Debug, Clone, Copy)]
pub struct WriteQueueEvent {
    pub kind: WriteQueueEventKind,
    pub context: QueueContext,
}

/// The stage a shutdown event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEventKind {
    /// The shutdown sequence has begun.
    Initiated,
    /// The send direction transitioned.
    Send,
    /// The receive direction transitioned.
    Receive,
    /// Both directions have completed.
    Complete,
}

/// A shutdown stage with its origin.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownEvent {
    pub kind: ShutdownEventKind,
    pub origin: ShutdownOrigin,
}

/// A transport failure announcement.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent {
    pub error: Error,
}

/// Completion of one send request.
#[derive(Debug)]
pub struct SendEvent {
    pub kind: CompletionKind,
    pub context: SendContext,
    pub error: Option<Error>,
}

/// Identity and accounting of one send request.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    /// The queue entry identifier assigned at admission.
    pub id: u64,
    /// The caller's cancellation token, if one was supplied.
    pub token: Option<Token>,
    /// Bytes handed to the dispatcher, after any compression.
    pub bytes_sent: usize,
    /// Accounting of the deflate pass, when compression ran.
    pub compression: Option<CompressionContext>,
}

/// Completion of one receive request.
#[derive(Debug)]
pub struct ReceiveEvent {
    pub kind: CompletionKind,
    pub context: ReceiveContext,
    /// The payload on success; `None` on error or end-of-file.
    pub data: Option<Bytes>,
    pub error: Option<Error>,
}

/// Provenance of one received payload.
#[derive(Debug, Clone, Default)]
pub struct ReceiveContext {
    /// The sender's endpoint, for message-oriented sockets.
    pub endpoint: Option<Endpoint>,
    /// When the payload arrived from the dispatcher.
    pub timestamp: Option<Instant>,
    /// Accounting of the inflate pass, when compression ran.
    pub compression: Option<CompressionContext>,
}

/// Completion of one connect request.
#[derive(Debug)]
pub struct ConnectEvent {
    pub kind: CompletionKind,
    /// The endpoint the socket is now connected to, on success.
    pub endpoint: Option<Endpoint>,
    /// Attempts consumed, counting the successful one.
    pub attempts: u32,
    pub error: Option<Error>,
}

impl SendEvent {
    #[must_use]
    pub fn complete(context: SendContext) -> Self {
        Self {
            kind: CompletionKind::Complete,
            context,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(context: SendContext, error: Error) -> Self {
        Self {
            kind: CompletionKind::Error,
            context,
            error: Some(error),
        }
    }
}

impl ReceiveEvent {
    #[must_use]
    pub fn complete(context: ReceiveContext, data: Bytes) -> Self {
        Self {
            kind: CompletionKind::Complete,
            context,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(context: ReceiveContext, error: Error) -> Self {
        Self {
            kind: CompletionKind::Error,
            context,
            data: None,
            error: Some(error),
        }
    }
}

/// Completion callback of one send request. Invoked exactly once.
pub type SendCallback = Box<dyn FnOnce(SendEvent) + Send>;

/// Completion callback of one receive request. Invoked exactly once.
pub type ReceiveCallback = Box<dyn FnOnce(ReceiveEvent) + Send>;

/// Completion callback of one connect request. Invoked exactly once.
pub type ConnectCallback = Box<dyn FnOnce(ConnectEvent) + Send>;

/// Completion callback of one bind request, carrying the effective source
/// endpoint.
pub type BindCallback = Box<dyn FnOnce(Result<Endpoint>) + Send>;

/// Completion callback of a close request.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Completion callback of a release request, carrying the surrendered
/// handle.
pub type ReleaseCallback = Box<dyn FnOnce(Result<Handle>) + Send>;

/// Completion callback of an upgrade or downgrade request.
pub type SecurityCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion callback of one accept request, carrying the connected
/// stream socket.
pub type AcceptCallback =
    Box<dyn FnOnce(Result<Arc<crate::stream::StreamSocket>>) + Send>;
