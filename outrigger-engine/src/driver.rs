//! The dispatcher interface the engine consumes.
//!
//! A [`Driver`] demultiplexes I/O for many sockets: the engine submits
//! sends, receives, connects, and accepts, and the driver delivers
//! completions back through the socket's [`DriverSocket`] methods. The
//! driver also creates the strands and timers the engine dispatches with.
//! The engine never touches an OS descriptor directly; the [`SocketFactory`]
//! half of the interface performs handle-level operations on its behalf.
//!
//! The engine assumes concurrent completions against different sockets but
//! serialized completions against any one socket.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::strand::{Executor, Functor, Strand};
use outrigger_core::timer::Timer;
use outrigger_core::transport::{Direction, Handle, Transport};

/// Data delivered by a receive completion.
#[derive(Debug, Clone)]
pub struct ReceivedData {
    /// The bytes read.
    pub data: Bytes,
    /// The source endpoint, for message-oriented sockets.
    pub endpoint: Option<Endpoint>,
}

/// Options for one send submission.
#[derive(Debug, Clone, Default)]
pub struct DriverSendOptions {
    /// Destination, for message-oriented sockets without a default remote.
    pub endpoint: Option<Endpoint>,
}

/// Options for one receive submission.
#[derive(Debug, Clone)]
pub struct DriverReceiveOptions {
    /// Largest transfer the engine will accept for this submission.
    pub max_size: usize,
}

impl Default for DriverReceiveOptions {
    fn default() -> Self {
        Self { max_size: 8192 }
    }
}

/// Completion surface of one socket.
///
/// The driver invokes these after the corresponding submission finishes.
/// No method is invoked after the detach acknowledgement has been
/// delivered through [`process_socket_detached`](Self::process_socket_detached).
pub trait DriverSocket: Send + Sync {
    /// The handle this socket is attached with.
    fn handle(&self) -> Option<Handle>;

    /// An asynchronous connect finished.
    fn process_socket_connected(&self, _result: Result<()>) {}

    /// An accept submission produced a connected handle and its peer.
    fn process_socket_accepted(&self, _result: Result<(Handle, Endpoint)>) {}

    /// A send submission finished; on success carries the bytes written.
    fn process_socket_sent(&self, result: Result<usize>);

    /// A receive submission finished.
    fn process_socket_received(&self, result: Result<ReceivedData>);

    /// The transport failed outside any submission.
    fn process_socket_error(&self, error: Error);

    /// The driver acknowledges detachment; no further completions arrive.
    fn process_socket_detached(&self);
}

/// Handle-level socket operations.
///
/// These complete synchronously against the system (or the simulation);
/// asynchronous work goes through [`Driver`].
pub trait SocketFactory: Send + Sync {
    /// Acquire a socket of `transport` in non-blocking mode.
    fn open_socket(&self, transport: Transport) -> Result<Handle>;

    /// Bind `handle` and return the effective source endpoint.
    fn bind_socket(
        &self,
        handle: Handle,
        endpoint: &Endpoint,
        reuse_address: bool,
    ) -> Result<Endpoint>;

    /// Set the default remote endpoint of a message-oriented socket.
    fn connect_socket(&self, handle: Handle, endpoint: &Endpoint) -> Result<()>;

    /// Mark `handle` as a passive socket with the given backlog.
    fn listen_socket(&self, handle: Handle, backlog: usize) -> Result<()>;

    /// Shut down one or both directions of `handle`.
    fn shutdown_socket(&self, handle: Handle, direction: Direction) -> Result<()>;

    /// Close `handle`, returning it to the pool.
    fn close_socket(&self, handle: Handle) -> Result<()>;

    /// The endpoint `handle` is bound to.
    fn source_endpoint(&self, handle: Handle) -> Result<Endpoint>;

    /// The endpoint `handle` is connected to.
    fn remote_endpoint(&self, handle: Handle) -> Result<Endpoint>;

    /// Set the send buffer size of `handle`.
    fn set_send_buffer_size(&self, handle: Handle, size: usize) -> Result<()>;

    /// Set the receive buffer size of `handle`.
    fn set_receive_buffer_size(&self, handle: Handle, size: usize) -> Result<()>;
}

/// An event demultiplexer accepting I/O submissions and delivering
/// completions.
pub trait Driver: SocketFactory {
    /// Register `socket` so completions can be delivered to it.
    fn attach_socket(&self, socket: Arc<dyn DriverSocket>) -> Result<()>;

    /// Begin removing `handle` from the observation set.
    ///
    /// The driver acknowledges through `process_socket_detached`; in-flight
    /// completions are delivered or dropped before the acknowledgement.
    fn detach_socket(&self, handle: Handle) -> Result<()>;

    /// Submit an asynchronous connect of `handle` to `endpoint`.
    fn connect(&self, handle: Handle, endpoint: &Endpoint) -> Result<()>;

    /// Submit an asynchronous accept on the passive socket `handle`.
    fn accept(&self, handle: Handle) -> Result<()>;

    /// Submit `data` for transmission on `handle`.
    fn send(&self, handle: Handle, data: Bytes, options: &DriverSendOptions) -> Result<()>;

    /// Submit a receive on `handle`.
    fn receive(&self, handle: Handle, options: &DriverReceiveOptions) -> Result<()>;

    /// Request that pending submissions on `handle` complete with
    /// `Cancelled`.
    fn cancel(&self, handle: Handle) -> Result<()>;

    /// Create a serial executor over this driver's threads.
    fn create_strand(&self) -> Arc<Strand>;

    /// Schedule `callback` for `deadline`.
    fn create_timer(&self, deadline: Instant, callback: Functor) -> Timer;

    /// Run `f` on this driver's threads.
    fn execute(&self, f: Functor);

    /// The executor announcements fall back to when no strand is given.
    fn executor(&self) -> Arc<dyn Executor>;

    /// The number of threads delivering completions.
    fn max_threads(&self) -> usize;
}
