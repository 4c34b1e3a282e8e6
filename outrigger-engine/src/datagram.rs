//! The datagram socket engine.
//!
//! A `DatagramSocket` mediates user send/receive/shutdown requests against
//! the dispatcher for a connectionless socket. Requests that cannot be
//! satisfied immediately are queued; completions from the dispatcher mutate
//! the queues and state under the socket mutex and announce events through
//! the dispatch rule.
//!
//! Announcements may run inline, dropping and retaking the socket mutex.
//! Internal code therefore re-reads state after every announce window and
//! never assumes an earlier check still holds across one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use outrigger_core::detach::{DetachGoal, DetachState};
use outrigger_core::dispatch;
use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::flow::FlowControlState;
use outrigger_core::limiter::RateLimiter;
use outrigger_core::options::{
    BindOptions, ReceiveOptions, SendOptions, ShutdownMode, SocketOptions,
};
use outrigger_core::queue::{
    ReadQueue, ReadQueueEntry, ReceiveCallbackEntry, WriteQueue, WriteQueueEntry,
};
use outrigger_core::shutdown::{ShutdownContext, ShutdownOrigin, ShutdownState};
use outrigger_core::strand::{Executor, Functor, Strand};
use outrigger_core::timer::Timer;
use outrigger_core::transport::{Direction, Handle, Token, Transport};

use crate::compress::{Compression, CompressionContext, DeflateOptions, InflateOptions};
use crate::driver::{
    Driver, DriverReceiveOptions, DriverSendOptions, DriverSocket, ReceivedData,
};
use crate::event::{
    BindCallback, CloseCallback, CompletionKind, ConnectCallback, ConnectEvent, ErrorEvent,
    ReadQueueEvent, ReadQueueEventKind, ReceiveCallback, ReceiveContext, ReceiveEvent,
    ReleaseCallback, SendCallback, SendContext, SendEvent, ShutdownEvent, ShutdownEventKind,
    WriteQueueEvent, WriteQueueEventKind,
};
use crate::resolver::{GetEndpointOptions, Resolver};
use crate::session::{DatagramSocketManager, DatagramSocketSession};

struct State {
    transport: Option<Transport>,
    handle: Option<Handle>,
    source_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,

    write_queue: WriteQueue<SendCallback>,
    read_queue: ReadQueue<ReceiveCallback>,
    // Inflate accounting per buffered entry, in lockstep with the read
    // queue's data FIFO.
    read_contexts: VecDeque<Option<CompressionContext>>,
    flow: FlowControlState,
    shutdown: ShutdownState,
    detach: DetachState,

    send_pending: bool,
    receive_pending: bool,

    send_rate_limiter: Option<Arc<dyn RateLimiter>>,
    receive_rate_limiter: Option<Arc<dyn RateLimiter>>,
    send_rate_timer: Option<Timer>,
    receive_rate_timer: Option<Timer>,

    resolver: Option<Arc<dyn Resolver>>,
    compression: Option<Arc<dyn Compression>>,
    session: Option<Arc<dyn DatagramSocketSession>>,
    session_strand: Option<Arc<Strand>>,
    manager: Option<Arc<dyn DatagramSocketManager>>,
    manager_strand: Option<Arc<Strand>>,

    deferred: Vec<Functor>,
    release_callback: Option<ReleaseCallback>,
    closed: bool,
}

type Guard<'a> = MutexGuard<'a, State>;

/// State machine for one connectionless socket.
pub struct DatagramSocket {
    driver: Arc<dyn Driver>,
    executor: Arc<dyn Executor>,
    options: SocketOptions,
    weak_self: Weak<DatagramSocket>,
    state: Mutex<State>,
}

impl DatagramSocket {
    /// Create an unopened socket over `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn Driver>, options: SocketOptions) -> Arc<Self> {
        let executor = driver.executor();
        Arc::new_cyclic(|weak_self| Self {
            driver,
            executor,
            weak_self: weak_self.clone(),
            state: Mutex::new(State {
                transport: None,
                handle: None,
                source_endpoint: None,
                remote_endpoint: None,
                write_queue: WriteQueue::new(
                    options.write_queue_low_watermark,
                    options.write_queue_high_watermark,
                ),
                read_queue: ReadQueue::new(
                    options.read_queue_low_watermark,
                    options.read_queue_high_watermark,
                ),
                read_contexts: VecDeque::new(),
                flow: FlowControlState::new(),
                shutdown: ShutdownState::new(),
                detach: DetachState::new(),
                send_pending: false,
                receive_pending: false,
                send_rate_limiter: None,
                receive_rate_limiter: None,
                send_rate_timer: None,
                receive_rate_timer: None,
                resolver: None,
                compression: None,
                session: None,
                session_strand: None,
                manager: None,
                manager_strand: None,
                deferred: Vec::new(),
                release_callback: None,
                closed: false,
            }),
            options,
        })
    }

    /// Promote the engine's weak self-reference; completion closures hold
    /// the resulting strong reference until they finish.
    fn retain(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    // === Accessors ===

    /// The attached handle, if the socket is open.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.state.lock().handle
    }

    /// The transport the socket was opened with.
    #[must_use]
    pub fn transport(&self) -> Option<Transport> {
        self.state.lock().transport
    }

    /// The endpoint the socket is bound to.
    #[must_use]
    pub fn source_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().source_endpoint.clone()
    }

    /// The default remote endpoint, if `connect` assigned one.
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().remote_endpoint.clone()
    }

    // === Registration ===

    /// Register the session observing this socket's events, optionally
    /// pinned to a strand.
    pub fn register_session(
        &self,
        session: Arc<dyn DatagramSocketSession>,
        strand: Option<Arc<Strand>>,
    ) {
        let mut state = self.state.lock();
        state.session = Some(session);
        state.session_strand = strand;
    }

    /// Deregister the session.
    pub fn deregister_session(&self) {
        let mut state = self.state.lock();
        state.session = None;
        state.session_strand = None;
    }

    /// Register the manager observing this socket's lifecycle.
    pub fn register_manager(
        &self,
        manager: Arc<dyn DatagramSocketManager>,
        strand: Option<Arc<Strand>>,
    ) {
        let mut state = self.state.lock();
        state.manager = Some(manager);
        state.manager_strand = strand;
    }

    /// Deregister the manager.
    pub fn deregister_manager(&self) {
        let mut state = self.state.lock();
        state.manager = None;
        state.manager_strand = None;
    }

    /// Register the resolver consulted by the by-name operations.
    pub fn register_resolver(&self, resolver: Arc<dyn Resolver>) {
        self.state.lock().resolver = Some(resolver);
    }

    /// Deregister the resolver.
    pub fn deregister_resolver(&self) {
        self.state.lock().resolver = None;
    }

    /// Register a compression capability; payloads are deflated on send
    /// and inflated on receive from now on.
    pub fn register_compression(&self, compression: Arc<dyn Compression>) {
        self.state.lock().compression = Some(compression);
    }

    /// Deregister the compression capability.
    pub fn deregister_compression(&self) {
        self.state.lock().compression = None;
    }

    /// Set the limiter governing outbound bandwidth.
    pub fn set_send_rate_limiter(&self, limiter: Arc<dyn RateLimiter>) {
        self.state.lock().send_rate_limiter = Some(limiter);
    }

    /// Set the limiter governing inbound bandwidth.
    pub fn set_receive_rate_limiter(&self, limiter: Arc<dyn RateLimiter>) {
        self.state.lock().receive_rate_limiter = Some(limiter);
    }

    /// Replace the write queue watermarks.
    pub fn set_write_queue_watermarks(&self, low: usize, high: usize) {
        let mut state = self.state.lock();
        state.write_queue.set_low_watermark(low);
        state.write_queue.set_high_watermark(high);
    }

    /// Replace the read queue watermarks.
    pub fn set_read_queue_watermarks(&self, low: usize, high: usize) {
        let mut state = self.state.lock();
        state.read_queue.set_low_watermark(low);
        state.read_queue.set_high_watermark(high);
    }

    // === Open / bind / connect ===

    /// Acquire a socket of `transport` from the system, bind it to the
    /// configured source endpoint if any, and attach it to the dispatcher.
    ///
    /// Fails with `Invalid` if the socket is already open with a different
    /// transport; reopening with the same transport is a no-op.
    pub fn open(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let state = self.state.lock();
        let state = self.private_open(state, transport, None)?;
        drop(state);
        Ok(())
    }

    /// Adopt `handle`, already open with `transport`, and attach it.
    pub fn open_with_handle(self: &Arc<Self>, transport: Transport, handle: Handle) -> Result<()> {
        let state = self.state.lock();
        let state = self.private_open(state, transport, Some(handle))?;
        drop(state);
        Ok(())
    }

    /// Bind to `endpoint`, opening implicitly if needed.
    pub fn bind(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        options: &BindOptions,
        callback: BindCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }

        if state.handle.is_none() {
            let transport = transport_for(endpoint)?;
            state = self.private_open(state, transport, None)?;
        }

        let handle = state.handle.ok_or(Error::Invalid)?;
        let reuse = options.reuse_address || self.options.reuse_address;
        let bound = self.driver.bind_socket(handle, endpoint, reuse)?;
        state.source_endpoint = Some(bound.clone());

        trace!(handle = handle.as_raw(), endpoint = %bound, "datagram socket bound");

        let state = self.announce(state, None, false, move || callback(Ok(bound)));
        drop(state);
        Ok(())
    }

    /// Resolve `name` and bind to the answer.
    pub fn bind_name(
        self: &Arc<Self>,
        name: &str,
        options: &BindOptions,
        callback: BindCallback,
    ) -> Result<()> {
        let (resolver, transport) = {
            let state = self.state.lock();
            if state.closed || state.detach.initiated() {
                return Err(Error::Invalid);
            }
            (
                state.resolver.clone().ok_or(Error::Invalid)?,
                state.transport,
            )
        };

        let socket = Arc::clone(self);
        let options = options.clone();
        resolver.get_endpoint(
            name,
            GetEndpointOptions {
                transport,
                ..Default::default()
            },
            Box::new(move |result, _context| match result {
                Ok(endpoint) => {
                    if let Err(error) = socket.bind(&endpoint, &options, callback) {
                        debug!(?error, "bind after resolution failed");
                    }
                }
                Err(error) => callback(Err(error)),
            }),
        )
    }

    /// Assign `endpoint` as the default remote endpoint, opening and
    /// binding implicitly if needed.
    ///
    /// For datagram sockets this performs no network activity: it fails
    /// with `Invalid` if `endpoint` is an any-address or carries port
    /// zero, and otherwise completes through `callback`.
    pub fn connect(self: &Arc<Self>, endpoint: &Endpoint, callback: ConnectCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if endpoint.is_any() || endpoint.port() == Some(0) {
            return Err(Error::Invalid);
        }

        if state.handle.is_none() {
            let transport = transport_for(endpoint)?;
            state = self.private_open(state, transport, None)?;
        }
        let handle = state.handle.ok_or(Error::Invalid)?;

        if state.source_endpoint.is_none() {
            // Implicitly bind to an ephemeral port in the peer's domain so
            // a connected socket can immediately transmit. Local sockets
            // have no ephemeral namespace and must bind explicitly.
            let local = match endpoint {
                Endpoint::Ip(addr) if addr.is_ipv4() => Endpoint::loopback_v4(0),
                Endpoint::Ip(_) => Endpoint::loopback_v6(0),
                Endpoint::Local(_) => return Err(Error::Invalid),
            };
            let bound = self
                .driver
                .bind_socket(handle, &local, self.options.reuse_address)?;
            state.source_endpoint = Some(bound);
        }

        self.driver.connect_socket(handle, endpoint)?;
        state.remote_endpoint = Some(endpoint.clone());

        let event = ConnectEvent {
            kind: CompletionKind::Complete,
            endpoint: Some(endpoint.clone()),
            attempts: 1,
            error: None,
        };
        let state = self.announce(state, None, false, move || callback(event));
        drop(state);
        Ok(())
    }

    /// Resolve `name` and assign the answer as the default remote
    /// endpoint.
    pub fn connect_name(self: &Arc<Self>, name: &str, callback: ConnectCallback) -> Result<()> {
        let (resolver, transport) = {
            let state = self.state.lock();
            if state.closed || state.detach.initiated() {
                return Err(Error::Invalid);
            }
            (
                state.resolver.clone().ok_or(Error::Invalid)?,
                state.transport,
            )
        };

        let socket = Arc::clone(self);
        resolver.get_endpoint(
            name,
            GetEndpointOptions {
                transport,
                ..Default::default()
            },
            Box::new(move |result, _context| match result {
                Ok(endpoint) => {
                    if let Err(error) = socket.connect(&endpoint, callback) {
                        debug!(?error, "connect after resolution failed");
                    }
                }
                Err(error) => callback(ConnectEvent {
                    kind: CompletionKind::Error,
                    endpoint: None,
                    attempts: 0,
                    error: Some(error),
                }),
            }),
        )
    }

    // === Send ===

    /// Enqueue `data` for transmission.
    ///
    /// Rejects datagrams larger than the configured maximum with `Invalid`
    /// and, when the write queue already violates the effective high
    /// watermark, rejects with `WouldBlock` after announcing a one-shot
    /// high-watermark event.
    pub fn send(
        self: &Arc<Self>,
        data: Bytes,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() || state.handle.is_none() {
            return Err(Error::Invalid);
        }
        if !state.shutdown.can_send() {
            return Err(Error::Invalid);
        }
        if data.len() > self.options.max_datagram_size {
            return Err(Error::Invalid);
        }
        if options.endpoint.is_none() && state.remote_endpoint.is_none() {
            return Err(Error::Invalid);
        }

        if state.write_queue.high_watermark_violated(options.high_watermark) {
            if state
                .write_queue
                .authorize_high_watermark_event(options.high_watermark)
            {
                let state = self.announce_write_queue_event(
                    state,
                    WriteQueueEventKind::HighWatermark,
                    false,
                );
                drop(state);
            }
            return Err(Error::WouldBlock);
        }

        let mut deflate_context = None;
        let payload = match state.compression.clone() {
            Some(compression) => {
                let mut context = CompressionContext::default();
                let mut output = BytesMut::with_capacity(data.len());
                compression.deflate(&mut context, &mut output, &data, &DeflateOptions::default())?;
                deflate_context = Some(context);
                output.freeze()
            }
            None => data,
        };

        let id = state.write_queue.next_id();
        let timer = options.deadline.map(|deadline| {
            let socket = Arc::clone(self);
            self.driver
                .create_timer(deadline, Box::new(move || socket.process_send_deadline(id)))
        });

        let length = payload.len();
        state.write_queue.push(WriteQueueEntry {
            id,
            token: options.token,
            endpoint: options.endpoint.clone(),
            data: Some(payload),
            length,
            timestamp: Instant::now(),
            deadline: options.deadline,
            timer,
            callback: callback.map(|callback| {
                // Carry the deflate accounting into the completion event.
                Box::new(move |mut event: SendEvent| {
                    event.context.compression = deflate_context;
                    callback(event);
                }) as SendCallback
            }),
        });

        let state = self.private_relax_send_flow(state);
        drop(state);
        Ok(())
    }

    /// Cancel the pending send identified by `token`.
    ///
    /// A still-queued entry completes with `Cancelled` immediately; an
    /// entry already submitted to the dispatcher is cancelled there and
    /// completes when the dispatcher confirms.
    pub fn cancel_send(self: &Arc<Self>, token: Token) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Invalid);
        }

        let head_in_flight = state.send_pending
            && state
                .write_queue
                .front()
                .is_some_and(|front| front.token == Some(token));
        if head_in_flight {
            let handle = state.handle.ok_or(Error::Invalid)?;
            drop(state);
            return self.driver.cancel(handle);
        }

        match state.write_queue.remove_by_token(token) {
            Some((entry, _)) => {
                let state = self.complete_send_entry(state, entry, Err(Error::Cancelled));
                let state = self.announce_write_watermarks(state);
                drop(state);
                Ok(())
            }
            None => Err(Error::Invalid),
        }
    }

    // === Receive ===

    /// Request one datagram.
    ///
    /// If a buffered datagram is available and no earlier request is
    /// waiting, the callback completes immediately; otherwise the request
    /// is queued with its optional deadline. Fails synchronously with
    /// `Eof` once shutdown-receive has completed and the queue is empty.
    pub fn receive(
        self: &Arc<Self>,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() || state.handle.is_none() {
            return Err(Error::Invalid);
        }
        if !state.shutdown.can_receive() && !state.read_queue.has_entries() {
            return Err(Error::Eof);
        }

        if state.read_queue.has_entries() && !state.read_queue.has_callbacks() {
            let entry = state.read_queue.pop_entry().expect("checked has_entries");
            let compression = state.read_contexts.pop_front().flatten();
            let event = ReceiveEvent::complete(
                ReceiveContext {
                    endpoint: entry.endpoint,
                    timestamp: Some(entry.timestamp),
                    compression,
                },
                entry.data,
            );
            let state = self.announce(state, None, false, move || callback(event));
            let state = self.announce_read_watermarks(state);
            let state = self.private_initiate_receive(state);
            drop(state);
            return Ok(());
        }

        let timer = options.deadline.map(|deadline| {
            let socket = Arc::clone(self);
            let armed = Arc::new(AtomicU64::new(0));
            let marker = Arc::clone(&armed);
            let timer = self.driver.create_timer(
                deadline,
                Box::new(move || socket.process_receive_deadline(&marker)),
            );
            // Store-before-unlock: the deadline path reads the id under
            // this socket's mutex, which the caller still holds.
            armed.store(timer.id(), Ordering::SeqCst);
            timer
        });

        state.read_queue.push_callback(ReceiveCallbackEntry {
            token: options.token,
            deadline: options.deadline,
            timer,
            min_size: options.min_size,
            max_size: options.max_size,
            callback,
        });

        let state = self.private_relax_receive_flow(state);
        drop(state);
        Ok(())
    }

    /// Cancel the pending receive identified by `token`.
    pub fn cancel_receive(self: &Arc<Self>, token: Token) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Invalid);
        }
        match state.read_queue.remove_callback(token) {
            Some((entry, _)) => {
                let state = self.fail_receive_entry(state, entry, Error::Cancelled);
                drop(state);
                Ok(())
            }
            None => Err(Error::Invalid),
        }
    }

    // === Shutdown / release / close ===

    /// Shut down one or both directions.
    ///
    /// A graceful send shutdown on a non-empty write queue enqueues a
    /// sentinel entry and transitions when the queue drains to it; an
    /// immediate shutdown transitions at once, discarding queued writes.
    pub fn shutdown(self: &Arc<Self>, direction: Direction, mode: ShutdownMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Invalid);
        }

        if direction.includes_send() && state.shutdown.can_send() {
            if mode == ShutdownMode::Graceful && !state.write_queue.is_empty() {
                let id = state.write_queue.next_id();
                state.write_queue.push(WriteQueueEntry {
                    id,
                    token: None,
                    endpoint: None,
                    data: None,
                    length: 0,
                    timestamp: Instant::now(),
                    deadline: None,
                    timer: None,
                    callback: None,
                });
                state = self.private_relax_send_flow(state);
            } else {
                state = self.private_shutdown_send(state, ShutdownOrigin::Source);
            }
        }

        if direction.includes_receive() {
            state = self.private_shutdown_receive(state, ShutdownOrigin::Source);
        }

        drop(state);
        Ok(())
    }

    /// Detach the socket from the engine without closing the descriptor.
    ///
    /// Pending operations complete with `Cancelled`; once the dispatcher
    /// confirms detachment the caller receives the handle.
    pub fn release(self: &Arc<Self>, callback: ReleaseCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        let handle = state.handle.ok_or(Error::Invalid)?;

        state = self.cancel_all_pending(state);
        state.flow.close();
        state.release_callback = Some(callback);
        state.detach.initiate(DetachGoal::Export)?;
        let _ = self.driver.cancel(handle);
        self.driver.detach_socket(handle)?;
        drop(state);
        Ok(())
    }

    /// Fully shut down, detach, and close the descriptor.
    ///
    /// The callback runs after the dispatcher confirms detachment. Closing
    /// an already-closed socket invokes the callback synchronously.
    pub fn close(self: &Arc<Self>, callback: CloseCallback) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            callback();
            return;
        }

        state.deferred.push(Box::new(callback));

        if state.detach.initiated() {
            // A close or release is already in flight; this callback
            // drains with the detach acknowledgement.
            drop(state);
            return;
        }

        state.detach.set_goal(DetachGoal::Close);
        if state.shutdown.can_send() || state.shutdown.can_receive() {
            state = self.private_shutdown_send(state, ShutdownOrigin::Source);
            state = self.private_shutdown_receive(state, ShutdownOrigin::Source);
            drop(state);
        } else {
            let state = self.private_finish_close(state);
            drop(state);
        }
    }

    // === Private: open ===

    fn private_open<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        transport: Transport,
        adopt: Option<Handle>,
    ) -> std::result::Result<Guard<'a>, Error> {
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if let Some(existing) = state.transport {
            if existing != transport {
                return Err(Error::Invalid);
            }
            if state.handle.is_some() {
                return Ok(state);
            }
        }

        let handle = match adopt {
            Some(handle) => handle,
            None => self.driver.open_socket(transport)?,
        };
        self.driver
            .set_send_buffer_size(handle, self.options.send_buffer_size)?;
        self.driver
            .set_receive_buffer_size(handle, self.options.receive_buffer_size)?;

        state.transport = Some(transport);
        state.handle = Some(handle);

        if adopt.is_some() {
            state.source_endpoint = self.driver.source_endpoint(handle).ok();
            state.remote_endpoint = self.driver.remote_endpoint(handle).ok();
        } else if let Some(source) = self.options.source_endpoint.clone() {
            let bound = self
                .driver
                .bind_socket(handle, &source, self.options.reuse_address)?;
            state.source_endpoint = Some(bound);
        }

        self.driver
            .attach_socket(Arc::clone(self) as Arc<dyn DriverSocket>)?;

        debug!(handle = handle.as_raw(), transport = %transport, "datagram socket opened");

        if let Some(manager) = state.manager.clone() {
            let strand = state.manager_strand.clone();
            let socket = Arc::clone(self);
            state = self.announce(state, strand, false, move || {
                manager.process_socket_established(&socket);
            });
        }

        Ok(state)
    }

    // === Private: flow control and submission ===

    fn private_relax_send_flow<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.flow.relax(Direction::Send, false).is_some() {
            state = self.announce_write_queue_event(
                state,
                WriteQueueEventKind::FlowControlRelaxed,
                false,
            );
        }
        self.private_initiate_send(state)
    }

    fn private_relax_receive_flow<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.flow.relax(Direction::Receive, false).is_some() {
            state = self.announce_read_queue_event(
                state,
                ReadQueueEventKind::FlowControlRelaxed,
                false,
            );
        }
        self.private_initiate_receive(state)
    }

    fn private_initiate_send<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        loop {
            if state.send_pending
                || !state.flow.want_send()
                || state.detach.initiated()
                || state.closed
            {
                return state;
            }
            let Some(handle) = state.handle else {
                return state;
            };

            let (is_marker, data, endpoint) = match state.write_queue.front() {
                Some(front) => (
                    front.is_marker(),
                    front.data.clone(),
                    front.endpoint.clone(),
                ),
                None => return state,
            };

            if is_marker {
                state.write_queue.pop_front();
                state = self.private_shutdown_send(state, ShutdownOrigin::Source);
                continue;
            }

            if let Some(limiter) = state.send_rate_limiter.clone() {
                let now = Instant::now();
                if limiter.would_exceed_bandwidth(now) {
                    return self.private_throttle_send(state, &limiter, now);
                }
            }

            let data = data.expect("marker handled above");
            match self
                .driver
                .send(handle, data, &DriverSendOptions { endpoint })
            {
                Ok(()) => {
                    state.send_pending = true;
                    return state;
                }
                Err(Error::WouldBlock) => return state,
                Err(error) => {
                    return self.private_fail(state, error);
                }
            }
        }
    }

    fn private_initiate_receive<'a>(self: &'a Arc<Self>, state: Guard<'a>) -> Guard<'a> {
        let mut state = state;
        if state.receive_pending
            || !state.flow.want_receive()
            || !state.shutdown.can_receive()
            || state.detach.initiated()
            || state.closed
            || state.read_queue.high_watermark_violated()
        {
            return state;
        }
        let Some(handle) = state.handle else {
            return state;
        };

        if let Some(limiter) = state.receive_rate_limiter.clone() {
            let now = Instant::now();
            if limiter.would_exceed_bandwidth(now) {
                return self.private_throttle_receive(state, &limiter, now);
            }
        }

        match self.driver.receive(
            handle,
            &DriverReceiveOptions {
                max_size: self.options.receive_chunk_size,
            },
        ) {
            Ok(()) => {
                state.receive_pending = true;
                state
            }
            Err(Error::WouldBlock) => state,
            Err(error) => self.private_fail(state, error),
        }
    }

    fn private_throttle_send<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        limiter: &Arc<dyn RateLimiter>,
        now: Instant,
    ) -> Guard<'a> {
        if state.send_rate_timer.is_some() {
            return state;
        }
        let _ = state.flow.apply(Direction::Send, false);

        let socket = Arc::clone(self);
        let timer = self.driver.create_timer(
            now + limiter.time_to_submit(now),
            Box::new(move || socket.process_send_rate_timer()),
        );
        state.send_rate_timer = Some(timer);

        self.announce_write_queue_event(state, WriteQueueEventKind::RateLimitApplied, false)
    }

    fn private_throttle_receive<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        limiter: &Arc<dyn RateLimiter>,
        now: Instant,
    ) -> Guard<'a> {
        if state.receive_rate_timer.is_some() {
            return state;
        }
        let _ = state.flow.apply(Direction::Receive, false);

        let socket = Arc::clone(self);
        let timer = self.driver.create_timer(
            now + limiter.time_to_submit(now),
            Box::new(move || socket.process_receive_rate_timer()),
        );
        state.receive_rate_timer = Some(timer);

        self.announce_read_queue_event(state, ReadQueueEventKind::RateLimitApplied, false)
    }

    fn process_send_rate_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.send_rate_timer = None;
        if state.closed {
            return;
        }
        if state.flow.relax(Direction::Send, false).is_some() {
            state = self.announce_write_queue_event(
                state,
                WriteQueueEventKind::RateLimitRelaxed,
                false,
            );
        }
        let state = self.private_initiate_send(state);
        drop(state);
    }

    fn process_receive_rate_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.receive_rate_timer = None;
        if state.closed {
            return;
        }
        if state.flow.relax(Direction::Receive, false).is_some() {
            state = self.announce_read_queue_event(
                state,
                ReadQueueEventKind::RateLimitRelaxed,
                false,
            );
        }
        let state = self.private_initiate_receive(state);
        drop(state);
    }

    // === Private: deadlines ===

    fn process_send_deadline(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        // The head may already be submitted to the dispatcher; its
        // completion owns it, and the deadline is moot.
        let head_in_flight = state.send_pending
            && state.write_queue.front().is_some_and(|front| front.id == id);
        if head_in_flight {
            return;
        }
        if let Some((entry, _)) = state.write_queue.remove_by_id(id) {
            let state = self.complete_send_entry(state, entry, Err(Error::WouldBlock));
            let state = self.announce_write_watermarks(state);
            drop(state);
        }
    }

    fn process_receive_deadline(self: &Arc<Self>, timer_id: &AtomicU64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let id = timer_id.load(Ordering::SeqCst);
        if let Some((entry, _)) = state.read_queue.remove_callback_by_timer(id) {
            let state = self.fail_receive_entry(state, entry, Error::WouldBlock);
            drop(state);
        }
    }

    // === Private: completion plumbing ===

    fn complete_send_entry<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        mut entry: WriteQueueEntry<SendCallback>,
        result: Result<usize>,
    ) -> Guard<'a> {
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        let Some(callback) = entry.callback.take() else {
            return state;
        };
        let context = SendContext {
            id: entry.id,
            token: entry.token,
            bytes_sent: entry.length,
            compression: None,
        };
        let event = match result {
            Ok(bytes_sent) => {
                let mut context = context;
                context.bytes_sent = bytes_sent;
                SendEvent::complete(context)
            }
            Err(error) => SendEvent::failed(context, error),
        };
        self.announce(state, None, false, move || callback(event))
    }

    fn deliver_receive_entry<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        mut request: ReceiveCallbackEntry<ReceiveCallback>,
        data: ReadQueueEntry,
        compression: Option<CompressionContext>,
    ) -> Guard<'a> {
        if let Some(timer) = request.timer.take() {
            timer.cancel();
        }
        let callback = request.callback;
        let event = ReceiveEvent::complete(
            ReceiveContext {
                endpoint: data.endpoint,
                timestamp: Some(data.timestamp),
                compression,
            },
            data.data,
        );
        self.announce(state, None, false, move || callback(event))
    }

    fn fail_receive_entry<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        mut request: ReceiveCallbackEntry<ReceiveCallback>,
        error: Error,
    ) -> Guard<'a> {
        if let Some(timer) = request.timer.take() {
            timer.cancel();
        }
        let callback = request.callback;
        let event = ReceiveEvent::failed(ReceiveContext::default(), error);
        self.announce(state, None, false, move || callback(event))
    }

    /// Match buffered data against pending requests, oldest to oldest.
    fn private_match_receives<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        while state.read_queue.has_entries() && state.read_queue.has_callbacks() {
            let entry = state.read_queue.pop_entry().expect("checked has_entries");
            let compression = state.read_contexts.pop_front().flatten();
            let request = state
                .read_queue
                .pop_callback()
                .expect("checked has_callbacks");
            state = self.deliver_receive_entry(state, request, entry, compression);
        }
        self.announce_read_watermarks(state)
    }

    fn announce_write_watermarks<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.write_queue.authorize_low_watermark_event() {
            state =
                self.announce_write_queue_event(state, WriteQueueEventKind::LowWatermark, false);
        }
        state
    }

    fn announce_read_watermarks<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.read_queue.authorize_low_watermark_event() {
            state = self.announce_read_queue_event(state, ReadQueueEventKind::LowWatermark, false);
        }
        state
    }

    // === Private: shutdown sequence ===

    fn private_shutdown_send<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        origin: ShutdownOrigin,
    ) -> Guard<'a> {
        let keep_half_open = self.options.keep_half_open;
        match state.shutdown.try_shutdown_send(origin, keep_half_open) {
            Some(context) => self.private_shutdown_sequence(state, context),
            None => state,
        }
    }

    fn private_shutdown_receive<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        origin: ShutdownOrigin,
    ) -> Guard<'a> {
        let keep_half_open = self.options.keep_half_open;
        match state.shutdown.try_shutdown_receive(origin, keep_half_open) {
            Some(context) => self.private_shutdown_sequence(state, context),
            None => state,
        }
    }

    fn private_shutdown_sequence<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        context: ShutdownContext,
    ) -> Guard<'a> {
        // Shutdown announcements are always deferred so users observe the
        // sequence in order even when an announcement elsewhere runs
        // inline.
        let defer = true;

        if context.initiated {
            state = self.announce_shutdown_event(
                state,
                ShutdownEventKind::Initiated,
                context.origin,
                defer,
            );
        }

        if context.send {
            let _ = state.flow.apply(Direction::Send, false);
            if let Some(timer) = state.send_rate_timer.take() {
                timer.cancel();
            }

            let cancelled = state.write_queue.drain();
            let had_queued = !cancelled.is_empty();
            for entry in cancelled {
                state = self.complete_send_entry(state, entry, Err(Error::Cancelled));
            }
            if had_queued {
                state =
                    self.announce_write_queue_event(state, WriteQueueEventKind::Discarded, defer);
            }

            if let Some(handle) = state.handle {
                if state.send_pending {
                    let _ = self.driver.cancel(handle);
                }
                let _ = self.driver.shutdown_socket(handle, Direction::Send);
            }

            state =
                self.announce_shutdown_event(state, ShutdownEventKind::Send, context.origin, defer);
        }

        if context.receive {
            let _ = state.flow.apply(Direction::Receive, false);
            if let Some(timer) = state.receive_rate_timer.take() {
                timer.cancel();
            }

            // Every request still pending when shutdown-receive completes
            // is dispatched with end-of-file exactly once.
            let pending = state.read_queue.pop_all_callbacks();
            for entry in pending {
                state = self.fail_receive_entry(state, entry, Error::Eof);
            }

            let discarded = state.read_queue.discard_entries();
            state.read_contexts.clear();
            if discarded > 0 {
                state = self.announce_read_queue_event(state, ReadQueueEventKind::Discarded, defer);
            }

            if let Some(handle) = state.handle {
                if state.receive_pending {
                    let _ = self.driver.cancel(handle);
                }
                let _ = self.driver.shutdown_socket(handle, Direction::Receive);
            }

            state = self.announce_shutdown_event(
                state,
                ShutdownEventKind::Receive,
                context.origin,
                defer,
            );
        }

        if context.completed {
            state = self.announce_shutdown_event(
                state,
                ShutdownEventKind::Complete,
                context.origin,
                defer,
            );
            state.flow.close();

            if let Some(manager) = state.manager.clone() {
                let strand = state.manager_strand.clone();
                let socket = Arc::clone(self);
                state = self.announce(state, strand, defer, move || {
                    manager.process_socket_closed(&socket);
                });
            }

            state = self.private_finish_close(state);
        }

        state
    }

    fn private_finish_close<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.detach.initiated() || state.closed {
            return state;
        }
        match state.handle {
            Some(handle) => {
                let goal = state.detach.goal();
                state
                    .detach
                    .initiate(goal)
                    .expect("detach mode checked idle");
                if self.driver.detach_socket(handle).is_err() {
                    state = self.private_detached(state);
                }
            }
            None => {
                let goal = state.detach.goal();
                state.detach.initiate(goal).ok();
                state = self.private_detached(state);
            }
        }
        state
    }

    fn private_detached<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        let goal = state.detach.complete().unwrap_or(DetachGoal::Close);
        state.closed = true;

        let handle = state.handle.take();
        match goal {
            DetachGoal::Close => {
                if let Some(handle) = handle {
                    let _ = self.driver.close_socket(handle);
                    debug!(handle = handle.as_raw(), "datagram socket closed");
                }
            }
            DetachGoal::Export => {
                if let Some(callback) = state.release_callback.take() {
                    let result = handle.ok_or(Error::Invalid);
                    state = self.announce(state, None, false, move || callback(result));
                }
            }
        }

        // Flush the thunks parked while the detach was in flight: close
        // callbacks and anything else deferred mid-detach.
        let deferred: SmallVec<[Functor; 4]> = state.deferred.drain(..).collect();
        if !deferred.is_empty() {
            state = self.announce(state, None, false, move || {
                for thunk in deferred {
                    thunk();
                }
            });
        }
        state
    }

    fn cancel_all_pending<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        let entries = state.write_queue.drain();
        for entry in entries {
            state = self.complete_send_entry(state, entry, Err(Error::Cancelled));
        }
        let callbacks = state.read_queue.pop_all_callbacks();
        for entry in callbacks {
            state = self.fail_receive_entry(state, entry, Error::Cancelled);
        }
        state.read_queue.discard_entries();
        state.read_contexts.clear();
        state
    }

    fn private_fail<'a>(self: &'a Arc<Self>, mut state: Guard<'a>, error: Error) -> Guard<'a> {
        if state.closed {
            return state;
        }

        if let Some(session) = state.session.clone() {
            let strand = state.session_strand.clone();
            let socket = Arc::clone(self);
            let event = ErrorEvent { error };
            state = self.announce(state, strand, true, move || {
                session.process_error(&socket, &event);
            });
        }

        state = self.private_shutdown_send(state, ShutdownOrigin::Remote);
        self.private_shutdown_receive(state, ShutdownOrigin::Remote)
    }

    // === Private: announcements ===

    fn announce<'a, F>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        strand: Option<Arc<Strand>>,
        defer: bool,
        f: F,
    ) -> Guard<'a>
    where
        F: FnOnce() + Send + 'static,
    {
        dispatch::announce(&self.state, state, strand.as_ref(), &self.executor, defer, f)
    }

    fn announce_write_queue_event<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        kind: WriteQueueEventKind,
        defer: bool,
    ) -> Guard<'a> {
        let Some(session) = state.session.clone() else {
            return state;
        };
        let strand = state.session_strand.clone();
        let event = WriteQueueEvent {
            kind,
            context: state.write_queue.context(),
        };
        let socket = Arc::clone(self);
        self.announce(state, strand, defer, move || match kind {
            WriteQueueEventKind::FlowControlRelaxed => {
                session.process_write_queue_flow_control_relaxed(&socket, &event);
            }
            WriteQueueEventKind::FlowControlApplied => {
                session.process_write_queue_flow_control_applied(&socket, &event);
            }
            WriteQueueEventKind::LowWatermark => {
                session.process_write_queue_low_watermark(&socket, &event);
            }
            WriteQueueEventKind::HighWatermark => {
                session.process_write_queue_high_watermark(&socket, &event);
            }
            WriteQueueEventKind::Discarded => {
                session.process_write_queue_discarded(&socket, &event);
            }
            WriteQueueEventKind::RateLimitApplied => {
                session.process_write_queue_rate_limit_applied(&socket, &event);
            }
            WriteQueueEventKind::RateLimitRelaxed => {
                session.process_write_queue_rate_limit_relaxed(&socket, &event);
            }
        })
    }

    fn announce_read_queue_event<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        kind: ReadQueueEventKind,
        defer: bool,
    ) -> Guard<'a> {
        let Some(session) = state.session.clone() else {
            return state;
        };
        let strand = state.session_strand.clone();
        let event = ReadQueueEvent {
            kind,
            context: state.read_queue.context(),
        };
        let socket = Arc::clone(self);
        self.announce(state, strand, defer, move || match kind {
            ReadQueueEventKind::FlowControlRelaxed => {
                session.process_read_queue_flow_control_relaxed(&socket, &event);
            }
            ReadQueueEventKind::FlowControlApplied => {
                session.process_read_queue_flow_control_applied(&socket, &event);
            }
            ReadQueueEventKind::LowWatermark => {
                session.process_read_queue_low_watermark(&socket, &event);
            }
            ReadQueueEventKind::HighWatermark => {
                session.process_read_queue_high_watermark(&socket, &event);
            }
            ReadQueueEventKind::Discarded => {
                session.process_read_queue_discarded(&socket, &event);
            }
            ReadQueueEventKind::RateLimitApplied => {
                session.process_read_queue_rate_limit_applied(&socket, &event);
            }
            ReadQueueEventKind::RateLimitRelaxed => {
                session.process_read_queue_rate_limit_relaxed(&socket, &event);
            }
        })
    }

    fn announce_shutdown_event<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        kind: ShutdownEventKind,
        origin: ShutdownOrigin,
        defer: bool,
    ) -> Guard<'a> {
        let Some(session) = state.session.clone() else {
            return state;
        };
        let strand = state.session_strand.clone();
        let socket = Arc::clone(self);
        let event = ShutdownEvent { kind, origin };
        self.announce(state, strand, defer, move || {
            session.process_shutdown(&socket, &event);
        })
    }
}

impl DriverSocket for DatagramSocket {
    fn handle(&self) -> Option<Handle> {
        self.state.lock().handle
    }

    fn process_socket_sent(&self, result: Result<usize>) {
        let Some(this) = self.retain() else {
            return;
        };
        let mut state = this.state.lock();
        state.send_pending = false;

        match result {
            Ok(bytes_sent) => {
                if let Some(limiter) = state.send_rate_limiter.clone() {
                    limiter.submit(Instant::now(), bytes_sent as u64);
                }
                if let Some(entry) = state.write_queue.pop_front() {
                    state = this.complete_send_entry(state, entry, Ok(bytes_sent));
                }
                state = this.announce_write_watermarks(state);
                state = this.private_initiate_send(state);
            }
            Err(Error::Cancelled) => {
                if let Some(entry) = state.write_queue.pop_front() {
                    state = this.complete_send_entry(state, entry, Err(Error::Cancelled));
                    state = this.announce_write_watermarks(state);
                }
                state = this.private_initiate_send(state);
            }
            Err(Error::WouldBlock) => {
                state = this.private_initiate_send(state);
            }
            Err(error) => {
                if let Some(entry) = state.write_queue.pop_front() {
                    state = this.complete_send_entry(state, entry, Err(error));
                }
                state = this.private_fail(state, error);
            }
        }
        drop(state);
    }

    fn process_socket_received(&self, result: Result<ReceivedData>) {
        let Some(this) = self.retain() else {
            return;
        };
        let mut state = this.state.lock();
        state.receive_pending = false;

        match result {
            Ok(received) => {
                if let Some(limiter) = state.receive_rate_limiter.clone() {
                    limiter.submit(Instant::now(), received.data.len() as u64);
                }

                let (payload, compression) = match state.compression.clone() {
                    Some(compression) => {
                        let mut context = CompressionContext::default();
                        let mut output = BytesMut::with_capacity(received.data.len());
                        match compression.inflate(
                            &mut context,
                            &mut output,
                            &received.data,
                            &InflateOptions::default(),
                        ) {
                            Ok(()) => (output.freeze(), Some(context)),
                            Err(_) => {
                                // Corrupt inbound data is indistinguishable
                                // from a broken transport.
                                let state = this.private_fail(state, Error::Transport);
                                drop(state);
                                return;
                            }
                        }
                    }
                    None => (received.data, None),
                };

                let length = payload.len();
                state.read_queue.push_entry(ReadQueueEntry {
                    timestamp: Instant::now(),
                    endpoint: received.endpoint,
                    data: payload,
                    length,
                });
                state.read_contexts.push_back(compression);

                state = this.private_match_receives(state);

                if state.read_queue.authorize_high_watermark_event() {
                    state = this.announce_read_queue_event(
                        state,
                        ReadQueueEventKind::HighWatermark,
                        false,
                    );
                }

                state = this.private_initiate_receive(state);
            }
            Err(Error::Cancelled) | Err(Error::WouldBlock) => {
                state = this.private_initiate_receive(state);
            }
            Err(Error::Eof) => {
                state = this.private_shutdown_receive(state, ShutdownOrigin::Remote);
            }
            Err(error) => {
                state = this.private_fail(state, error);
            }
        }
        drop(state);
    }

    fn process_socket_error(&self, error: Error) {
        let Some(this) = self.retain() else {
            return;
        };
        let state = this.state.lock();
        let state = this.private_fail(state, error);
        drop(state);
    }

    fn process_socket_detached(&self) {
        let Some(this) = self.retain() else {
            return;
        };
        let state = this.state.lock();
        if !state.detach.initiated() {
            return;
        }
        let state = this.private_detached(state);
        drop(state);
    }
}

fn transport_for(endpoint: &Endpoint) -> Result<Transport> {
    match endpoint {
        Endpoint::Ip(addr) if addr.is_ipv4() => Ok(Transport::Udp4),
        Endpoint::Ip(_) => Ok(Transport::Udp6),
        Endpoint::Local(_) => Ok(Transport::LocalDatagram),
    }
}

impl std::fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DatagramSocket")
            .field("handle", &state.handle)
            .field("transport", &state.transport)
            .field("source_endpoint", &state.source_endpoint)
            .field("remote_endpoint", &state.remote_endpoint)
            .field("write_queue", &state.write_queue)
            .field("read_queue", &state.read_queue)
            .field("closed", &state.closed)
            .finish()
    }
}
