//! The stream socket engine.
//!
//! Extends the datagram model with connection establishment (including
//! multi-attempt connect with retry pacing), byte-stream framing for
//! receives, and optional transport-security upgrade/downgrade through an
//! [`Encryption`] capability.
//!
//! The connection state machine is `closed → connecting → connected →
//! shutting-down → closed`. A failed connect consumes the descriptor on
//! some systems, so every attempt opens a fresh handle and tears the old
//! one down through the dispatcher's detach protocol.

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
    BindOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode, SocketOptions,
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
use crate::encrypt::Encryption;
use crate::event::{
    BindCallback, CloseCallback, CompletionKind, ConnectCallback, ConnectEvent, ErrorEvent,
    ReadQueueEvent, ReadQueueEventKind, ReceiveCallback, ReceiveContext, ReceiveEvent,
    ReleaseCallback, SecurityCallback, SendCallback, SendContext, SendEvent, ShutdownEvent,
    ShutdownEventKind, WriteQueueEvent, WriteQueueEventKind,
};
use crate::resolver::{GetEndpointOptions, Resolver};
use crate::session::{StreamSocketManager, StreamSocketSession};

/// Progress of connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Closed,
    Connecting,
    Connected,
}

/// What the pending connect was asked to reach.
enum ConnectTarget {
    Endpoint(Endpoint),
    Name(String),
}

struct ConnectContext {
    target: ConnectTarget,
    retries_remaining: u32,
    attempts: u32,
    options: ConnectOptions,
    callback: Option<ConnectCallback>,
    attempt_timer: Option<Timer>,
    retry_timer: Option<Timer>,
    last_error: Error,
}

struct State {
    transport: Option<Transport>,
    handle: Option<Handle>,
    source_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,
    connection: ConnectionState,
    connect: Option<ConnectContext>,
    // Set while a failed attempt's handle detaches; distinguishes attempt
    // teardown from the close protocol in the detach acknowledgement.
    connect_teardown: bool,

    write_queue: WriteQueue<SendCallback>,
    read_queue: ReadQueue<ReceiveCallback>,
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
    encryption: Option<Arc<dyn Encryption>>,
    upgrading: bool,
    upgrade_callback: Option<SecurityCallback>,
    downgrade_callback: Option<SecurityCallback>,
    pre_encryption_queue: VecDeque<(Bytes, Option<SendCallback>)>,

    session: Option<Arc<dyn StreamSocketSession>>,
    session_strand: Option<Arc<Strand>>,
    manager: Option<Arc<dyn StreamSocketManager>>,
    manager_strand: Option<Arc<Strand>>,

    deferred: Vec<Functor>,
    release_callback: Option<ReleaseCallback>,
    closed: bool,
}

type Guard<'a> = MutexGuard<'a, State>;

/// State machine for one connection-oriented socket.
pub struct StreamSocket {
    driver: Arc<dyn Driver>,
    executor: Arc<dyn Executor>,
    options: SocketOptions,
    weak_self: Weak<StreamSocket>,
    state: Mutex<State>,
}

impl StreamSocket {
    /// Create an unconnected socket over `driver`.
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
                connection: ConnectionState::Closed,
                connect: None,
                connect_teardown: false,
                write_queue: WriteQueue::new(
                    options.write_queue_low_watermark,
                    options.write_queue_high_watermark,
                ),
                read_queue: ReadQueue::new(
                    options.read_queue_low_watermark,
                    options.read_queue_high_watermark,
                ),
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
                encryption: None,
                upgrading: false,
                upgrade_callback: None,
                downgrade_callback: None,
                pre_encryption_queue: VecDeque::new(),
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

    /// Adopt an already-connected handle produced by a listener.
    ///
    /// The socket starts in the connected state and inherits `options`
    /// from the listener's configuration.
    pub fn adopt_accepted(
        driver: Arc<dyn Driver>,
        options: SocketOptions,
        transport: Transport,
        handle: Handle,
    ) -> Result<Arc<Self>> {
        let socket = Self::new(driver, options);
        socket
            .driver
            .set_send_buffer_size(handle, socket.options.send_buffer_size)?;
        socket
            .driver
            .set_receive_buffer_size(handle, socket.options.receive_buffer_size)?;
        {
            let mut state = socket.state.lock();
            state.transport = Some(transport);
            state.handle = Some(handle);
            state.connection = ConnectionState::Connected;
            state.source_endpoint = socket.driver.source_endpoint(handle).ok();
            state.remote_endpoint = socket.driver.remote_endpoint(handle).ok();
        }
        socket
            .driver
            .attach_socket(Arc::clone(&socket) as Arc<dyn DriverSocket>)?;
        let state = socket.state.lock();
        let state = socket.private_relax_receive_flow(state);
        drop(state);
        Ok(socket)
    }

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

    /// The endpoint the socket is connected to.
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().remote_endpoint.clone()
    }

    /// Whether the connection is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connection == ConnectionState::Connected
    }

    /// Whether records are currently encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        let state = self.state.lock();
        state
            .encryption
            .as_ref()
            .is_some_and(|encryption| encryption.is_established())
    }

    // === Registration ===

    /// Register the session observing this socket's events, optionally
    /// pinned to a strand.
    pub fn register_session(
        &self,
        session: Arc<dyn StreamSocketSession>,
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
        manager: Arc<dyn StreamSocketManager>,
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

    /// Register a compression capability.
    pub fn register_compression(&self, compression: Arc<dyn Compression>) {
        self.state.lock().compression = Some(compression);
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

    // === Connect ===

    /// Connect to `endpoint`, retrying per `options`.
    ///
    /// Each attempt opens a fresh handle. The callback completes once with
    /// success or with the error of the final attempt.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        if endpoint.is_any() || endpoint.port() == Some(0) {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if state.connection != ConnectionState::Closed || state.connect.is_some() {
            return Err(Error::Invalid);
        }

        state.connection = ConnectionState::Connecting;
        state.connect = Some(ConnectContext {
            target: ConnectTarget::Endpoint(endpoint.clone()),
            retries_remaining: options.retry_count,
            attempts: 0,
            options: options.clone(),
            callback: Some(callback),
            attempt_timer: None,
            retry_timer: None,
            last_error: Error::Transport,
        });

        let endpoint = endpoint.clone();
        let state = self.private_attempt_connect(state, endpoint);
        drop(state);
        Ok(())
    }

    /// Resolve `name` and connect to the answer, re-resolving before each
    /// retry.
    pub fn connect_name(
        self: &Arc<Self>,
        name: &str,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if state.connection != ConnectionState::Closed || state.connect.is_some() {
            return Err(Error::Invalid);
        }
        if state.resolver.is_none() {
            return Err(Error::Invalid);
        }

        state.connection = ConnectionState::Connecting;
        state.connect = Some(ConnectContext {
            target: ConnectTarget::Name(name.to_string()),
            retries_remaining: options.retry_count,
            attempts: 0,
            options: options.clone(),
            callback: Some(callback),
            attempt_timer: None,
            retry_timer: None,
            last_error: Error::Transport,
        });
        drop(state);

        self.private_resolve_and_connect();
        Ok(())
    }

    /// Resolve off-lock, then re-enter the attempt path.
    fn private_resolve_and_connect(self: &Arc<Self>) {
        let socket = Arc::clone(self);
        self.driver.execute(Box::new(move || {
            let (resolver, name) = {
                let state = socket.state.lock();
                let Some(connect) = state.connect.as_ref() else {
                    return;
                };
                let ConnectTarget::Name(name) = &connect.target else {
                    return;
                };
                let Some(resolver) = state.resolver.clone() else {
                    return;
                };
                (resolver, name.clone())
            };

            let target = Arc::clone(&socket);
            let result = resolver.get_endpoint(
                &name,
                GetEndpointOptions::default(),
                Box::new(move |result, _context| {
                    let mut state = target.state.lock();
                    match result {
                        Ok(endpoint) => {
                            let state = target.private_attempt_connect(state, endpoint);
                            drop(state);
                        }
                        Err(error) => {
                            state = target.private_connect_attempt_failed(state, error);
                            drop(state);
                        }
                    }
                }),
            );
            if result.is_err() {
                let state = socket.state.lock();
                let state = socket.private_connect_attempt_failed(state, Error::Invalid);
                drop(state);
            }
        }));
    }

    fn private_attempt_connect<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        endpoint: Endpoint,
    ) -> Guard<'a> {
        if state.closed || state.connect.is_none() {
            return state;
        }

        let transport = match stream_transport_for(&endpoint) {
            Ok(transport) => transport,
            Err(error) => return self.private_connect_attempt_failed(state, error),
        };

        let handle = match self.driver.open_socket(transport) {
            Ok(handle) => handle,
            Err(error) => return self.private_connect_attempt_failed(state, error),
        };
        let _ = self
            .driver
            .set_send_buffer_size(handle, self.options.send_buffer_size);
        let _ = self
            .driver
            .set_receive_buffer_size(handle, self.options.receive_buffer_size);

        if let Some(source) = self.options.source_endpoint.clone() {
            if let Err(error) =
                self.driver
                    .bind_socket(handle, &source, self.options.reuse_address)
            {
                let _ = self.driver.close_socket(handle);
                return self.private_connect_attempt_failed(state, error);
            }
        }

        state.transport = Some(transport);
        state.handle = Some(handle);

        if let Err(error) = self
            .driver
            .attach_socket(Arc::clone(self) as Arc<dyn DriverSocket>)
        {
            let _ = self.driver.close_socket(handle);
            state.handle = None;
            return self.private_connect_attempt_failed(state, error);
        }

        if let Some(connect) = state.connect.as_mut() {
            connect.attempts += 1;
            if let Some(deadline) = connect.options.attempt_deadline {
                let socket = Arc::clone(self);
                connect.attempt_timer = Some(self.driver.create_timer(
                    Instant::now() + deadline,
                    Box::new(move || socket.process_connect_deadline()),
                ));
            }
        }

        trace!(handle = handle.as_raw(), endpoint = %endpoint, "stream connect attempt");

        if let Err(error) = self.driver.connect(handle, &endpoint) {
            return self.private_connect_attempt_failed(state, error);
        }
        state
    }

    fn private_connect_attempt_failed<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        error: Error,
    ) -> Guard<'a> {
        let Some(connect) = state.connect.as_mut() else {
            return state;
        };
        connect.last_error = error;
        if let Some(timer) = connect.attempt_timer.take() {
            timer.cancel();
        }

        // A failed connect consumes the descriptor; tear the handle down
        // through the detach protocol before the next attempt.
        if let Some(handle) = state.handle {
            state.connect_teardown = true;
            if self.driver.detach_socket(handle).is_err() {
                state.connect_teardown = false;
                let _ = self.driver.close_socket(handle);
                state.handle = None;
            } else {
                // The acknowledgement re-enters the retry path.
                return state;
            }
        }

        self.private_connect_next(state)
    }

    /// Schedule the next attempt or fail the connect for good.
    fn private_connect_next<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        let Some(connect) = state.connect.as_mut() else {
            return state;
        };

        if connect.retries_remaining == 0 {
            let callback = connect.callback.take();
            let attempts = connect.attempts;
            let error = connect.last_error;
            state.connect = None;
            state.connection = ConnectionState::Closed;
            if let Some(callback) = callback {
                let event = ConnectEvent {
                    kind: CompletionKind::Error,
                    endpoint: None,
                    attempts,
                    error: Some(error),
                };
                state = self.announce(state, None, false, move || callback(event));
            }
            return state;
        }

        connect.retries_remaining -= 1;
        // The first retry waits the base interval; with a maximum set, the
        // pause doubles per failed attempt up to that cap.
        let interval = connect
            .options
            .next_retry_interval(connect.attempts.saturating_sub(1));
        let socket = Arc::clone(self);
        connect.retry_timer = Some(self.driver.create_timer(
            Instant::now() + interval,
            Box::new(move || socket.process_connect_retry()),
        ));
        state
    }

    fn process_connect_retry(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let Some(connect) = state.connect.as_mut() else {
            return;
        };
        connect.retry_timer = None;

        match &connect.target {
            ConnectTarget::Endpoint(endpoint) => {
                let endpoint = endpoint.clone();
                let state = self.private_attempt_connect(state, endpoint);
                drop(state);
            }
            ConnectTarget::Name(_) => {
                drop(state);
                self.private_resolve_and_connect();
            }
        }
    }

    fn process_connect_deadline(self: &Arc<Self>) {
        let state = self.state.lock();
        if state.connect.is_none() || state.connection != ConnectionState::Connecting {
            return;
        }
        // Cancelling the in-flight connect surfaces as a failed attempt.
        if let Some(handle) = state.handle {
            drop(state);
            let _ = self.driver.cancel(handle);
        }
    }

    // === Bind ===

    /// Bind to `endpoint` before connecting.
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
        if state.handle.is_some() {
            return Err(Error::Invalid);
        }

        // The handle is opened at connect time; a pre-connect bind only
        // records the requested source endpoint.
        let _ = options;
        state.source_endpoint = Some(endpoint.clone());
        let endpoint = endpoint.clone();
        let state = self.announce(state, None, false, move || callback(Ok(endpoint)));
        drop(state);
        Ok(())
    }

    // === Send ===

    /// Enqueue `data` for transmission.
    ///
    /// Sends are accepted while connecting and drain once the connection
    /// establishes. During a security upgrade they park in the
    /// pre-encryption queue and complete as the handshake completes.
    pub fn send(
        self: &Arc<Self>,
        data: Bytes,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if !state.shutdown.can_send() {
            return Err(Error::Invalid);
        }
        if state.connection == ConnectionState::Closed {
            return Err(Error::Invalid);
        }

        if state.upgrading {
            state.pre_encryption_queue.push_back((data, callback));
            return Ok(());
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

        let payload = self.private_encode(&mut state, &data)?;

        self.private_enqueue_send(&mut state, payload, options, callback);
        let state = self.private_relax_send_flow(state);
        drop(state);
        Ok(())
    }

    /// Deflate then seal `data` per the registered capabilities.
    fn private_encode(self: &Arc<Self>, state: &mut Guard<'_>, data: &Bytes) -> Result<Bytes> {
        let mut payload = match state.compression.clone() {
            Some(compression) => {
                let mut context = CompressionContext::default();
                let mut output = BytesMut::with_capacity(data.len());
                compression.deflate(&mut context, &mut output, data, &DeflateOptions::default())?;
                output.freeze()
            }
            None => data.clone(),
        };

        if let Some(encryption) = state.encryption.clone() {
            if encryption.is_established() {
                let mut sealed = BytesMut::with_capacity(payload.len() + 64);
                encryption.seal(&payload, &mut sealed)?;
                payload = sealed.freeze();
            }
        }

        Ok(payload)
    }

    fn private_enqueue_send(
        self: &Arc<Self>,
        state: &mut Guard<'_>,
        payload: Bytes,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) {
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
            endpoint: None,
            data: Some(payload),
            length,
            timestamp: Instant::now(),
            deadline: options.deadline,
            timer,
            callback,
        });
    }

    /// Enqueue already-encoded protocol records, bypassing user framing.
    fn private_enqueue_raw<'a>(self: &'a Arc<Self>, mut state: Guard<'a>, records: Bytes) -> Guard<'a> {
        if records.is_empty() {
            return state;
        }
        let id = state.write_queue.next_id();
        let length = records.len();
        state.write_queue.push(WriteQueueEntry {
            id,
            token: None,
            endpoint: None,
            data: Some(records),
            length,
            timestamp: Instant::now(),
            deadline: None,
            timer: None,
            callback: None,
        });
        self.private_relax_send_flow(state)
    }

    /// Cancel the pending send identified by `token`.
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

    /// Request between `min_size` and `max_size` bytes.
    ///
    /// The request completes with any buffered prefix once `min_size`
    /// bytes are available. Fails synchronously with `Eof` once
    /// shutdown-receive has completed and the buffer is empty.
    pub fn receive(
        self: &Arc<Self>,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        if !state.shutdown.can_receive() && state.read_queue.size() == 0 {
            return Err(Error::Eof);
        }

        let min = options.min_size.max(1);
        if state.read_queue.size() >= min && !state.read_queue.has_callbacks() {
            if let Some((data, endpoint)) = state.read_queue.pop_bytes(min, options.max_size) {
                let event = ReceiveEvent::complete(
                    ReceiveContext {
                        endpoint,
                        timestamp: Some(Instant::now()),
                        compression: None,
                    },
                    data,
                );
                let state = self.announce(state, None, false, move || callback(event));
                let state = self.announce_read_watermarks(state);
                let state = self.private_initiate_receive(state);
                drop(state);
                return Ok(());
            }
        }

        let timer = options.deadline.map(|deadline| {
            let socket = Arc::clone(self);
            let armed = Arc::new(AtomicU64::new(0));
            let marker = Arc::clone(&armed);
            let timer = self.driver.create_timer(
                deadline,
                Box::new(move || socket.process_receive_deadline(&marker)),
            );
            armed.store(timer.id(), Ordering::SeqCst);
            timer
        });

        state.read_queue.push_callback(ReceiveCallbackEntry {
            token: options.token,
            deadline: options.deadline,
            timer,
            min_size: min,
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

    // === Security upgrade / downgrade ===

    /// Begin encrypting records through `encryption`.
    ///
    /// User sends issued during the handshake park in a pre-encryption
    /// queue and complete as the handshake completes; `callback` fires
    /// when the capability reports establishment.
    pub fn upgrade(
        self: &Arc<Self>,
        encryption: Arc<dyn Encryption>,
        callback: SecurityCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.connection != ConnectionState::Connected {
            return Err(Error::Invalid);
        }
        if state.encryption.is_some() {
            return Err(Error::Invalid);
        }

        let mut first_flight = BytesMut::new();
        encryption.initiate(&mut first_flight)?;

        state.encryption = Some(encryption.clone());
        state.upgrading = true;
        state.upgrade_callback = Some(callback);

        let mut state = self.private_enqueue_raw(state, first_flight.freeze());

        // Bytes that arrived before the upgrade are handshake records from
        // the peer's point of view; replay them through the capability.
        if let Some((buffered, _)) = state.read_queue.pop_bytes(1, usize::MAX) {
            let mut plaintext = BytesMut::new();
            let mut response = BytesMut::new();
            if encryption
                .absorb(&buffered, &mut plaintext, &mut response)
                .is_err()
            {
                let state = self.private_fail(state, Error::Transport);
                drop(state);
                return Ok(());
            }
            if !plaintext.is_empty() {
                let plaintext = plaintext.freeze();
                let length = plaintext.len();
                state.read_queue.push_entry(ReadQueueEntry {
                    timestamp: Instant::now(),
                    endpoint: None,
                    data: plaintext,
                    length,
                });
            }
            if !response.is_empty() {
                state = self.private_enqueue_raw(state, response.freeze());
            }
            if state.upgrading && encryption.is_established() {
                state = self.private_finish_upgrade(state);
            }
        }

        drop(state);
        Ok(())
    }

    /// Stop encrypting records.
    ///
    /// The capability's closing records are drained before the switch;
    /// `callback` fires when the write queue has flushed them.
    pub fn downgrade(self: &Arc<Self>, callback: SecurityCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.upgrading {
            return Err(Error::Invalid);
        }
        let Some(encryption) = state.encryption.take() else {
            return Err(Error::Invalid);
        };

        let mut closing = BytesMut::new();
        encryption.shutdown(&mut closing)?;
        state.downgrade_callback = Some(callback);

        let mut state = self.private_enqueue_raw(state, closing.freeze());
        if state.write_queue.is_empty() {
            state = self.private_finish_downgrade(state);
        }
        drop(state);
        Ok(())
    }

    fn private_finish_downgrade<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        let Some(callback) = state.downgrade_callback.take() else {
            return state;
        };
        state = self.announce(state, None, false, move || callback(Ok(())));

        if let Some(session) = state.session.clone() {
            let strand = state.session_strand.clone();
            let socket = Arc::clone(self);
            state = self.announce(state, strand, true, move || {
                session.process_downgrade_complete(&socket);
            });
        }
        state
    }

    fn private_finish_upgrade<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        state.upgrading = false;

        // Complete the parked sends now that records are encrypted.
        while let Some((data, callback)) = state.pre_encryption_queue.pop_front() {
            match self.private_encode(&mut state, &data) {
                Ok(payload) => {
                    self.private_enqueue_send(&mut state, payload, &SendOptions::new(), callback);
                }
                Err(error) => {
                    if let Some(callback) = callback {
                        let event = SendEvent::failed(SendContext::default(), error);
                        state = self.announce(state, None, false, move || callback(event));
                    }
                }
            }
        }

        if let Some(callback) = state.upgrade_callback.take() {
            state = self.announce(state, None, false, move || callback(Ok(())));
        }
        if let Some(session) = state.session.clone() {
            let strand = state.session_strand.clone();
            let socket = Arc::clone(self);
            state = self.announce(state, strand, true, move || {
                session.process_upgrade_complete(&socket);
            });
        }

        self.private_relax_send_flow(state)
    }

    // === Shutdown / release / close ===

    /// Shut down one or both directions.
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
    pub fn close(self: &Arc<Self>, callback: CloseCallback) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            callback();
            return;
        }

        state.deferred.push(Box::new(callback));

        if state.detach.initiated() {
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
                || state.connection != ConnectionState::Connected
                || state.detach.initiated()
                || state.closed
            {
                return state;
            }
            let Some(handle) = state.handle else {
                return state;
            };

            let (is_marker, data) = match state.write_queue.front() {
                Some(front) => (front.is_marker(), front.data.clone()),
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
                .send(handle, data, &DriverSendOptions::default())
            {
                Ok(()) => {
                    state.send_pending = true;
                    return state;
                }
                Err(Error::WouldBlock) => return state,
                Err(error) => return self.private_fail(state, error),
            }
        }
    }

    fn private_initiate_receive<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.receive_pending
            || !state.flow.want_receive()
            || !state.shutdown.can_receive()
            || state.connection != ConnectionState::Connected
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

    /// Satisfy pending receives from the byte buffer, oldest first, each
    /// once its minimum is available.
    fn private_match_receives<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        loop {
            let (min, max) = match state.read_queue.front_callback() {
                Some(front) => (front.min_size, front.max_size),
                None => break,
            };
            if state.read_queue.size() < min {
                break;
            }
            let Some((data, endpoint)) = state.read_queue.pop_bytes(min, max) else {
                break;
            };
            let mut request = state
                .read_queue
                .pop_callback()
                .expect("front_callback checked");
            if let Some(timer) = request.timer.take() {
                timer.cancel();
            }
            let callback = request.callback;
            let event = ReceiveEvent::complete(
                ReceiveContext {
                    endpoint,
                    timestamp: Some(Instant::now()),
                    compression: None,
                },
                data,
            );
            state = self.announce(state, None, false, move || callback(event));
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
        // Always deferred; see the ordering contract in the module docs.
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
            while let Some((_, callback)) = state.pre_encryption_queue.pop_front() {
                if let Some(callback) = callback {
                    let event = SendEvent::failed(SendContext::default(), Error::Cancelled);
                    state = self.announce(state, None, false, move || callback(event));
                }
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

            let pending = state.read_queue.pop_all_callbacks();
            for entry in pending {
                state = self.fail_receive_entry(state, entry, Error::Eof);
            }

            // A locally initiated shutdown discards buffered data; a
            // remote end-of-file leaves it readable until drained.
            if context.origin == ShutdownOrigin::Source {
                let discarded = state.read_queue.discard_entries();
                if discarded > 0 {
                    state = self.announce_read_queue_event(
                        state,
                        ReadQueueEventKind::Discarded,
                        defer,
                    );
                }
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
        state.connection = ConnectionState::Closed;

        let handle = state.handle.take();
        match goal {
            DetachGoal::Close => {
                if let Some(handle) = handle {
                    let _ = self.driver.close_socket(handle);
                    debug!(handle = handle.as_raw(), "stream socket closed");
                }
            }
            DetachGoal::Export => {
                if let Some(callback) = state.release_callback.take() {
                    let result = handle.ok_or(Error::Invalid);
                    state = self.announce(state, None, false, move || callback(result));
                }
            }
        }

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

impl DriverSocket for StreamSocket {
    fn handle(&self) -> Option<Handle> {
        self.state.lock().handle
    }

    fn process_socket_connected(&self, result: Result<()>) {
        let Some(this) = self.retain() else {
            return;
        };
        let mut state = this.state.lock();
        if state.closed {
            return;
        }

        match result {
            Ok(()) => {
                if let Some(connect) = state.connect.as_mut() {
                    if let Some(timer) = connect.attempt_timer.take() {
                        timer.cancel();
                    }
                }
                state.connection = ConnectionState::Connected;
                if let Some(handle) = state.handle {
                    state.source_endpoint = this.driver.source_endpoint(handle).ok();
                    state.remote_endpoint = this.driver.remote_endpoint(handle).ok();
                }

                let (callback, attempts) = match state.connect.as_mut() {
                    Some(connect) => (connect.callback.take(), connect.attempts),
                    None => (None, 0),
                };
                state.connect = None;

                debug!(endpoint = ?state.remote_endpoint, attempts, "stream socket connected");

                if let Some(manager) = state.manager.clone() {
                    let strand = state.manager_strand.clone();
                    let socket = Arc::clone(&this);
                    state = this.announce(state, strand, false, move || {
                        manager.process_socket_established(&socket);
                    });
                }

                if let Some(callback) = callback {
                    let event = ConnectEvent {
                        kind: CompletionKind::Complete,
                        endpoint: state.remote_endpoint.clone(),
                        attempts,
                        error: None,
                    };
                    state = this.announce(state, None, false, move || callback(event));
                }

                state = this.private_relax_receive_flow(state);
                state = this.private_relax_send_flow(state);
            }
            Err(error) => {
                let error = if error == Error::Cancelled {
                    Error::Timeout
                } else {
                    error
                };
                state = this.private_connect_attempt_failed(state, error);
            }
        }
        drop(state);
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
                if state.write_queue.is_empty() && state.downgrade_callback.is_some() {
                    state = this.private_finish_downgrade(state);
                }
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

                let mut inbound = received.data;

                if let Some(encryption) = state.encryption.clone() {
                    let mut plaintext = BytesMut::new();
                    let mut response = BytesMut::new();
                    if encryption.absorb(&inbound, &mut plaintext, &mut response).is_err() {
                        let state = this.private_fail(state, Error::Transport);
                        drop(state);
                        return;
                    }
                    if !response.is_empty() {
                        state = this.private_enqueue_raw(state, response.freeze());
                    }
                    if state.upgrading && encryption.is_established() {
                        state = this.private_finish_upgrade(state);
                    }
                    inbound = plaintext.freeze();
                }

                let payload = match state.compression.clone() {
                    Some(compression) if !inbound.is_empty() => {
                        let mut context = CompressionContext::default();
                        let mut output = BytesMut::with_capacity(inbound.len());
                        match compression.inflate(
                            &mut context,
                            &mut output,
                            &inbound,
                            &InflateOptions::default(),
                        ) {
                            Ok(()) => output.freeze(),
                            Err(_) => {
                                let state = this.private_fail(state, Error::Transport);
                                drop(state);
                                return;
                            }
                        }
                    }
                    _ => inbound,
                };

                if !payload.is_empty() {
                    let length = payload.len();
                    state.read_queue.push_entry(ReadQueueEntry {
                        timestamp: Instant::now(),
                        endpoint: None,
                        data: payload,
                        length,
                    });
                }

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
                // Deliver what the buffer still satisfies, then fail the
                // rest with end-of-file.
                state = this.private_match_receives(state);
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
        let mut state = this.state.lock();

        if state.connect_teardown {
            // A failed attempt's handle finished detaching; close it and
            // move on to the retry schedule.
            state.connect_teardown = false;
            if let Some(handle) = state.handle.take() {
                let _ = this.driver.close_socket(handle);
            }
            let state = this.private_connect_next(state);
            drop(state);
            return;
        }

        if !state.detach.initiated() {
            return;
        }
        let state = this.private_detached(state);
        drop(state);
    }
}

fn stream_transport_for(endpoint: &Endpoint) -> Result<Transport> {
    match endpoint {
        Endpoint::Ip(addr) if addr.is_ipv4() => Ok(Transport::Tcp4),
        Endpoint::Ip(_) => Ok(Transport::Tcp6),
        Endpoint::Local(_) => Ok(Transport::LocalStream),
    }
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamSocket")
            .field("handle", &state.handle)
            .field("connection", &state.connection)
            .field("source_endpoint", &state.source_endpoint)
            .field("remote_endpoint", &state.remote_endpoint)
            .field("write_queue", &state.write_queue)
            .field("read_queue", &state.read_queue)
            .field("closed", &state.closed)
            .finish()
    }
}
