//! The listener socket engine.
//!
//! A `ListenerSocket` owns a passive stream socket and produces connected
//! [`StreamSocket`]s. Accepted sockets inherit the listener's session
//! configuration. The accept queue is bounded by the listen backlog; when
//! it fills, the engine stops submitting accepts and announces the
//! connection limit to the manager until an accepted socket is claimed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace};

use outrigger_core::detach::{DetachGoal, DetachState};
use outrigger_core::dispatch;
use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::options::{AcceptOptions, BindOptions, SocketOptions};
use outrigger_core::strand::{Executor, Functor, Strand};
use outrigger_core::timer::Timer;
use outrigger_core::transport::{Handle, Token, Transport, TransportMode};

use crate::driver::{Driver, DriverSocket, ReceivedData};
use crate::event::{AcceptCallback, CloseCallback, ErrorEvent, ReleaseCallback};
use crate::session::{ListenerSocketManager, ListenerSocketSession};
use crate::stream::StreamSocket;

struct AcceptEntry {
    token: Option<Token>,
    timer: Option<Timer>,
    callback: AcceptCallback,
}

struct State {
    transport: Option<Transport>,
    handle: Option<Handle>,
    source_endpoint: Option<Endpoint>,
    backlog: usize,
    listening: bool,

    accept_queue: VecDeque<(Handle, Endpoint)>,
    accept_callbacks: VecDeque<AcceptEntry>,
    accept_pending: bool,
    limit_announced: bool,

    detach: DetachState,
    session: Option<Arc<dyn ListenerSocketSession>>,
    session_strand: Option<Arc<Strand>>,
    manager: Option<Arc<dyn ListenerSocketManager>>,
    manager_strand: Option<Arc<Strand>>,

    deferred: Vec<Functor>,
    release_callback: Option<ReleaseCallback>,
    closed: bool,
}

type Guard<'a> = MutexGuard<'a, State>;

/// State machine for one passive socket producing connected streams.
pub struct ListenerSocket {
    driver: Arc<dyn Driver>,
    executor: Arc<dyn Executor>,
    options: SocketOptions,
    weak_self: Weak<ListenerSocket>,
    state: Mutex<State>,
}

impl ListenerSocket {
    /// Create an unopened listener over `driver`.
    ///
    /// `options` also becomes the session configuration of every accepted
    /// stream socket.
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
                backlog: 0,
                listening: false,
                accept_queue: VecDeque::new(),
                accept_callbacks: VecDeque::new(),
                accept_pending: false,
                limit_announced: false,
                detach: DetachState::new(),
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

    fn retain(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    // === Accessors ===

    /// The attached handle, if the listener is open.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.state.lock().handle
    }

    /// The endpoint the listener is bound to.
    #[must_use]
    pub fn source_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().source_endpoint.clone()
    }

    /// Whether `listen` has succeeded.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    // === Registration ===

    /// Register the session observing this listener's events.
    pub fn register_session(
        &self,
        session: Arc<dyn ListenerSocketSession>,
        strand: Option<Arc<Strand>>,
    ) {
        let mut state = self.state.lock();
        state.session = Some(session);
        state.session_strand = strand;
    }

    /// Register the manager observing this listener's lifecycle.
    pub fn register_manager(
        &self,
        manager: Arc<dyn ListenerSocketManager>,
        strand: Option<Arc<Strand>>,
    ) {
        let mut state = self.state.lock();
        state.manager = Some(manager);
        state.manager_strand = strand;
    }

    // === Listen ===

    /// Open, bind to `endpoint`, and start listening with `backlog`.
    ///
    /// Returns the effective source endpoint (an ephemeral port when
    /// `endpoint` carries port zero).
    pub fn listen(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        backlog: usize,
        options: &BindOptions,
    ) -> Result<Endpoint> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() || state.listening {
            return Err(Error::Invalid);
        }

        let transport = stream_transport_for(endpoint)?;
        debug_assert_eq!(transport.mode(), TransportMode::Stream);

        let handle = self.driver.open_socket(transport)?;
        let reuse = options.reuse_address || self.options.reuse_address;
        let bound = match self.driver.bind_socket(handle, endpoint, reuse) {
            Ok(bound) => bound,
            Err(error) => {
                let _ = self.driver.close_socket(handle);
                return Err(error);
            }
        };
        if let Err(error) = self.driver.listen_socket(handle, backlog) {
            let _ = self.driver.close_socket(handle);
            return Err(error);
        }

        state.transport = Some(transport);
        state.handle = Some(handle);
        state.source_endpoint = Some(bound.clone());
        state.backlog = backlog.max(1);
        state.listening = true;

        self.driver
            .attach_socket(Arc::clone(self) as Arc<dyn DriverSocket>)?;

        debug!(handle = handle.as_raw(), endpoint = %bound, backlog, "listener opened");

        if let Some(manager) = state.manager.clone() {
            let strand = state.manager_strand.clone();
            let socket = Arc::clone(self);
            state = self.announce(state, strand, false, move || {
                manager.process_socket_established(&socket);
            });
        }

        state = self.private_initiate_accept(state);
        drop(state);
        Ok(bound)
    }

    // === Accept ===

    /// Request the next connected stream socket.
    ///
    /// Completes immediately when an accepted connection is queued and no
    /// earlier request is waiting; otherwise the request is queued with
    /// its optional deadline.
    pub fn accept(self: &Arc<Self>, options: &AcceptOptions, callback: AcceptCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() || !state.listening {
            return Err(Error::Invalid);
        }

        let timer = options.deadline.map(|deadline| {
            let socket = Arc::clone(self);
            let armed = Arc::new(AtomicU64::new(0));
            let marker = Arc::clone(&armed);
            let timer = self.driver.create_timer(
                deadline,
                Box::new(move || socket.process_accept_deadline(&marker)),
            );
            armed.store(timer.id(), Ordering::SeqCst);
            timer
        });

        state.accept_callbacks.push_back(AcceptEntry {
            token: options.token,
            timer,
            callback,
        });

        state = self.private_match_accepts(state);
        let state = self.private_initiate_accept(state);
        drop(state);
        Ok(())
    }

    /// Cancel the pending accept identified by `token`.
    pub fn cancel_accept(self: &Arc<Self>, token: Token) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Invalid);
        }
        let index = state
            .accept_callbacks
            .iter()
            .position(|entry| entry.token == Some(token))
            .ok_or(Error::Invalid)?;
        let mut entry = state.accept_callbacks.remove(index).expect("index exists");
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
        let callback = entry.callback;
        let state = self.announce(state, None, false, move || callback(Err(Error::Cancelled)));
        drop(state);
        Ok(())
    }

    // === Close / release ===

    /// Detach the listener from the engine without closing the
    /// descriptor.
    pub fn release(self: &Arc<Self>, callback: ReleaseCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.detach.initiated() {
            return Err(Error::Invalid);
        }
        let handle = state.handle.ok_or(Error::Invalid)?;

        state = self.cancel_all_pending(state);
        state.listening = false;
        state.release_callback = Some(callback);
        state.detach.initiate(DetachGoal::Export)?;
        let _ = self.driver.cancel(handle);
        self.driver.detach_socket(handle)?;
        drop(state);
        Ok(())
    }

    /// Stop listening, detach, and close the descriptor.
    ///
    /// Queued but unclaimed connections are closed. The callback runs
    /// after the dispatcher confirms detachment; closing an
    /// already-closed listener invokes it synchronously.
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

        state.listening = false;
        state.detach.set_goal(DetachGoal::Close);
        state = self.cancel_all_pending(state);

        match state.handle {
            Some(handle) => {
                state
                    .detach
                    .initiate(DetachGoal::Close)
                    .expect("detach mode checked idle");
                let _ = self.driver.cancel(handle);
                if self.driver.detach_socket(handle).is_err() {
                    state = self.private_detached(state);
                }
            }
            None => {
                state.detach.initiate(DetachGoal::Close).ok();
                state = self.private_detached(state);
            }
        }
        drop(state);
    }

    // === Private ===

    fn private_initiate_accept<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        if state.accept_pending
            || !state.listening
            || state.detach.initiated()
            || state.closed
        {
            return state;
        }
        let Some(handle) = state.handle else {
            return state;
        };

        if state.accept_queue.len() >= state.backlog {
            // The accept queue is full; pause until a connection is
            // claimed and announce the limit once per episode.
            if !state.limit_announced {
                state.limit_announced = true;
                if let Some(manager) = state.manager.clone() {
                    let strand = state.manager_strand.clone();
                    let socket = Arc::clone(self);
                    state = self.announce(state, strand, true, move || {
                        manager.process_socket_limit(&socket);
                    });
                }
            }
            return state;
        }

        match self.driver.accept(handle) {
            Ok(()) => {
                state.accept_pending = true;
                state
            }
            Err(Error::WouldBlock) => state,
            Err(error) => self.private_fail(state, error),
        }
    }

    fn private_match_accepts<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        while !state.accept_queue.is_empty() && !state.accept_callbacks.is_empty() {
            let (handle, peer) = state.accept_queue.pop_front().expect("checked non-empty");
            let mut entry = state.accept_callbacks.pop_front().expect("checked non-empty");
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            state.limit_announced = false;

            let transport = state.transport.unwrap_or(Transport::Tcp4);
            let result = StreamSocket::adopt_accepted(
                Arc::clone(&self.driver),
                self.options.clone(),
                transport,
                handle,
            );

            trace!(handle = handle.as_raw(), peer = %peer, "connection accepted");

            let callback = entry.callback;
            state = self.announce(state, None, false, move || callback(result));
        }
        state
    }

    fn process_accept_deadline(self: &Arc<Self>, timer_id: &AtomicU64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let id = timer_id.load(Ordering::SeqCst);
        let Some(index) = state.accept_callbacks.iter().position(|entry| {
            entry.timer.as_ref().is_some_and(|timer| timer.id() == id)
        }) else {
            return;
        };
        let entry = state.accept_callbacks.remove(index).expect("index exists");
        let callback = entry.callback;
        let state = self.announce(state, None, false, move || {
            callback(Err(Error::WouldBlock));
        });
        drop(state);
    }

    fn cancel_all_pending<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        while let Some(mut entry) = state.accept_callbacks.pop_front() {
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
            let callback = entry.callback;
            state = self.announce(state, None, false, move || callback(Err(Error::Cancelled)));
        }
        while let Some((handle, _)) = state.accept_queue.pop_front() {
            let _ = self.driver.close_socket(handle);
        }
        state
    }

    fn private_detached<'a>(self: &'a Arc<Self>, mut state: Guard<'a>) -> Guard<'a> {
        let goal = state.detach.complete().unwrap_or(DetachGoal::Close);
        state.closed = true;
        state.listening = false;

        let handle = state.handle.take();
        match goal {
            DetachGoal::Close => {
                if let Some(handle) = handle {
                    let _ = self.driver.close_socket(handle);
                    debug!(handle = handle.as_raw(), "listener closed");
                }
            }
            DetachGoal::Export => {
                if let Some(callback) = state.release_callback.take() {
                    let result = handle.ok_or(Error::Invalid);
                    state = self.announce(state, None, false, move || callback(result));
                }
            }
        }

        if let Some(manager) = state.manager.clone() {
            let strand = state.manager_strand.clone();
            let socket = Arc::clone(self);
            state = self.announce(state, strand, true, move || {
                manager.process_socket_closed(&socket);
            });
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
        state.listening = false;
        state = self.cancel_all_pending(state);
        state
    }

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
}

impl DriverSocket for ListenerSocket {
    fn handle(&self) -> Option<Handle> {
        self.state.lock().handle
    }

    fn process_socket_accepted(&self, result: Result<(Handle, Endpoint)>) {
        let Some(this) = self.retain() else {
            return;
        };
        let mut state = this.state.lock();
        state.accept_pending = false;

        match result {
            Ok((handle, peer)) => {
                state.accept_queue.push_back((handle, peer));
                state = this.private_match_accepts(state);
                state = this.private_initiate_accept(state);
            }
            Err(Error::Cancelled) | Err(Error::WouldBlock) => {
                state = this.private_initiate_accept(state);
            }
            Err(error) => {
                state = this.private_fail(state, error);
            }
        }
        drop(state);
    }

    fn process_socket_sent(&self, _result: Result<usize>) {}

    fn process_socket_received(&self, _result: Result<ReceivedData>) {}

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

fn stream_transport_for(endpoint: &Endpoint) -> Result<Transport> {
    match endpoint {
        Endpoint::Ip(addr) if addr.is_ipv4() => Ok(Transport::Tcp4),
        Endpoint::Ip(_) => Ok(Transport::Tcp6),
        Endpoint::Local(_) => Ok(Transport::LocalStream),
    }
}

impl std::fmt::Debug for ListenerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ListenerSocket")
            .field("handle", &state.handle)
            .field("source_endpoint", &state.source_endpoint)
            .field("listening", &state.listening)
            .field("accept_queue", &state.accept_queue.len())
            .field("accept_callbacks", &state.accept_callbacks.len())
            .field("closed", &state.closed)
            .finish()
    }
}
