//! The simulated machine.
//!
//! An in-process substitute for the operating system's network stack with
//! observably identical socket behavior: handle allocation, port binding,
//! message buffering, backpressure, and connection state. The machine is
//! advanced explicitly by [`Machine::step`] or by a background thread
//! started with [`Machine::run`], which makes tests deterministic and
//! lets fault injection sit between any two deliveries.
//!
//! Handles and ephemeral ports are gap-reused: allocation always yields
//! the numerically smallest free value, regardless of the highest value
//! ever used.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::transport::{Direction, Handle, Transport, TransportMode};

/// One message in flight between two sessions.
#[derive(Debug, Clone)]
pub struct Packet {
    /// The sender's endpoint at enqueue time.
    pub source: Endpoint,
    /// The destination, for datagram delivery.
    pub destination: Option<Endpoint>,
    /// The payload.
    pub data: Bytes,
}

struct HandlePool {
    free: BTreeSet<u32>,
    next: u32,
}

impl HandlePool {
    fn new() -> Self {
        Self {
            free: BTreeSet::new(),
            next: Handle::BASE,
        }
    }

    fn allocate(&mut self) -> Handle {
        match self.free.pop_first() {
            Some(value) => Handle::from_raw(value),
            None => {
                let value = self.next;
                self.next += 1;
                Handle::from_raw(value)
            }
        }
    }

    fn release(&mut self, handle: Handle) {
        let value = handle.as_raw();
        if value < self.next {
            self.free.insert(value);
        }
    }
}

const EPHEMERAL_PORT_BASE: u16 = 49152;

struct PortTable {
    bindings: HashMap<u16, Handle>,
    free_ephemeral: BTreeSet<u16>,
    next_ephemeral: u16,
}

impl PortTable {
    fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            free_ephemeral: BTreeSet::new(),
            next_ephemeral: EPHEMERAL_PORT_BASE,
        }
    }

    fn allocate_ephemeral(&mut self, handle: Handle) -> Result<u16> {
        let port = match self.free_ephemeral.pop_first() {
            Some(port) => port,
            None => {
                if self.next_ephemeral == u16::MAX {
                    return Err(Error::Limit);
                }
                let port = self.next_ephemeral;
                self.next_ephemeral += 1;
                port
            }
        };
        self.bindings.insert(port, handle);
        Ok(port)
    }

    fn claim(&mut self, port: u16, handle: Handle, reuse_address: bool) -> Result<()> {
        if self.bindings.contains_key(&port) && !reuse_address {
            return Err(Error::Invalid);
        }
        self.bindings.insert(port, handle);
        Ok(())
    }

    fn release(&mut self, port: u16) {
        self.bindings.remove(&port);
        if port >= EPHEMERAL_PORT_BASE && port < self.next_ephemeral {
            self.free_ephemeral.insert(port);
        }
    }

    fn lookup(&self, port: u16) -> Option<Handle> {
        self.bindings.get(&port).copied()
    }
}

struct PendingConnect {
    client: Arc<Session>,
    target: Endpoint,
}

struct MachineInner {
    handles: HandlePool,
    ports: HashMap<Transport, PortTable>,
    sessions: HashMap<u32, Arc<Session>>,
    pending_connects: Vec<PendingConnect>,
    running: bool,
    stepper: Option<JoinHandle<()>>,
}

/// The in-process network.
pub struct Machine {
    inner: Mutex<MachineInner>,
    // Signaled on every enqueue and delivery; step(true) and the monitor
    // wait on this.
    activity: Condvar,
    weak_self: Weak<Machine>,
}

impl Machine {
    /// Create an empty machine.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            inner: Mutex::new(MachineInner {
                handles: HandlePool::new(),
                ports: HashMap::new(),
                sessions: HashMap::new(),
                pending_connects: Vec::new(),
                running: false,
                stepper: None,
            }),
            activity: Condvar::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Create a session attached to this machine.
    ///
    /// The session holds no handle until [`Session::open`] is called.
    #[must_use]
    pub fn create_session(self: &Arc<Self>) -> Arc<Session> {
        Arc::new_cyclic(|weak_self| Session {
            machine: Arc::downgrade(self),
            weak_self: weak_self.clone(),
            inner: Mutex::new(SessionInner::new()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    /// Look up the session bound to `port` for `transport`.
    fn find_bound(&self, transport: Transport, port: u16) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        let handle = inner.ports.get(&transport)?.lookup(port)?;
        inner.sessions.get(&handle.as_raw()).cloned()
    }

    /// Notify steppers and monitors that buffers or tables changed.
    pub(crate) fn mark_activity(&self) {
        self.activity.notify_all();
    }

    /// Wait up to `timeout` for buffers or tables to change.
    pub(crate) fn wait_activity(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        let _ = self.activity.wait_for(&mut inner, timeout);
    }

    /// Advance the simulation by one round of deliveries.
    ///
    /// Moves buffered packets from every session's outbound queue toward
    /// their destinations, establishes pending stream connections, and
    /// propagates shutdown markers. With `block` true the call waits for
    /// work when nothing is deliverable.
    pub fn step(&self, block: bool) -> Result<()> {
        loop {
            let (sessions, connects) = {
                let mut inner = self.inner.lock();
                let sessions: Vec<Arc<Session>> = inner.sessions.values().cloned().collect();
                let connects = std::mem::take(&mut inner.pending_connects);
                (sessions, connects)
            };

            let mut delivered = false;

            for connect in connects {
                delivered = true;
                self.establish(connect);
            }

            for session in &sessions {
                delivered |= self.deliver_from(session);
            }

            if delivered || !block {
                return Ok(());
            }

            // Nothing moved: wait for an enqueue, a connect, or a
            // shutdown before trying again. Undeliverable work (a peer
            // applying backpressure) also lands here rather than
            // spinning; the bounded wait picks it back up.
            let mut inner = self.inner.lock();
            if !inner.pending_connects.is_empty() {
                continue;
            }
            let _ = self
                .activity
                .wait_for(&mut inner, Duration::from_millis(50));
        }
    }

    /// Start a background thread stepping the machine.
    pub fn run(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.running {
            return;
        }
        inner.running = true;

        let machine = Arc::clone(self);
        let stepper = std::thread::Builder::new()
            .name("outrigger-machine".into())
            .spawn(move || loop {
                {
                    let inner = machine.inner.lock();
                    if !inner.running {
                        break;
                    }
                }
                let _ = machine.step(true);
            })
            .expect("failed to spawn machine stepper");
        inner.stepper = Some(stepper);
    }

    /// Stop the background stepping thread.
    pub fn stop(&self) {
        let stepper = {
            let mut inner = self.inner.lock();
            inner.running = false;
            inner.stepper.take()
        };
        self.activity.notify_all();
        if let Some(stepper) = stepper {
            let _ = stepper.join();
        }
    }

    /// Complete one pending stream connection.
    fn establish(&self, connect: PendingConnect) {
        let PendingConnect { client, target } = connect;

        let (transport, client_source) = {
            let inner = client.inner.lock();
            (inner.transport, inner.source.clone())
        };
        let Some(transport) = transport else { return };

        let listener = target
            .port()
            .and_then(|port| self.find_bound(transport, port))
            .filter(|listener| listener.is_listening())
            .filter(|listener| {
                // listen(0) still admits one pending connection, as the
                // real stack does.
                let inner = listener.inner.lock();
                inner.backlog.len() <= inner.backlog_limit
            });

        let Some(listener) = listener else {
            // Connection refused.
            let mut inner = client.inner.lock();
            inner.connect_result = Some(Err(Error::Transport));
            drop(inner);
            client.readable.notify_all();
            self.mark_activity();
            return;
        };

        let Some(machine) = self.weak_self.upgrade() else {
            return;
        };

        // Create the server-side session, already connected, sharing the
        // listener's source endpoint.
        let server = machine.create_session();
        if server.open(transport).is_err() {
            return;
        }
        {
            let listener_source = listener.inner.lock().source.clone();
            let mut inner = server.inner.lock();
            inner.source = listener_source;
            inner.remote = client_source.clone();
            inner.connected = true;
            inner.peer = Some(Arc::downgrade(&client));
        }
        {
            let listener_source = listener.inner.lock().source.clone();
            let mut inner = client.inner.lock();
            inner.remote = listener_source;
            inner.connected = true;
            inner.peer = Some(Arc::downgrade(&server));
            inner.connect_result = Some(Ok(()));
        }

        {
            let mut inner = listener.inner.lock();
            inner.backlog.push_back(server);
        }
        listener.readable.notify_all();
        client.writable.notify_all();
        self.mark_activity();

        trace!(target = %target, "stream connection established");
    }

    /// Drain one session's outbound queue. Returns whether anything moved.
    fn deliver_from(&self, session: &Arc<Session>) -> bool {
        let mut moved = false;

        loop {
            // Pop one packet without holding two session locks.
            let (packet, transport, mode) = {
                let mut inner = session.inner.lock();
                let Some(transport) = inner.transport else {
                    break;
                };
                let mode = transport.mode();
                match inner.outbound.pop_front() {
                    Some(packet) => {
                        inner.outbound_size -= packet.data.len();
                        (packet, transport, mode)
                    }
                    None => break,
                }
            };
            session.writable.notify_all();

            match mode {
                TransportMode::Datagram => {
                    let destination = packet
                        .destination
                        .clone()
                        .and_then(|endpoint| endpoint.port())
                        .and_then(|port| self.find_bound(transport, port));

                    match destination {
                        Some(destination) => {
                            let mut inner = destination.inner.lock();
                            if inner.inbound_size + packet.data.len()
                                <= inner.receive_buffer_size
                            {
                                inner.inbound_size += packet.data.len();
                                inner.inbound.push_back(packet);
                                drop(inner);
                                destination.readable.notify_all();
                            }
                            // A full receive buffer loses the datagram, as
                            // the real stack would.
                        }
                        None => {
                            trace!("datagram dropped: no binding at destination");
                        }
                    }
                    moved = true;
                }
                TransportMode::Stream => {
                    let peer = session.peer();
                    let Some(peer) = peer else {
                        moved = true;
                        continue;
                    };

                    let mut inner = peer.inner.lock();
                    let room = inner.receive_buffer_size.saturating_sub(inner.inbound_size);
                    if room == 0 {
                        // Backpressure: put the packet back and stop.
                        drop(inner);
                        let mut source = session.inner.lock();
                        source.outbound_size += packet.data.len();
                        source.outbound.push_front(packet);
                        break;
                    }

                    if packet.data.len() <= room {
                        inner.inbound_size += packet.data.len();
                        inner.inbound.push_back(packet);
                        drop(inner);
                        peer.readable.notify_all();
                    } else {
                        // Split: deliver what fits, requeue the rest.
                        let mut data = packet.data;
                        let fit = data.split_to(room);
                        inner.inbound_size += fit.len();
                        inner.inbound.push_back(Packet {
                            source: packet.source.clone(),
                            destination: packet.destination.clone(),
                            data: fit,
                        });
                        drop(inner);
                        peer.readable.notify_all();

                        let mut source = session.inner.lock();
                        source.outbound_size += data.len();
                        source.outbound.push_front(Packet {
                            source: packet.source,
                            destination: packet.destination,
                            data,
                        });
                        moved = true;
                        break;
                    }
                    moved = true;
                }
            }
        }

        // Propagate a shutdown marker once the data ahead of it has been
        // delivered.
        let fin = {
            let mut inner = session.inner.lock();
            if inner.shutdown_send && inner.outbound.is_empty() && !inner.fin_delivered {
                inner.fin_delivered = true;
                true
            } else {
                false
            }
        };
        if fin {
            if let Some(peer) = session.peer() {
                {
                    let mut inner = peer.inner.lock();
                    inner.eof_pending = true;
                }
                peer.readable.notify_all();
                moved = true;
            }
        }

        if moved {
            self.mark_activity();
        }
        moved
    }
}

pub(crate) struct SessionInner {
    handle: Option<Handle>,
    transport: Option<Transport>,
    blocking: bool,
    source: Option<Endpoint>,
    remote: Option<Endpoint>,
    receive_buffer_size: usize,
    send_buffer_size: usize,

    outbound: VecDeque<Packet>,
    outbound_size: usize,
    inbound: VecDeque<Packet>,
    inbound_size: usize,

    shutdown_send: bool,
    shutdown_receive: bool,
    fin_delivered: bool,
    eof_pending: bool,

    listening: bool,
    backlog: VecDeque<Arc<Session>>,
    backlog_limit: usize,

    peer: Option<Weak<Session>>,
    connected: bool,
    connect_result: Option<Result<()>>,
    closed: bool,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            handle: None,
            transport: None,
            blocking: true,
            source: None,
            remote: None,
            receive_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            outbound: VecDeque::new(),
            outbound_size: 0,
            inbound: VecDeque::new(),
            inbound_size: 0,
            shutdown_send: false,
            shutdown_receive: false,
            fin_delivered: false,
            eof_pending: false,
            listening: false,
            backlog: VecDeque::new(),
            backlog_limit: 0,
            peer: None,
            connected: false,
            connect_result: None,
            closed: false,
        }
    }
}

/// One simulated socket.
pub struct Session {
    machine: Weak<Machine>,
    weak_self: Weak<Session>,
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) readable: Condvar,
    pub(crate) writable: Condvar,
}

impl Session {
    fn machine(&self) -> Result<Arc<Machine>> {
        self.machine.upgrade().ok_or(Error::Invalid)
    }

    fn this(&self) -> Arc<Session> {
        self.weak_self
            .upgrade()
            .expect("session method called on a live session")
    }

    pub(crate) fn peer(&self) -> Option<Arc<Session>> {
        self.inner.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    /// The session's handle, once open.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.inner.lock().handle
    }

    /// The session's transport, once open.
    #[must_use]
    pub fn transport(&self) -> Option<Transport> {
        self.inner.lock().transport
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.inner.lock().listening
    }

    /// Allocate a handle and register with the machine.
    ///
    /// Fails if the session is already open.
    pub fn open(&self, transport: Transport) -> Result<()> {
        let machine = self.machine()?;
        let mut machine_inner = machine.inner.lock();
        let mut inner = self.inner.lock();

        if inner.handle.is_some() {
            return Err(Error::Invalid);
        }

        let handle = machine_inner.handles.allocate();
        machine_inner.sessions.insert(handle.as_raw(), self.this());

        *inner = SessionInner::new();
        inner.handle = Some(handle);
        inner.transport = Some(transport);

        debug!(handle = handle.as_raw(), transport = %transport, "session opened");
        Ok(())
    }

    /// Close the session, releasing its handle and port immediately for
    /// reuse. Close always succeeds; closing a closed session is a no-op.
    pub fn close(&self) -> Result<()> {
        let Ok(machine) = self.machine() else {
            return Ok(());
        };
        let mut machine_inner = machine.inner.lock();
        let mut inner = self.inner.lock();

        let Some(handle) = inner.handle.take() else {
            return Ok(());
        };

        machine_inner.sessions.remove(&handle.as_raw());
        machine_inner.handles.release(handle);

        if let (Some(transport), Some(port)) = (
            inner.transport,
            inner.source.as_ref().and_then(Endpoint::port),
        ) {
            if let Some(table) = machine_inner.ports.get_mut(&transport) {
                table.release(port);
            }
        }

        inner.closed = true;
        inner.listening = false;
        inner.connected = false;
        drop(inner);
        drop(machine_inner);

        // A closed peer reads as end-of-file.
        if let Some(peer) = self.peer() {
            {
                let mut peer_inner = peer.inner.lock();
                peer_inner.eof_pending = true;
            }
            peer.readable.notify_all();
        }

        machine.mark_activity();
        self.readable.notify_all();
        self.writable.notify_all();

        debug!(handle = handle.as_raw(), "session closed");
        Ok(())
    }

    /// Bind to `endpoint`, allocating an ephemeral port when the port is
    /// zero.
    pub fn bind(&self, endpoint: &Endpoint, reuse_address: bool) -> Result<()> {
        let machine = self.machine()?;
        let mut machine_inner = machine.inner.lock();
        let mut inner = self.inner.lock();

        let handle = inner.handle.ok_or(Error::Invalid)?;
        let transport = inner.transport.ok_or(Error::Invalid)?;
        if inner.source.is_some() {
            return Err(Error::Invalid);
        }
        if !transport.accepts(endpoint) {
            return Err(Error::Invalid);
        }

        let bound = match endpoint {
            Endpoint::Ip(_) => {
                let table = machine_inner
                    .ports
                    .entry(transport)
                    .or_insert_with(PortTable::new);
                let port = match endpoint.port() {
                    Some(0) | None => table.allocate_ephemeral(handle)?,
                    Some(port) => {
                        table.claim(port, handle, reuse_address)?;
                        port
                    }
                };
                endpoint.with_port(port)
            }
            Endpoint::Local(_) => endpoint.clone(),
        };

        inner.source = Some(bound.clone());
        trace!(handle = handle.as_raw(), endpoint = %bound, "session bound");
        Ok(())
    }

    /// The endpoint the session is bound to.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().source.clone().ok_or(Error::Invalid)
    }

    /// The endpoint the session is connected to.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        self.inner.lock().remote.clone().ok_or(Error::Invalid)
    }

    /// Set or clear blocking mode. Sessions start blocking.
    pub fn set_blocking(&self, blocking: bool) {
        self.inner.lock().blocking = blocking;
    }

    /// Set the send buffer size honored as backpressure.
    pub fn set_send_buffer_size(&self, size: usize) {
        self.inner.lock().send_buffer_size = size;
    }

    /// Set the receive buffer size honored as backpressure.
    pub fn set_receive_buffer_size(&self, size: usize) {
        self.inner.lock().receive_buffer_size = size;
    }

    /// Connect to `endpoint`.
    ///
    /// For datagram sessions this assigns the default remote endpoint.
    /// For stream sessions it registers a pending connection completed by
    /// the next step; the result is observable through the monitor or a
    /// blocking peer operation.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let machine = self.machine()?;
        let mut inner = self.inner.lock();

        let transport = inner.transport.ok_or(Error::Invalid)?;
        if !transport.accepts(endpoint) {
            return Err(Error::Invalid);
        }

        match transport.mode() {
            TransportMode::Datagram => {
                inner.remote = Some(endpoint.clone());
                Ok(())
            }
            TransportMode::Stream => {
                if inner.connected || inner.connect_result.is_some() {
                    return Err(Error::Invalid);
                }
                if inner.source.is_none() {
                    // Implicit bind to an ephemeral port in the peer's
                    // domain.
                    drop(inner);
                    let local = match endpoint {
                        Endpoint::Ip(addr) if addr.is_ipv4() => Endpoint::loopback_v4(0),
                        Endpoint::Ip(_) => Endpoint::loopback_v6(0),
                        Endpoint::Local(_) => return Err(Error::Invalid),
                    };
                    self.bind(&local, false)?;
                    inner = self.inner.lock();
                }
                let client = self.this();
                let target = endpoint.clone();
                drop(inner);

                let mut machine_inner = machine.inner.lock();
                machine_inner.pending_connects.push(PendingConnect {
                    client,
                    target,
                });
                drop(machine_inner);
                machine.mark_activity();
                Ok(())
            }
        }
    }

    /// Take the result of a pending stream connect, if one has resolved.
    pub fn take_connect_result(&self) -> Option<Result<()>> {
        self.inner.lock().connect_result.take()
    }

    /// Whether a stream session is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Mark the session as a passive listener with the given backlog.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let transport = inner.transport.ok_or(Error::Invalid)?;
        if transport.mode() != TransportMode::Stream {
            return Err(Error::Invalid);
        }
        if inner.source.is_none() {
            return Err(Error::Invalid);
        }
        inner.listening = true;
        inner.backlog_limit = backlog;
        Ok(())
    }

    /// Claim the next established connection.
    ///
    /// Blocking sessions wait; non-blocking sessions fail with
    /// would-block when the backlog is empty.
    pub fn accept(&self) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock();
        if !inner.listening {
            return Err(Error::Invalid);
        }
        loop {
            if let Some(server) = inner.backlog.pop_front() {
                return Ok(server);
            }
            if inner.closed {
                return Err(Error::Invalid);
            }
            if !inner.blocking {
                return Err(Error::WouldBlock);
            }
            self.readable.wait(&mut inner);
        }
    }

    /// Enqueue `data` for transmission.
    ///
    /// Datagram sessions enqueue whole messages toward `endpoint` (or the
    /// default remote); a full send buffer blocks or fails with
    /// would-block. Stream sessions enqueue any prefix that fits and
    /// return the accepted byte count.
    pub fn send(&self, data: &[u8], endpoint: Option<&Endpoint>) -> Result<usize> {
        let machine = self.machine()?;
        let mut inner = self.inner.lock();

        let transport = inner.transport.ok_or(Error::Invalid)?;
        if inner.shutdown_send {
            return Err(Error::Invalid);
        }

        let accepted = match transport.mode() {
            TransportMode::Datagram => {
                let source = inner.source.clone().ok_or(Error::Invalid)?;
                let destination = endpoint
                    .cloned()
                    .or_else(|| inner.remote.clone())
                    .ok_or(Error::Invalid)?;

                loop {
                    if inner.outbound_size + data.len() <= inner.send_buffer_size {
                        break;
                    }
                    if !inner.blocking {
                        return Err(Error::WouldBlock);
                    }
                    self.writable.wait(&mut inner);
                    if inner.shutdown_send || inner.closed {
                        return Err(Error::Invalid);
                    }
                }

                inner.outbound_size += data.len();
                inner.outbound.push_back(Packet {
                    source,
                    destination: Some(destination),
                    data: Bytes::copy_from_slice(data),
                });
                data.len()
            }
            TransportMode::Stream => {
                if !inner.connected {
                    return Err(Error::Invalid);
                }
                let source = inner.source.clone().ok_or(Error::Invalid)?;

                let room = loop {
                    let room = inner.send_buffer_size.saturating_sub(inner.outbound_size);
                    if room > 0 {
                        break room;
                    }
                    if !inner.blocking {
                        return Err(Error::WouldBlock);
                    }
                    self.writable.wait(&mut inner);
                    if inner.shutdown_send || inner.closed {
                        return Err(Error::Invalid);
                    }
                };

                let accepted = room.min(data.len());
                inner.outbound_size += accepted;
                inner.outbound.push_back(Packet {
                    source,
                    destination: None,
                    data: Bytes::copy_from_slice(&data[..accepted]),
                });
                accepted
            }
        };

        drop(inner);
        machine.mark_activity();
        Ok(accepted)
    }

    /// Dequeue inbound data.
    ///
    /// Datagram sessions yield one whole message; stream sessions yield
    /// up to `max` bytes (bounded by the receive buffer size). Returns
    /// `Eof` when the peer has shut down and no data remains.
    pub fn receive(&self, max: usize) -> Result<(Bytes, Endpoint)> {
        let mut inner = self.inner.lock();
        let transport = inner.transport.ok_or(Error::Invalid)?;

        loop {
            if transport.mode() == TransportMode::Datagram {
                if let Some(packet) = inner.inbound.pop_front() {
                    inner.inbound_size -= packet.data.len();
                    self.writable.notify_all();
                    return Ok((packet.data, packet.source));
                }
            } else if !inner.inbound.is_empty() {
                let cap = max.min(inner.receive_buffer_size).max(1);
                let source = inner.inbound.front().expect("checked non-empty").source.clone();
                let mut out = bytes::BytesMut::new();
                while out.len() < cap {
                    let Some(mut packet) = inner.inbound.pop_front() else {
                        break;
                    };
                    let want = cap - out.len();
                    if packet.data.len() <= want {
                        inner.inbound_size -= packet.data.len();
                        out.extend_from_slice(&packet.data);
                    } else {
                        let taken = packet.data.split_to(want);
                        inner.inbound_size -= taken.len();
                        out.extend_from_slice(&taken);
                        inner.inbound.push_front(packet);
                        break;
                    }
                }
                if let Some(peer) = inner.peer.as_ref().and_then(Weak::upgrade) {
                    peer.writable.notify_all();
                }
                if let Ok(machine) = self.machine() {
                    machine.mark_activity();
                }
                return Ok((out.freeze(), source));
            }

            if inner.shutdown_receive || inner.eof_pending {
                return Err(Error::Eof);
            }
            if !inner.blocking {
                return Err(Error::WouldBlock);
            }
            self.readable.wait(&mut inner);
            if inner.closed {
                return Err(Error::Invalid);
            }
        }
    }

    /// Shut down one or both directions.
    ///
    /// A stream peer observes end-of-file at the next read once the
    /// shutdown marker and the data ahead of it have been delivered.
    pub fn shutdown(&self, direction: Direction) -> Result<()> {
        let machine = self.machine()?;
        let mut inner = self.inner.lock();
        if inner.handle.is_none() {
            return Err(Error::Invalid);
        }

        if direction.includes_send() {
            inner.shutdown_send = true;
        }
        if direction.includes_receive() {
            inner.shutdown_receive = true;
        }
        drop(inner);

        self.readable.notify_all();
        self.writable.notify_all();
        machine.mark_activity();
        Ok(())
    }

    /// Readiness as the monitor reports it.
    pub(crate) fn poll(&self) -> (bool, bool) {
        let inner = self.inner.lock();
        let readable = !inner.inbound.is_empty()
            || inner.eof_pending
            || !inner.backlog.is_empty()
            || inner.connect_result.as_ref().is_some_and(std::result::Result::is_err);
        let has_space = inner.outbound_size < inner.send_buffer_size;
        let transport_ready = match inner.transport.as_ref().map(Transport::mode) {
            Some(TransportMode::Datagram) => inner.source.is_some(),
            Some(TransportMode::Stream) => inner.connected,
            None => false,
        };
        let writable = transport_ready && has_space && !inner.shutdown_send;
        (readable, writable)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("handle", &inner.handle)
            .field("transport", &inner.transport)
            .field("source", &inner.source)
            .field("remote", &inner.remote)
            .field("inbound", &inner.inbound.len())
            .field("outbound", &inner.outbound.len())
            .finish()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Machine")
            .field("sessions", &inner.sessions.len())
            .field("running", &inner.running)
            .finish()
    }
}

/// Process-wide registry of named machines.
///
/// Lets a test fixture and the code under test agree on a machine without
/// threading it through every constructor.
static MACHINE_REGISTRY: Lazy<DashMap<String, Arc<Machine>>> = Lazy::new(DashMap::new);

/// Register `machine` under `name`, replacing any previous registration.
pub fn register_machine(name: impl Into<String>, machine: Arc<Machine>) {
    MACHINE_REGISTRY.insert(name.into(), machine);
}

/// Look up the machine registered under `name`.
#[must_use]
pub fn find_machine(name: &str) -> Option<Arc<Machine>> {
    MACHINE_REGISTRY.get(name).map(|entry| Arc::clone(&entry))
}

/// Remove the registration under `name`.
pub fn unregister_machine(name: &str) {
    MACHINE_REGISTRY.remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_pool_gap_reuse() {
        let mut pool = HandlePool::new();
        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();
        assert_eq!(a.as_raw(), 3);
        assert_eq!(b.as_raw(), 4);
        assert_eq!(c.as_raw(), 5);

        pool.release(b);
        assert_eq!(pool.allocate().as_raw(), 4);
        assert_eq!(pool.allocate().as_raw(), 6);
    }

    #[test]
    fn test_port_table_gap_reuse() {
        let mut table = PortTable::new();
        let h = Handle::from_raw(3);
        assert_eq!(table.allocate_ephemeral(h).unwrap(), 49152);
        assert_eq!(table.allocate_ephemeral(h).unwrap(), 49153);
        assert_eq!(table.allocate_ephemeral(h).unwrap(), 49154);

        table.release(49153);
        assert_eq!(table.allocate_ephemeral(h).unwrap(), 49153);
    }

    #[test]
    fn test_port_table_explicit_claim() {
        let mut table = PortTable::new();
        let h = Handle::from_raw(3);
        table.claim(5555, h, false).unwrap();
        assert_eq!(table.claim(5555, h, false), Err(Error::Invalid));
        table.claim(5555, h, true).unwrap();
    }

    #[test]
    fn test_session_requires_open_before_bind() {
        let machine = Machine::new();
        let session = machine.create_session();
        assert_eq!(
            session.bind(&Endpoint::loopback_v4(0), false),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn test_machine_registry() {
        let machine = Machine::new();
        register_machine("test-registry", Arc::clone(&machine));
        assert!(find_machine("test-registry").is_some());
        unregister_machine("test-registry");
        assert!(find_machine("test-registry").is_none());
    }

    #[test]
    fn test_source_endpoint_before_bind_fails() {
        let machine = Machine::new();
        let session = machine.create_session();
        session.open(Transport::Udp4).unwrap();
        assert_eq!(session.source_endpoint(), Err(Error::Invalid));
        session.close().unwrap();
    }
}
