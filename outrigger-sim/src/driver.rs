//! A dispatcher backed by the simulated machine.
//!
//! `SimDriver` implements the engine's [`Driver`] interface over a
//! [`Machine`]: submissions are recorded and a pump thread completes them
//! as the simulation makes them possible, delivering completions on a
//! single strand so each socket observes them serialized. Timers run on
//! the core wheel; functors run on a thread-pool executor.
//!
//! Submissions never complete from within the submitting call, so the
//! engine can hold its socket mutex across a submission without
//! reentrancy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::trace;

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::strand::{Executor, Functor, Strand, ThreadExecutor};
use outrigger_core::timer::{Timer, TimerWheel};
use outrigger_core::transport::{Direction, Handle, Transport};

use outrigger_engine::driver::{
    Driver, DriverReceiveOptions, DriverSendOptions, DriverSocket, ReceivedData, SocketFactory,
};

use crate::machine::{Machine, Session};

struct PendingSend {
    remaining: Bytes,
    endpoint: Option<Endpoint>,
    written: usize,
}

struct DriverInner {
    sessions: HashMap<u32, Arc<Session>>,
    sockets: HashMap<u32, Arc<dyn DriverSocket>>,
    pending_sends: HashMap<u32, PendingSend>,
    pending_receives: HashMap<u32, usize>,
    pending_connects: HashSet<u32>,
    pending_accepts: HashSet<u32>,
    pending_detaches: Vec<u32>,
    cancels: HashSet<u32>,
    running: bool,
}

/// A [`Driver`] implementation over the simulated machine.
pub struct SimDriver {
    machine: Arc<Machine>,
    executor: Arc<ThreadExecutor>,
    completions: Arc<Strand>,
    wheel: Arc<TimerWheel>,
    inner: Mutex<DriverInner>,
    pump: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SimDriver {
    /// Create a driver over `machine` with `threads` completion workers
    /// (0 uses one per CPU) and start its pump.
    #[must_use]
    pub fn new(machine: Arc<Machine>, threads: usize) -> Arc<Self> {
        let executor = ThreadExecutor::new(threads);
        let completions = Strand::new(Arc::clone(&executor) as Arc<dyn Executor>);
        let wheel = TimerWheel::new(Arc::clone(&executor) as Arc<dyn Executor>);

        let driver = Arc::new(Self {
            machine,
            executor,
            completions,
            wheel,
            inner: Mutex::new(DriverInner {
                sessions: HashMap::new(),
                sockets: HashMap::new(),
                pending_sends: HashMap::new(),
                pending_receives: HashMap::new(),
                pending_connects: HashSet::new(),
                pending_accepts: HashSet::new(),
                pending_detaches: Vec::new(),
                cancels: HashSet::new(),
                running: true,
            }),
            pump: Mutex::new(None),
        });

        let pumping = Arc::clone(&driver);
        let pump = std::thread::Builder::new()
            .name("outrigger-sim-driver".into())
            .spawn(move || {
                loop {
                    if !pumping.inner.lock().running {
                        break;
                    }
                    let _ = pumping.machine.step(false);
                    pumping.process();
                    pumping.machine_wait();
                }
            })
            .expect("failed to spawn driver pump");
        *driver.pump.lock() = Some(pump);

        driver
    }

    /// The machine this driver pumps.
    #[must_use]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Stop the pump, the timers, and the completion workers.
    ///
    /// Pending submissions are dropped without completion.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.running = false;
        }
        self.machine.mark_activity();
        if let Some(pump) = self.pump.lock().take() {
            let _ = pump.join();
        }
        self.wheel.stop();
        self.executor.shutdown();
    }

    fn machine_wait(&self) {
        self.machine.wait_activity(Duration::from_millis(2));
    }

    fn session(&self, handle: Handle) -> Result<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .get(&handle.as_raw())
            .cloned()
            .ok_or(Error::Invalid)
    }

    fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.completions.post(Box::new(f));
    }

    /// Complete whatever the simulation has made possible.
    fn process(&self) {
        let mut inner = self.inner.lock();

        // Detach acknowledgements: drop pending submissions, then post
        // the acknowledgement. Nothing completes for the socket after it.
        let detaches = std::mem::take(&mut inner.pending_detaches);
        for raw in detaches {
            inner.pending_sends.remove(&raw);
            inner.pending_receives.remove(&raw);
            inner.pending_connects.remove(&raw);
            inner.pending_accepts.remove(&raw);
            inner.cancels.remove(&raw);
            if let Some(socket) = inner.sockets.remove(&raw) {
                trace!(handle = raw, "detach acknowledged");
                self.post(move || socket.process_socket_detached());
            }
        }

        // Cancellations: fail whatever is still pending on the handle.
        let cancels = std::mem::take(&mut inner.cancels);
        for raw in cancels {
            let Some(socket) = inner.sockets.get(&raw).cloned() else {
                continue;
            };
            if inner.pending_sends.remove(&raw).is_some() {
                let socket = Arc::clone(&socket);
                self.post(move || socket.process_socket_sent(Err(Error::Cancelled)));
            }
            if inner.pending_receives.remove(&raw).is_some() {
                let socket = Arc::clone(&socket);
                self.post(move || socket.process_socket_received(Err(Error::Cancelled)));
            }
            if inner.pending_connects.remove(&raw) {
                let socket = Arc::clone(&socket);
                self.post(move || socket.process_socket_connected(Err(Error::Cancelled)));
            }
            if inner.pending_accepts.remove(&raw) {
                let socket = Arc::clone(&socket);
                self.post(move || socket.process_socket_accepted(Err(Error::Cancelled)));
            }
        }

        // Connect completions.
        let connects: Vec<u32> = inner.pending_connects.iter().copied().collect();
        for raw in connects {
            let (Some(session), Some(socket)) = (
                inner.sessions.get(&raw).cloned(),
                inner.sockets.get(&raw).cloned(),
            ) else {
                inner.pending_connects.remove(&raw);
                continue;
            };
            if let Some(result) = session.take_connect_result() {
                inner.pending_connects.remove(&raw);
                self.post(move || socket.process_socket_connected(result));
            }
        }

        // Accept completions.
        let accepts: Vec<u32> = inner.pending_accepts.iter().copied().collect();
        for raw in accepts {
            let (Some(session), Some(socket)) = (
                inner.sessions.get(&raw).cloned(),
                inner.sockets.get(&raw).cloned(),
            ) else {
                inner.pending_accepts.remove(&raw);
                continue;
            };
            match session.accept() {
                Ok(server) => {
                    inner.pending_accepts.remove(&raw);
                    server.set_blocking(false);
                    let Some(handle) = server.handle() else {
                        continue;
                    };
                    let peer = server
                        .remote_endpoint()
                        .unwrap_or(Endpoint::loopback_v4(0));
                    inner.sessions.insert(handle.as_raw(), server);
                    self.post(move || socket.process_socket_accepted(Ok((handle, peer))));
                }
                Err(Error::WouldBlock) => {}
                Err(error) => {
                    inner.pending_accepts.remove(&raw);
                    self.post(move || socket.process_socket_accepted(Err(error)));
                }
            }
        }

        // Send progress.
        let sends: Vec<u32> = inner.pending_sends.keys().copied().collect();
        for raw in sends {
            let (Some(session), Some(socket)) = (
                inner.sessions.get(&raw).cloned(),
                inner.sockets.get(&raw).cloned(),
            ) else {
                inner.pending_sends.remove(&raw);
                continue;
            };
            let Some(pending) = inner.pending_sends.get_mut(&raw) else {
                continue;
            };

            match session.send(&pending.remaining, pending.endpoint.as_ref()) {
                Ok(accepted) => {
                    pending.written += accepted;
                    pending.remaining.advance(accepted);
                    if pending.remaining.is_empty() {
                        let written = pending.written;
                        inner.pending_sends.remove(&raw);
                        self.post(move || socket.process_socket_sent(Ok(written)));
                    }
                }
                Err(Error::WouldBlock) => {}
                Err(error) => {
                    inner.pending_sends.remove(&raw);
                    self.post(move || socket.process_socket_sent(Err(error)));
                }
            }
        }

        // Receive completions.
        let receives: Vec<u32> = inner.pending_receives.keys().copied().collect();
        for raw in receives {
            let (Some(session), Some(socket)) = (
                inner.sessions.get(&raw).cloned(),
                inner.sockets.get(&raw).cloned(),
            ) else {
                inner.pending_receives.remove(&raw);
                continue;
            };
            let Some(max) = inner.pending_receives.get(&raw).copied() else {
                continue;
            };

            match session.receive(max) {
                Ok((data, source)) => {
                    inner.pending_receives.remove(&raw);
                    self.post(move || {
                        socket.process_socket_received(Ok(ReceivedData {
                            data,
                            endpoint: Some(source),
                        }));
                    });
                }
                Err(Error::WouldBlock) => {}
                Err(error) => {
                    inner.pending_receives.remove(&raw);
                    self.post(move || socket.process_socket_received(Err(error)));
                }
            }
        }
    }
}

impl SocketFactory for SimDriver {
    fn open_socket(&self, transport: Transport) -> Result<Handle> {
        let session = self.machine.create_session();
        session.open(transport)?;
        // The pump must never block on a session operation.
        session.set_blocking(false);
        let handle = session.handle().ok_or(Error::Invalid)?;
        self.inner.lock().sessions.insert(handle.as_raw(), session);
        Ok(handle)
    }

    fn bind_socket(
        &self,
        handle: Handle,
        endpoint: &Endpoint,
        reuse_address: bool,
    ) -> Result<Endpoint> {
        let session = self.session(handle)?;
        session.bind(endpoint, reuse_address)?;
        session.source_endpoint()
    }

    fn connect_socket(&self, handle: Handle, endpoint: &Endpoint) -> Result<()> {
        self.session(handle)?.connect(endpoint)
    }

    fn listen_socket(&self, handle: Handle, backlog: usize) -> Result<()> {
        self.session(handle)?.listen(backlog)
    }

    fn shutdown_socket(&self, handle: Handle, direction: Direction) -> Result<()> {
        self.session(handle)?.shutdown(direction)
    }

    fn close_socket(&self, handle: Handle) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock();
            inner.sockets.remove(&handle.as_raw());
            inner.sessions.remove(&handle.as_raw())
        };
        match session {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    fn source_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        self.session(handle)?.source_endpoint()
    }

    fn remote_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        self.session(handle)?.remote_endpoint()
    }

    fn set_send_buffer_size(&self, handle: Handle, size: usize) -> Result<()> {
        self.session(handle)?.set_send_buffer_size(size);
        Ok(())
    }

    fn set_receive_buffer_size(&self, handle: Handle, size: usize) -> Result<()> {
        self.session(handle)?.set_receive_buffer_size(size);
        Ok(())
    }
}

impl Driver for SimDriver {
    fn attach_socket(&self, socket: Arc<dyn DriverSocket>) -> Result<()> {
        let handle = socket.handle().ok_or(Error::Invalid)?;
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner.sockets.insert(handle.as_raw(), socket);
        Ok(())
    }

    fn detach_socket(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sockets.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner.pending_detaches.push(handle.as_raw());
        drop(inner);
        self.machine.mark_activity();
        Ok(())
    }

    fn connect(&self, handle: Handle, endpoint: &Endpoint) -> Result<()> {
        let session = self.session(handle)?;
        session.connect(endpoint)?;
        self.inner.lock().pending_connects.insert(handle.as_raw());
        self.machine.mark_activity();
        Ok(())
    }

    fn accept(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner.pending_accepts.insert(handle.as_raw());
        drop(inner);
        self.machine.mark_activity();
        Ok(())
    }

    fn send(&self, handle: Handle, data: Bytes, options: &DriverSendOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        if inner.pending_sends.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner.pending_sends.insert(
            handle.as_raw(),
            PendingSend {
                remaining: data,
                endpoint: options.endpoint.clone(),
                written: 0,
            },
        );
        drop(inner);
        self.machine.mark_activity();
        Ok(())
    }

    fn receive(&self, handle: Handle, options: &DriverReceiveOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        if inner.pending_receives.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner
            .pending_receives
            .insert(handle.as_raw(), options.max_size);
        drop(inner);
        self.machine.mark_activity();
        Ok(())
    }

    fn cancel(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sockets.contains_key(&handle.as_raw()) {
            return Err(Error::Invalid);
        }
        inner.cancels.insert(handle.as_raw());
        drop(inner);
        self.machine.mark_activity();
        Ok(())
    }

    fn create_strand(&self) -> Arc<Strand> {
        Strand::new(Arc::clone(&self.executor) as Arc<dyn Executor>)
    }

    fn create_timer(&self, deadline: Instant, callback: Functor) -> Timer {
        self.wheel.schedule(deadline, callback)
    }

    fn execute(&self, f: Functor) {
        self.executor.execute(f);
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor) as Arc<dyn Executor>
    }

    fn max_threads(&self) -> usize {
        self.executor.threads()
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimDriver")
            .field("sessions", &inner.sessions.len())
            .field("sockets", &inner.sockets.len())
            .field("running", &inner.running)
            .finish()
    }
}
