//! Readiness monitoring over simulated sessions.
//!
//! The monitor mirrors a readiness-based reactor: callers register
//! sessions, express interest in readability or writability, and dequeue
//! events consistent with the sessions' buffer state. Used by
//! non-blocking tests and by the simulated dispatcher's pump.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use outrigger_core::error::{Error, Result};
use outrigger_core::transport::Handle;

use crate::machine::{Machine, Session};

/// The readiness a caller can express interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// One readiness event.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    /// The session's handle.
    pub handle: Handle,
    /// Data (or an accepted connection, or end-of-file) can be read.
    pub readable: bool,
    /// Buffer space is available for writing.
    pub writable: bool,
}

struct Registration {
    session: Arc<Session>,
    readable: bool,
    writable: bool,
}

/// A readiness mirror over one machine's sessions.
pub struct Monitor {
    machine: Arc<Machine>,
    registrations: Mutex<HashMap<u32, Registration>>,
}

impl Monitor {
    /// Create a monitor over `machine`.
    #[must_use]
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Register `session` with no interests.
    pub fn add(&self, session: Arc<Session>) -> Result<()> {
        let handle = session.handle().ok_or(Error::Invalid)?;
        self.registrations.lock().insert(
            handle.as_raw(),
            Registration {
                session,
                readable: false,
                writable: false,
            },
        );
        Ok(())
    }

    /// Deregister `session`.
    pub fn remove(&self, session: &Arc<Session>) -> Result<()> {
        let handle = session.handle().ok_or(Error::Invalid)?;
        self.registrations
            .lock()
            .remove(&handle.as_raw())
            .map(|_| ())
            .ok_or(Error::Invalid)
    }

    /// Express interest in `interest` for `session`.
    pub fn show(&self, session: &Arc<Session>, interest: Interest) -> Result<()> {
        let handle = session.handle().ok_or(Error::Invalid)?;
        let mut registrations = self.registrations.lock();
        let registration = registrations
            .get_mut(&handle.as_raw())
            .ok_or(Error::Invalid)?;
        match interest {
            Interest::Readable => registration.readable = true,
            Interest::Writable => registration.writable = true,
        }
        Ok(())
    }

    /// Withdraw interest in `interest` for `session`.
    pub fn hide(&self, session: &Arc<Session>, interest: Interest) -> Result<()> {
        let handle = session.handle().ok_or(Error::Invalid)?;
        let mut registrations = self.registrations.lock();
        let registration = registrations
            .get_mut(&handle.as_raw())
            .ok_or(Error::Invalid)?;
        match interest {
            Interest::Readable => registration.readable = false,
            Interest::Writable => registration.writable = false,
        }
        Ok(())
    }

    /// Gather current readiness into `events` without waiting.
    ///
    /// Returns the number of events gathered.
    pub fn poll(&self, events: &mut Vec<MonitorEvent>) -> usize {
        let registrations = self.registrations.lock();
        let before = events.len();
        for (raw, registration) in registrations.iter() {
            let (readable, writable) = registration.session.poll();
            let readable = readable && registration.readable;
            let writable = writable && registration.writable;
            if readable || writable {
                events.push(MonitorEvent {
                    handle: Handle::from_raw(*raw),
                    readable,
                    writable,
                });
            }
        }
        events.len() - before
    }

    /// Wait until at least one registered interest is ready and append
    /// the readiness events to `events`.
    pub fn dequeue(&self, events: &mut Vec<MonitorEvent>) -> Result<()> {
        loop {
            if self.poll(events) > 0 {
                return Ok(());
            }
            self.machine.wait_activity(Duration::from_millis(10));
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("registrations", &self.registrations.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrigger_core::endpoint::Endpoint;
    use outrigger_core::transport::Transport;

    #[test]
    fn test_show_requires_add() {
        let machine = Machine::new();
        let session = machine.create_session();
        session.open(Transport::Udp4).unwrap();

        let monitor = Monitor::new(Arc::clone(&machine));
        assert_eq!(
            monitor.show(&session, Interest::Readable),
            Err(Error::Invalid)
        );

        monitor.add(Arc::clone(&session)).unwrap();
        monitor.show(&session, Interest::Readable).unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_poll_reports_writable_datagram() {
        let machine = Machine::new();
        let session = machine.create_session();
        session.open(Transport::Udp4).unwrap();
        session.bind(&Endpoint::loopback_v4(0), false).unwrap();

        let monitor = Monitor::new(Arc::clone(&machine));
        monitor.add(Arc::clone(&session)).unwrap();
        monitor.show(&session, Interest::Writable).unwrap();

        let mut events = Vec::new();
        assert_eq!(monitor.poll(&mut events), 1);
        assert!(events[0].writable);
        assert!(!events[0].readable);
        session.close().unwrap();
    }

    #[test]
    fn test_hidden_interest_is_silent() {
        let machine = Machine::new();
        let session = machine.create_session();
        session.open(Transport::Udp4).unwrap();
        session.bind(&Endpoint::loopback_v4(0), false).unwrap();

        let monitor = Monitor::new(Arc::clone(&machine));
        monitor.add(Arc::clone(&session)).unwrap();
        monitor.show(&session, Interest::Writable).unwrap();
        monitor.hide(&session, Interest::Writable).unwrap();

        let mut events = Vec::new();
        assert_eq!(monitor.poll(&mut events), 0);
        session.close().unwrap();
    }
}
