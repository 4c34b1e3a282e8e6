//! Flow-control state for a single socket.
//!
//! Each direction carries an enable bit governing whether the engine will
//! currently submit requests of that direction to the dispatcher, plus a
//! lock flag preventing an unlock by a caller that did not lock. Closing the
//! state drops both bits permanently.

use crate::transport::Direction;

/// Snapshot of the enable bits after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlContext {
    /// Whether the engine may now submit send requests.
    pub enable_send: bool,
    /// Whether the engine may now submit receive requests.
    pub enable_receive: bool,
}

/// Paired send/receive enable bits with lock/unlock semantics.
#[derive(Debug)]
pub struct FlowControlState {
    send_enabled: bool,
    send_locked: bool,
    receive_enabled: bool,
    receive_locked: bool,
    closed: bool,
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControlState {
    /// Create flow-control state with both directions enabled and unlocked.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            send_enabled: true,
            send_locked: false,
            receive_enabled: true,
            receive_locked: false,
            closed: false,
        }
    }

    /// Whether the engine may currently submit send requests.
    #[inline]
    #[must_use]
    pub const fn want_send(&self) -> bool {
        self.send_enabled
    }

    /// Whether the engine may currently submit receive requests.
    #[inline]
    #[must_use]
    pub const fn want_receive(&self) -> bool {
        self.receive_enabled
    }

    /// Whether flow control has been closed.
    #[inline]
    #[must_use]
    pub const fn closed(&self) -> bool {
        self.closed
    }

    fn context(&self) -> FlowControlContext {
        FlowControlContext {
            enable_send: self.send_enabled,
            enable_receive: self.receive_enabled,
        }
    }

    /// Set the enable bit in `direction`.
    ///
    /// A locked direction is skipped unless `unlock` is true, in which case
    /// the lock is released as the bit is set. Returns the new enable bits
    /// when any bit changed, `None` otherwise. Relaxing a closed state never
    /// changes anything.
    pub fn relax(&mut self, direction: Direction, unlock: bool) -> Option<FlowControlContext> {
        if self.closed {
            return None;
        }

        let mut changed = false;

        if direction.includes_send() && !self.send_enabled && (!self.send_locked || unlock) {
            self.send_enabled = true;
            if unlock {
                self.send_locked = false;
            }
            changed = true;
        }

        if direction.includes_receive()
            && !self.receive_enabled
            && (!self.receive_locked || unlock)
        {
            self.receive_enabled = true;
            if unlock {
                self.receive_locked = false;
            }
            changed = true;
        }

        changed.then(|| self.context())
    }

    /// Clear the enable bit in `direction`, optionally locking it so only a
    /// caller that passes `unlock` may set it again.
    ///
    /// Returns the new enable bits when any bit changed, `None` otherwise.
    pub fn apply(&mut self, direction: Direction, lock: bool) -> Option<FlowControlContext> {
        if self.closed {
            return None;
        }

        let mut changed = false;

        if direction.includes_send() {
            if self.send_enabled {
                self.send_enabled = false;
                changed = true;
            }
            if lock {
                self.send_locked = true;
            }
        }

        if direction.includes_receive() {
            if self.receive_enabled {
                self.receive_enabled = false;
                changed = true;
            }
            if lock {
                self.receive_locked = true;
            }
        }

        changed.then(|| self.context())
    }

    /// Permanently clear both enable bits.
    pub fn close(&mut self) {
        self.closed = true;
        self.send_enabled = false;
        self.receive_enabled = false;
    }
}
