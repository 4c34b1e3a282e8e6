//! Shutdown sequencing for a single socket.
//!
//! Shutdown progresses independently per direction and may originate
//! locally or at the peer. Transitions out of the initial state are
//! one-shot; the half-open policy decides whether shutting down one
//! direction drags the other along.

/// Where a shutdown originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// Initiated by this side of the connection.
    Source,
    /// Observed from the peer.
    Remote,
}

/// What a shutdown transition just did.
///
/// Populated by the `try_shutdown_*` methods with exactly the transitions
/// that happened during that call; callers announce one event per flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownContext {
    /// The origin of the transition.
    pub origin: ShutdownOrigin,
    /// The overall shutdown sequence started with this call.
    pub initiated: bool,
    /// The send direction transitioned with this call.
    pub send: bool,
    /// The receive direction transitioned with this call.
    pub receive: bool,
    /// Both directions have now completed.
    pub completed: bool,
}

#[derive(Debug, Default)]
struct DirectionState {
    initiated: bool,
    completed: bool,
}

/// Tracks half-close progress per direction and origin.
#[derive(Debug, Default)]
pub struct ShutdownState {
    send: DirectionState,
    receive: DirectionState,
    origin: Option<ShutdownOrigin>,
}

impl ShutdownState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether data may still be sent.
    #[inline]
    #[must_use]
    pub const fn can_send(&self) -> bool {
        !self.send.initiated
    }

    /// Whether data may still be received.
    #[inline]
    #[must_use]
    pub const fn can_receive(&self) -> bool {
        !self.receive.initiated
    }

    /// Whether both directions have completed.
    #[inline]
    #[must_use]
    pub const fn completed(&self) -> bool {
        self.send.completed && self.receive.completed
    }

    /// The origin of the first transition, if any occurred.
    #[inline]
    #[must_use]
    pub const fn origin(&self) -> Option<ShutdownOrigin> {
        self.origin
    }

    /// Try to initiate shutdown of the send direction.
    ///
    /// If sending is still possible, marks it initiated and completed; when
    /// `keep_half_open` is false, or receive has already completed, the
    /// receive direction is transitioned in the same call. Returns `None`
    /// if the send direction already transitioned.
    pub fn try_shutdown_send(
        &mut self,
        origin: ShutdownOrigin,
        keep_half_open: bool,
    ) -> Option<ShutdownContext> {
        if self.send.initiated {
            return None;
        }

        let initiated = self.origin.is_none();
        if initiated {
            self.origin = Some(origin);
        }

        self.send.initiated = true;
        self.send.completed = true;

        let mut receive = false;
        if !keep_half_open && !self.receive.initiated {
            self.receive.initiated = true;
            self.receive.completed = true;
            receive = true;
        }

        Some(ShutdownContext {
            origin,
            initiated,
            send: true,
            receive,
            completed: self.completed(),
        })
    }

    /// Try to initiate shutdown of the receive direction.
    ///
    /// Analogous to [`try_shutdown_send`](Self::try_shutdown_send).
    pub fn try_shutdown_receive(
        &mut self,
        origin: ShutdownOrigin,
        keep_half_open: bool,
    ) -> Option<ShutdownContext> {
        if self.receive.initiated {
            return None;
        }

        let initiated = self.origin.is_none();
        if initiated {
            self.origin = Some(origin);
        }

        self.receive.initiated = true;
        self.receive.completed = true;

        let mut send = false;
        if !keep_half_open && !self.send.initiated {
            self.send.initiated = true;
            self.send.completed = true;
            send = true;
        }

        Some(ShutdownContext {
            origin,
            initiated,
            send,
            receive: true,
            completed: self.completed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_shutdown_from_send() {
        let mut state = ShutdownState::new();
        let ctx = state
            .try_shutdown_send(ShutdownOrigin::Source, false)
            .unwrap();

        assert!(ctx.initiated);
        assert!(ctx.send);
        assert!(ctx.receive);
        assert!(ctx.completed);
        assert!(!state.can_send());
        assert!(!state.can_receive());
    }

    #[test]
    fn test_half_open_keeps_receive() {
        let mut state = ShutdownState::new();
        let ctx = state
            .try_shutdown_send(ShutdownOrigin::Source, true)
            .unwrap();

        assert!(ctx.send);
        assert!(!ctx.receive);
        assert!(!ctx.completed);
        assert!(state.can_receive());

        let ctx = state
            .try_shutdown_receive(ShutdownOrigin::Remote, true)
            .unwrap();
        assert!(ctx.receive);
        assert!(!ctx.initiated);
        assert!(ctx.completed);
        assert!(state.completed());
    }

    #[test]
    fn test_transitions_are_one_shot() {
        let mut state = ShutdownState::new();
        assert!(state
            .try_shutdown_send(ShutdownOrigin::Source, true)
            .is_some());
        assert!(state
            .try_shutdown_send(ShutdownOrigin::Source, true)
            .is_none());
        assert!(state
            .try_shutdown_send(ShutdownOrigin::Remote, false)
            .is_none());
    }

    #[test]
    fn test_origin_is_first_transition() {
        let mut state = ShutdownState::new();
        state.try_shutdown_receive(ShutdownOrigin::Remote, true);
        state.try_shutdown_send(ShutdownOrigin::Source, true);
        assert_eq!(state.origin(), Some(ShutdownOrigin::Remote));
    }
}
