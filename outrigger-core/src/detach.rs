//! Dispatcher-detachment coordination.
//!
//! A socket must be removed from the dispatcher's observation set before
//! its handle can be closed or exported. The detach operation is initiated
//! once and latches until the dispatcher confirms; no completion for the
//! socket may arrive after the confirmation.

use crate::error::{Error, Result};

/// Why the socket is detaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachGoal {
    /// The handle will be closed once detached.
    Close,
    /// The handle will be surrendered to the caller once detached.
    Export,
}

/// Progress of the detach operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachMode {
    /// No detach is in progress.
    Idle,
    /// Detach was requested and the dispatcher has not yet confirmed.
    Initiated,
}

/// Coordinates dispatcher detachment with shutdown.
#[derive(Debug)]
pub struct DetachState {
    goal: DetachGoal,
    mode: DetachMode,
}

impl Default for DetachState {
    fn default() -> Self {
        Self::new()
    }
}

impl DetachState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            goal: DetachGoal::Close,
            mode: DetachMode::Idle,
        }
    }

    #[inline]
    #[must_use]
    pub const fn goal(&self) -> DetachGoal {
        self.goal
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> DetachMode {
        self.mode
    }

    /// Whether a detach is in progress.
    #[inline]
    #[must_use]
    pub const fn initiated(&self) -> bool {
        matches!(self.mode, DetachMode::Initiated)
    }

    /// Record the detach goal without initiating.
    pub fn set_goal(&mut self, goal: DetachGoal) {
        self.goal = goal;
    }

    /// Initiate a detach toward `goal`.
    ///
    /// Fails with `Invalid` if a detach is already in progress.
    pub fn initiate(&mut self, goal: DetachGoal) -> Result<()> {
        if self.initiated() {
            return Err(Error::Invalid);
        }
        self.goal = goal;
        self.mode = DetachMode::Initiated;
        Ok(())
    }

    /// Record the dispatcher's acknowledgement.
    ///
    /// Returns the goal the detach was initiated with. Fails with `Invalid`
    /// if no detach was in progress.
    pub fn complete(&mut self) -> Result<DetachGoal> {
        if !self.initiated() {
            return Err(Error::Invalid);
        }
        self.mode = DetachMode::Idle;
        Ok(self.goal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiate_latches() {
        let mut state = DetachState::new();
        assert!(!state.initiated());

        state.initiate(DetachGoal::Close).unwrap();
        assert!(state.initiated());

        // A second initiation is rejected until the dispatcher confirms.
        assert_eq!(state.initiate(DetachGoal::Export), Err(Error::Invalid));
    }

    #[test]
    fn test_complete_returns_goal() {
        let mut state = DetachState::new();
        state.initiate(DetachGoal::Export).unwrap();
        assert_eq!(state.complete().unwrap(), DetachGoal::Export);
        assert!(!state.initiated());
    }

    #[test]
    fn test_complete_without_initiate() {
        let mut state = DetachState::new();
        assert_eq!(state.complete(), Err(Error::Invalid));
    }
}
