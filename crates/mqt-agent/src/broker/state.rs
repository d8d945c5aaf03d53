//! Connection state machine

use mqt_core::ConnectionState;
use tokio::sync::watch;

/// Inputs that move the connection between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `connect()` was called
    Connect,
    /// The broker accepted the session
    Established,
    /// A connection attempt failed
    Failed,
    /// An established session dropped
    Lost,
    /// `close()` was called
    Close,
}

/// The state reached from `current` on `transition`, or `None` when the
/// transition is not allowed
pub fn next_state(current: ConnectionState, transition: Transition) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (current, transition) {
        (Closed, _) => None,
        (_, Transition::Close) => Some(Closed),
        (Disconnected, Transition::Connect) => Some(Connecting),
        (Connecting, Transition::Established) => Some(Connected),
        (Connecting, Transition::Failed) => Some(Disconnected),
        (Connected, Transition::Lost) => Some(Reconnecting),
        (Reconnecting, Transition::Established) => Some(Connected),
        (Reconnecting, Transition::Failed) => Some(Reconnecting),
        _ => None,
    }
}

/// Observable connection state
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply `transition`. Returns the new state, or the unchanged current
    /// state when the transition is rejected.
    pub fn apply(&self, transition: Transition) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(ConnectionState::Closed);
        self.tx.send_if_modified(|state| match next_state(*state, transition) {
            Some(next) => {
                outcome = Ok(next);
                let changed = *state != next;
                *state = next;
                changed
            }
            None => {
                outcome = Err(*state);
                false
            }
        });

        if let Err(current) = outcome {
            tracing::debug!("Ignoring {:?} while {}", transition, current);
        }
        outcome
    }

    /// Return to `Disconnected` after an abandoned initial connect
    pub fn reset(&self) {
        self.tx.send_if_modified(|state| {
            if state.is_terminal() || *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), Disconnected);
        assert_eq!(cell.apply(Transition::Connect), Ok(Connecting));
        assert_eq!(cell.apply(Transition::Established), Ok(Connected));
        assert_eq!(cell.apply(Transition::Lost), Ok(Reconnecting));
        assert_eq!(cell.apply(Transition::Failed), Ok(Reconnecting));
        assert_eq!(cell.apply(Transition::Established), Ok(Connected));
        assert_eq!(cell.apply(Transition::Close), Ok(Closed));
    }

    #[test]
    fn test_failed_initial_connect_returns_to_disconnected() {
        assert_eq!(next_state(Connecting, Transition::Failed), Some(Disconnected));
    }

    #[test]
    fn test_closed_is_terminal() {
        for transition in [
            Transition::Connect,
            Transition::Established,
            Transition::Failed,
            Transition::Lost,
            Transition::Close,
        ] {
            assert_eq!(next_state(Closed, transition), None);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let cell = StateCell::new();
        assert_eq!(cell.apply(Transition::Lost), Err(Disconnected));
        assert_eq!(next_state(Connected, Transition::Connect), None);
        assert_eq!(next_state(Disconnected, Transition::Established), None);
    }

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.apply(Transition::Connect).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);

        cell.reset();
        assert_eq!(cell.get(), Disconnected);
    }
}
