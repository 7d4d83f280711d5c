//! Connection lifecycle as data.
//!
//! [`LinkState::apply`] is the only place transitions are decided; the
//! device supervisor feeds it [`LinkEvent`]s and acts on the result.

use std::fmt;

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; `connect` may be called.
    Disconnected,
    /// First open and handshake in progress.
    Connecting,
    /// A live session is installed.
    Connected,
    /// The link was lost; retrying with backoff.
    Reconnecting,
    /// Closed on request. Terminal.
    Closed,
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The caller asked to connect.
    ConnectRequested,
    /// Transport open and handshake succeeded.
    Opened,
    /// Transport open or handshake failed.
    OpenFailed,
    /// An established link dropped.
    LinkLost,
    /// The caller asked to close.
    CloseRequested,
}

impl LinkState {
    /// The state after `event`, or `None` if the event is not valid here.
    pub fn apply(self, event: LinkEvent) -> Option<LinkState> {
        use LinkEvent::*;
        use LinkState::*;

        match (self, event) {
            (Closed, _) => None,
            (_, CloseRequested) => Some(Closed),
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Connecting, Opened) | (Reconnecting, Opened) => Some(Connected),
            (Connecting, OpenFailed) => Some(Disconnected),
            (Reconnecting, OpenFailed) => Some(Reconnecting),
            (Connected, LinkLost) => Some(Reconnecting),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == LinkState::Closed
    }

    /// Lowercase name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::LinkEvent::*;
    use super::LinkState::*;
    use super::*;

    #[test]
    fn first_connect_failure_returns_to_disconnected() {
        let state = Disconnected.apply(ConnectRequested).unwrap();
        assert_eq!(state, Connecting);
        assert_eq!(state.apply(OpenFailed), Some(Disconnected));
    }

    #[test]
    fn loss_cycles_through_reconnecting() {
        let mut state = Disconnected;
        for event in [ConnectRequested, Opened, LinkLost, OpenFailed, OpenFailed, Opened] {
            state = state.apply(event).unwrap();
        }
        assert_eq!(state, Connected);
    }

    #[test]
    fn close_is_terminal_from_every_state() {
        for state in [Disconnected, Connecting, Connected, Reconnecting] {
            let closed = state.apply(CloseRequested).unwrap();
            assert!(closed.is_terminal());
            for event in [ConnectRequested, Opened, OpenFailed, LinkLost, CloseRequested] {
                assert_eq!(closed.apply(event), None);
            }
        }
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert_eq!(Disconnected.apply(LinkLost), None);
        assert_eq!(Connected.apply(ConnectRequested), None);
        assert_eq!(Connected.apply(Opened), None);
        assert_eq!(Reconnecting.apply(LinkLost), None);
    }
}
