//! Connection states and the transition table

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Listening,
    Connecting,
    Accepting,
    Connected,
    Sending,
    Receiving,
    SendingFile,
    Disconnecting,
    Closed,
}

/// The I/O operation a connection is performing or just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    Accept,
    Connect,
    Send,
    Recv,
    SendFile,
    Disconnect,
}

impl IoOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::SendFile => "sendfile",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Events that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A pooled accept completed.
    Accepted,
    /// A client connect completed.
    Connected,
    /// A callback returned bytes to send.
    Payload,
    /// A callback scheduled a file transfer.
    File,
    /// Nothing to send; receive if the protocol wants data.
    Idle { receives: bool },
    /// A receive completed with zero bytes.
    PeerClosed,
    /// `close()` was requested or the connection was reaped.
    CloseRequested,
    /// An I/O or callback error is being handled.
    Fault,
    /// The transport is closed.
    Closed,
    /// A pooled connection is being reused.
    Recycled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnState,
    pub trigger: Trigger,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {:?} on {:?}", self.from, self.trigger)
    }
}

impl std::error::Error for InvalidTransition {}

/// Next state for `trigger` in state `from`.
pub fn transition(from: ConnState, trigger: Trigger) -> Result<ConnState, InvalidTransition> {
    use ConnState::*;

    let active = matches!(from, Connected | Sending | Receiving | SendingFile);
    let next = match (from, trigger) {
        (Accepting, Trigger::Accepted) => Some(Connected),
        (Connecting, Trigger::Connected) => Some(Connected),
        (_, Trigger::Payload) if active => Some(Sending),
        (_, Trigger::File) if active => Some(SendingFile),
        (_, Trigger::Idle { receives: true }) if active => Some(Receiving),
        (_, Trigger::Idle { receives: false }) if active => Some(Disconnecting),
        (_, Trigger::PeerClosed) if active => Some(Disconnecting),
        (_, Trigger::CloseRequested) if active || from == Disconnecting => Some(Disconnecting),
        (Closed, Trigger::Fault) => None,
        (_, Trigger::Fault) => Some(Disconnecting),
        (Disconnecting | Listening | Accepting | Connecting, Trigger::Closed) => Some(Closed),
        (Closed, Trigger::Recycled) => Some(Accepting),
        _ => None,
    };
    next.ok_or(InvalidTransition { from, trigger })
}

#[cfg(test)]
mod tests {
    use super::ConnState::*;
    use super::*;

    fn ok(from: ConnState, trigger: Trigger) -> ConnState {
        transition(from, trigger).unwrap()
    }

    #[test]
    fn test_accept_and_connect_establish() {
        assert_eq!(ok(Accepting, Trigger::Accepted), Connected);
        assert_eq!(ok(Connecting, Trigger::Connected), Connected);
        assert!(transition(Accepting, Trigger::Connected).is_err());
        assert!(transition(Connected, Trigger::Accepted).is_err());
    }

    #[test]
    fn test_payload_moves_to_sending() {
        for from in [Connected, Sending, Receiving, SendingFile] {
            assert_eq!(ok(from, Trigger::Payload), Sending);
            assert_eq!(ok(from, Trigger::File), SendingFile);
        }
        assert!(transition(Accepting, Trigger::Payload).is_err());
        assert!(transition(Closed, Trigger::Payload).is_err());
    }

    #[test]
    fn test_idle_depends_on_receive_interest() {
        assert_eq!(ok(Sending, Trigger::Idle { receives: true }), Receiving);
        assert_eq!(ok(Receiving, Trigger::Idle { receives: true }), Receiving);
        assert_eq!(ok(Connected, Trigger::Idle { receives: false }), Disconnecting);
    }

    #[test]
    fn test_shutdown_paths() {
        assert_eq!(ok(Receiving, Trigger::PeerClosed), Disconnecting);
        assert_eq!(ok(Sending, Trigger::CloseRequested), Disconnecting);
        assert_eq!(ok(Disconnecting, Trigger::CloseRequested), Disconnecting);
        assert_eq!(ok(Connecting, Trigger::Fault), Disconnecting);
        assert_eq!(ok(Disconnecting, Trigger::Closed), Closed);
        assert_eq!(ok(Listening, Trigger::Closed), Closed);
        assert!(transition(Closed, Trigger::Fault).is_err());
        assert!(transition(Receiving, Trigger::Closed).is_err());
    }

    #[test]
    fn test_recycle_returns_to_accepting() {
        assert_eq!(ok(Closed, Trigger::Recycled), Accepting);
        assert!(transition(Receiving, Trigger::Recycled).is_err());
    }
}
