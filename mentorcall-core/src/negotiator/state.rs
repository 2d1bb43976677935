use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the offer/answer exchange this participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    /// Initiates the outbound connection with its local stream attached
    Caller,
    /// Responds to an inbound connection with its own local stream
    Answerer,
}

/// Negotiator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NegotiatorState {
    Uninitialized,
    /// Initialization claimed; waiting on the device permission prompt
    AcquiringMedia,
    AddressAssigned,
    Announced,
    AwaitingPeer,
    Negotiating { role: CallRole },
    Connected { role: CallRole },
    /// Peer went away; equivalent to `AwaitingPeer` for what may happen next
    PeerDeparted,
    Ended,
}

impl NegotiatorState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::AcquiringMedia => "AcquiringMedia",
            Self::AddressAssigned => "AddressAssigned",
            Self::Announced => "Announced",
            Self::AwaitingPeer => "AwaitingPeer",
            Self::Negotiating { .. } => "Negotiating",
            Self::Connected { .. } => "Connected",
            Self::PeerDeparted => "PeerDeparted",
            Self::Ended => "Ended",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Ready to place or accept a call
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::AwaitingPeer | Self::PeerDeparted)
    }

    /// A call handle is live in this state
    #[must_use]
    pub const fn has_call(&self) -> bool {
        matches!(self, Self::Negotiating { .. } | Self::Connected { .. })
    }

    #[must_use]
    pub const fn role(&self) -> Option<CallRole> {
        match self {
            Self::Negotiating { role } | Self::Connected { role } => Some(*role),
            _ => None,
        }
    }

    /// Legal moves of the state machine
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use NegotiatorState::{
            AcquiringMedia, AddressAssigned, Announced, AwaitingPeer, Connected, Ended,
            Negotiating, PeerDeparted, Uninitialized,
        };

        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Uninitialized, AcquiringMedia)
            | (AcquiringMedia, AddressAssigned)
            | (AddressAssigned, Announced)
            | (Announced, AwaitingPeer)
            | (AwaitingPeer | PeerDeparted, Negotiating { .. })
            // Glare resolution or a stale peer being replaced
            | (Negotiating { .. } | Connected { .. }, Negotiating { .. })
            // Outbound attempt declined before it connected
            | (Negotiating { .. }, AwaitingPeer)
            | (Negotiating { .. } | Connected { .. }, PeerDeparted) => true,
            (Negotiating { role: from }, Connected { role: to }) => from == to,
            _ => false,
        }
    }
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role() {
            Some(role) => write!(f, "{}({:?})", self.name(), role),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            NegotiatorState::Uninitialized,
            NegotiatorState::AcquiringMedia,
            NegotiatorState::AddressAssigned,
            NegotiatorState::Announced,
            NegotiatorState::AwaitingPeer,
            NegotiatorState::Negotiating {
                role: CallRole::Caller,
            },
            NegotiatorState::Connected {
                role: CallRole::Caller,
            },
            NegotiatorState::PeerDeparted,
            NegotiatorState::Negotiating {
                role: CallRole::Answerer,
            },
            NegotiatorState::Connected {
                role: CallRole::Answerer,
            },
            NegotiatorState::Ended,
        ];

        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_initialization_is_one_shot() {
        assert!(!NegotiatorState::AcquiringMedia.can_transition_to(&NegotiatorState::AcquiringMedia));
        assert!(!NegotiatorState::AwaitingPeer.can_transition_to(&NegotiatorState::AcquiringMedia));
        assert!(!NegotiatorState::Uninitialized.can_transition_to(&NegotiatorState::AwaitingPeer));
    }

    #[test]
    fn test_ended_is_terminal() {
        let ended = NegotiatorState::Ended;
        assert!(ended.is_terminal());
        assert!(!ended.can_transition_to(&NegotiatorState::AwaitingPeer));
        assert!(!ended.can_transition_to(&NegotiatorState::Ended));
        assert!(NegotiatorState::Announced.can_transition_to(&ended));
    }

    #[test]
    fn test_connected_keeps_its_role() {
        let negotiating = NegotiatorState::Negotiating {
            role: CallRole::Answerer,
        };
        assert!(!negotiating.can_transition_to(&NegotiatorState::Connected {
            role: CallRole::Caller
        }));
        assert_eq!(negotiating.role(), Some(CallRole::Answerer));
        assert!(NegotiatorState::PeerDeparted.is_waiting());
        assert!(!NegotiatorState::PeerDeparted.has_call());
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_value(NegotiatorState::Connected {
            role: CallRole::Caller,
        })
        .unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["role"], "caller");
    }
}
