//! Mirrored connection states plus the unsolicited event stream: the wire
//! shape published by the remote forwarders and the routed payload handed to
//! registered handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::IceCandidate;
use crate::data_channel::DataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Event kinds the remote connection reports. Handlers are registered
/// against a kind and looked up in an explicit table when an event routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AddStream,
    DataChannel,
    IceCandidate,
    IceConnectionStateChange,
    IdentityResult,
    IdpAssertionError,
    IdpValidationError,
    NegotiationNeeded,
    RemoveStream,
    SignalingStateChange,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AddStream => "addstream",
            EventKind::DataChannel => "datachannel",
            EventKind::IceCandidate => "icecandidate",
            EventKind::IceConnectionStateChange => "iceconnectionstatechange",
            EventKind::IdentityResult => "identityresult",
            EventKind::IdpAssertionError => "idpassertionerror",
            EventKind::IdpValidationError => "idpvalidationerror",
            EventKind::NegotiationNeeded => "negotiationneeded",
            EventKind::RemoveStream => "removestream",
            EventKind::SignalingStateChange => "signalingstatechange",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of one unsolicited `pc:<id>` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub(crate) enum RemoteEvent {
    AddStream,
    DataChannel {
        channel: ChannelInfo,
    },
    IceCandidate {
        #[serde(default)]
        event: CandidateEvent,
        ice_gathering_state: IceGatheringState,
        #[serde(default)]
        offer: Option<Value>,
    },
    IceConnectionStateChange {
        ice_connection_state: IceConnectionState,
    },
    IdentityResult {
        #[serde(default)]
        event: Value,
    },
    IdpAssertionError {
        #[serde(default)]
        event: Value,
    },
    IdpValidationError {
        #[serde(default)]
        event: Value,
    },
    NegotiationNeeded,
    RemoveStream {
        #[serde(default)]
        event: Value,
    },
    SignalingStateChange {
        signaling_state: SignalingState,
    },
}

impl RemoteEvent {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            RemoteEvent::AddStream => EventKind::AddStream,
            RemoteEvent::DataChannel { .. } => EventKind::DataChannel,
            RemoteEvent::IceCandidate { .. } => EventKind::IceCandidate,
            RemoteEvent::IceConnectionStateChange { .. } => EventKind::IceConnectionStateChange,
            RemoteEvent::IdentityResult { .. } => EventKind::IdentityResult,
            RemoteEvent::IdpAssertionError { .. } => EventKind::IdpAssertionError,
            RemoteEvent::IdpValidationError { .. } => EventKind::IdpValidationError,
            RemoteEvent::NegotiationNeeded => EventKind::NegotiationNeeded,
            RemoteEvent::RemoveStream { .. } => EventKind::RemoveStream,
            RemoteEvent::SignalingStateChange { .. } => EventKind::SignalingStateChange,
        }
    }
}

/// Mirror of the remote data channel's non-function, non-null properties.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChannelInfo {
    pub id: u16,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct CandidateEvent {
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

/// Routed payload delivered to a registered handler, after the associated
/// state mutation has been applied.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Media streams carry no payload translation.
    AddStream,
    DataChannel(Arc<DataChannel>),
    /// `None` once gathering has finished.
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChange(IceConnectionState),
    IdentityResult(Value),
    IdpAssertionError(Value),
    IdpValidationError(Value),
    NegotiationNeeded,
    RemoveStream(Value),
    SignalingStateChange(SignalingState),
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::AddStream => EventKind::AddStream,
            PeerEvent::DataChannel(_) => EventKind::DataChannel,
            PeerEvent::IceCandidate(_) => EventKind::IceCandidate,
            PeerEvent::IceConnectionStateChange(_) => EventKind::IceConnectionStateChange,
            PeerEvent::IdentityResult(_) => EventKind::IdentityResult,
            PeerEvent::IdpAssertionError(_) => EventKind::IdpAssertionError,
            PeerEvent::IdpValidationError(_) => EventKind::IdpValidationError,
            PeerEvent::NegotiationNeeded => EventKind::NegotiationNeeded,
            PeerEvent::RemoveStream(_) => EventKind::RemoveStream,
            PeerEvent::SignalingStateChange(_) => EventKind::SignalingStateChange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signaling_state_change_parses() {
        let event: RemoteEvent = serde_json::from_value(json!({
            "type": "signalingstatechange",
            "signalingState": "have-local-offer"
        }))
        .unwrap();
        assert!(matches!(
            event,
            RemoteEvent::SignalingStateChange {
                signaling_state: SignalingState::HaveLocalOffer
            }
        ));
    }

    #[test]
    fn ice_candidate_with_piggybacked_offer_parses() {
        let event: RemoteEvent = serde_json::from_value(json!({
            "type": "icecandidate",
            "event": {
                "candidate": {
                    "candidate": "candidate:0 1 udp 1 198.51.100.7 9 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            },
            "iceGatheringState": "gathering",
            "offer": { "type": "offer", "sdp": "v=0" }
        }))
        .unwrap();
        let RemoteEvent::IceCandidate {
            event,
            ice_gathering_state,
            offer,
        } = event
        else {
            panic!("wrong kind");
        };
        assert_eq!(ice_gathering_state, IceGatheringState::Gathering);
        assert_eq!(event.candidate.unwrap().sdp_mid.as_deref(), Some("0"));
        assert_eq!(offer, Some(json!({ "type": "offer", "sdp": "v=0" })));
    }

    #[test]
    fn gathering_finished_candidate_is_empty() {
        let event: RemoteEvent = serde_json::from_value(json!({
            "type": "icecandidate",
            "event": {},
            "iceGatheringState": "complete",
            "offer": null
        }))
        .unwrap();
        let RemoteEvent::IceCandidate { event, offer, .. } = event else {
            panic!("wrong kind");
        };
        assert!(event.candidate.is_none());
        assert!(offer.is_none());
    }

    #[test]
    fn datachannel_mirror_keeps_extra_properties() {
        let event: RemoteEvent = serde_json::from_value(json!({
            "type": "datachannel",
            "channel": {
                "id": 1,
                "label": "chat",
                "ordered": true,
                "readyState": "open"
            }
        }))
        .unwrap();
        let RemoteEvent::DataChannel { channel } = event else {
            panic!("wrong kind");
        };
        assert_eq!(channel.id, 1);
        assert_eq!(channel.label, "chat");
        assert_eq!(channel.properties.get("readyState"), Some(&json!("open")));
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let result: Result<RemoteEvent, _> =
            serde_json::from_value(json!({ "type": "track" }));
        assert!(result.is_err());
    }
}
