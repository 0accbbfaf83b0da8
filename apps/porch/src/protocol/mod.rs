use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message on the room channel. The relay fans every envelope out to all
/// members (including the sender); directed delivery is emulated with `to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Broadcast envelopes are for everyone; directed envelopes only for `identity`.
    pub fn is_for(&self, identity: &str) -> bool {
        match self.to.as_deref() {
            Some(to) => to == identity,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    /// Broadcast by a newly joined participant announcing presence.
    IntroduceSelf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    /// Directed self-description sent back to a first-seen participant.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    NegotiateOffer {
        offer: SessionDescriptor,
    },
    NegotiateAnswer {
        answer: SessionDescriptor,
    },
    NetworkCandidate {
        candidate: CandidateBlob,
    },
    ChatMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        message: String,
    },
    Leave,
}

/// Opaque media-session descriptor. The `{sdp, type}` shape matches the JSON
/// form of a browser `RTCSessionDescription`, so peers on either client
/// implementation interoperate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "offer".to_string(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "answer".to_string(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }

    pub fn is_answer(&self) -> bool {
        self.kind == "answer"
    }
}

/// Opaque network-path candidate. Field casing matches the JSON form of a
/// browser `RTCIceCandidate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateBlob {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

/// A decoded inbound message. Unknown `type` values are surfaced rather than
/// treated as decode failures so the session never dies on unrecognized
/// traffic.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Envelope),
    Unhandled(Value),
}

pub fn decode_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    match serde_json::from_value::<Envelope>(value.clone()) {
        Ok(envelope) => Ok(Inbound::Message(envelope)),
        Err(_) => Ok(Inbound::Unhandled(value)),
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
