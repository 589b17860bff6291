//! Signaling protocol: JSON messages exchanged with the relay, plus the
//! transfer descriptor shared with the direct-channel frames.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, Role, TransferId};

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as carried in `sdp-offer` / `sdp-answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its browser-compatible JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages on the signaling pipe. The relay adds `from` when forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Sent once per socket open.
    Join {
        #[serde(rename = "clientId")]
        client_id: ClientId,
        role: Role,
    },
    /// Roster push from the relay.
    Peers { peers: Vec<ClientId> },
    SdpOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
        sdp: SessionDescription,
    },
    SdpAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
        candidate: IceCandidate,
    },
    /// Relay-level chat fallback.
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ClientId>,
        data: String,
    },
    /// Keep-alive, no reply.
    Ping,
}

impl SignalMessage {
    /// Keep-alives are meaningless once the pipe is down and are never buffered.
    pub fn is_keepalive(&self) -> bool {
        matches!(self, SignalMessage::Ping)
    }
}

/// Encode a signaling message to its JSON text form.
pub fn encode_signal(msg: &SignalMessage) -> Result<String, SignalCodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a signaling message. Unknown `type` values are a decode error.
pub fn decode_signal(text: &str) -> Result<SignalMessage, SignalCodecError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, thiserror::Error)]
pub enum SignalCodecError {
    #[error("signal json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable metadata identifying one file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub id: TransferId,
    pub name: String,
    #[serde(rename = "size")]
    pub byte_size: u64,
    #[serde(rename = "mime", default)]
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "lastModified", default)]
    pub last_modified: i64,
}

impl TransferDescriptor {
    pub fn new(name: impl Into<String>, byte_size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            id: TransferId::generate(),
            name: name.into(),
            byte_size,
            mime_type: mime_type.into(),
            last_modified: 0,
        }
    }

    pub fn with_last_modified(mut self, millis: i64) -> Self {
        self.last_modified = millis;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_matches_relay_shape() {
        let msg = SignalMessage::Join {
            client_id: ClientId::from("A"),
            role: Role::Initiator,
        };
        let json: serde_json::Value = serde_json::from_str(&encode_signal(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["clientId"], "A");
        assert_eq!(json["role"], "initiator");
    }

    #[test]
    fn forwarded_offer_carries_from() {
        let text = r#"{"type":"sdp-offer","from":"A","sdp":{"type":"offer","sdp":"v=0"}}"#;
        match decode_signal(text).unwrap() {
            SignalMessage::SdpOffer { from, to, sdp } => {
                assert_eq!(from, Some(ClientId::from("A")));
                assert_eq!(to, None);
                assert_eq!(sdp, SessionDescription::offer("v=0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let msg = SignalMessage::IceCandidate {
            to: Some(ClientId::from("B")),
            from: None,
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let text = encode_signal(&msg).unwrap();
        assert!(text.contains("\"type\":\"ice-candidate\""));
        assert!(text.contains("\"sdpMLineIndex\":0"));
        assert!(text.contains("\"sdpMid\":\"0\""));
        assert!(!text.contains("usernameFragment"));
        assert!(!text.contains("from"));
    }

    #[test]
    fn ping_and_peers() {
        assert_eq!(encode_signal(&SignalMessage::Ping).unwrap(), r#"{"type":"ping"}"#);
        let peers = decode_signal(r#"{"type":"peers","peers":["A","B"]}"#).unwrap();
        assert_eq!(
            peers,
            SignalMessage::Peers {
                peers: vec![ClientId::from("A"), ClientId::from("B")]
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(decode_signal(r#"{"type":"bogus"}"#).is_err());
        assert!(decode_signal("not json").is_err());
    }

    #[test]
    fn descriptor_field_names() {
        let d = TransferDescriptor {
            id: TransferId::from("t1"),
            name: "a.bin".into(),
            byte_size: 42,
            mime_type: "application/octet-stream".into(),
            last_modified: 1700000000000,
        };
        let v: serde_json::Value = serde_json::to_value(&d).unwrap();
        assert_eq!(v["size"], 42);
        assert_eq!(v["mime"], "application/octet-stream");
        assert_eq!(v["lastModified"], 1700000000000i64);
    }
}
