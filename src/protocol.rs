use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// A session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A local ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

/// Classified inbound signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    /// A JSON object that carries no offer or answer, e.g. a client-side
    /// candidate. `kind` is the `type` field when one was present.
    Unrecognized { kind: Option<String> },
}

impl SignalingMessage {
    /// Parse a raw text frame. Anything that is not a JSON object is an error;
    /// objects whose `type` is missing or not `offer`/`answer` are
    /// [`SignalingMessage::Unrecognized`].
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let object: Map<String, Value> = serde_json::from_str(raw)?;

        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) | None => {
                return Ok(Self::Unrecognized {
                    kind: object.get("type").map(Value::to_string),
                });
            }
        };

        if kind == SdpType::Offer.as_str() || kind == SdpType::Answer.as_str() {
            let desc: SessionDescription = serde_json::from_value(Value::Object(object))?;
            return Ok(match desc.kind {
                SdpType::Offer => Self::Offer(desc),
                SdpType::Answer => Self::Answer(desc),
            });
        }

        Ok(Self::Unrecognized { kind: Some(kind) })
    }
}
