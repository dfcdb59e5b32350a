// Steerlink wire protocol
// JSON frames exchanged with the signaling server, and the text payloads
// carried over the WebRTC data channel once it is open

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::error::ProtocolError;

/// Inbound `type` values we know how to handle
const INBOUND_KINDS: &[&str] = &[
    "ice-candidate",
    "offer",
    "answer",
    "message",
    "color-change",
    "error",
];

/// ICE candidate as browsers serialize `RTCIceCandidate.toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Servers may relay either the full candidate object or just its string
fn candidate_payload<'de, D>(deserializer: D) -> Result<IceCandidateInit, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Init(IceCandidateInit),
        Bare(String),
    }

    Ok(match Payload::deserialize(deserializer)? {
        Payload::Init(init) => init,
        Payload::Bare(candidate) => IceCandidateInit::new(candidate),
    })
}

/// SDP offer or answer (`RTCSessionDescriptionInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some("offer".to_string()),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some("answer".to_string()),
            sdp: sdp.into(),
        }
    }
}

/// Typed lobby control kinds, numbered as the lobby server numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    StartGame,
    EndGame,
    Error,
    Success,
    /// Direction carried over the data channel in envelope format
    Input,
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(MessageType::StartGame),
            1 => Ok(MessageType::EndGame),
            2 => Ok(MessageType::Error),
            3 => Ok(MessageType::Success),
            4 => Ok(MessageType::Input),
            other => Err(format!("unknown MessageType {}", other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::StartGame => 0,
            MessageType::EndGame => 1,
            MessageType::Error => 2,
            MessageType::Success => 3,
            MessageType::Input => 4,
        }
    }
}

/// `{MessageType, Data}` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedMessage {
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "Data", default)]
    pub data: String,
}

/// Payload of a `message` frame: free text or a typed envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LobbyPayload {
    Text(String),
    Typed(TypedMessage),
}

/// What a lobby `message` asks the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyCommand {
    Start,
    Stop,
    ReportError(String),
    ReportSuccess(String),
}

impl LobbyPayload {
    pub fn command(&self) -> Result<LobbyCommand, ProtocolError> {
        match self {
            // Anything but "start" stops input forwarding
            LobbyPayload::Text(text) if text == "start" => Ok(LobbyCommand::Start),
            LobbyPayload::Text(_) => Ok(LobbyCommand::Stop),
            LobbyPayload::Typed(typed) => match typed.message_type {
                MessageType::StartGame => Ok(LobbyCommand::Start),
                MessageType::EndGame => Ok(LobbyCommand::Stop),
                MessageType::Error => Ok(LobbyCommand::ReportError(typed.data.clone())),
                MessageType::Success => Ok(LobbyCommand::ReportSuccess(typed.data.clone())),
                MessageType::Input => Err(ProtocolError::Unexpected("message".to_string())),
            },
        }
    }
}

/// Frames received from the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    IceCandidate {
        #[serde(deserialize_with = "candidate_payload")]
        candidate: IceCandidateInit,
    },
    Offer {
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    Message {
        message: LobbyPayload,
    },
    ColorChange {
        color: String,
    },
    Error {
        message: String,
    },
}

impl InboundMessage {
    /// Wire name of this frame's `type`
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::IceCandidate { .. } => "ice-candidate",
            InboundMessage::Offer { .. } => "offer",
            InboundMessage::Answer { .. } => "answer",
            InboundMessage::Message { .. } => "message",
            InboundMessage::ColorChange { .. } => "color-change",
            InboundMessage::Error { .. } => "error",
        }
    }
}

/// Validate and decode one inbound text frame
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !INBOUND_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnsupportedType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// Frames sent to the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    RegisterClient {},
    IceCandidateClient { candidate: IceCandidateInit },
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::RegisterClient {} => "register-client",
            OutboundMessage::IceCandidateClient { .. } => "ice-candidate-client",
            OutboundMessage::Offer { .. } => "offer",
            OutboundMessage::Answer { .. } => "answer",
        }
    }

    /// Serialize to a text frame, adding `clientId`/`lobbyCode` where absent
    pub fn encode(&self, client_id: &str, lobby_code: &str) -> Result<String, serde_json::Error> {
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        fields
            .entry("clientId")
            .or_insert_with(|| Value::String(client_id.to_string()));
        fields
            .entry("lobbyCode")
            .or_insert_with(|| Value::String(lobby_code.to_string()));
        serde_json::to_string(&Value::Object(fields))
    }
}

/// Last committed control input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Left,
    Right,
    Forward,
    None,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
            Direction::Forward => "FORWARD",
            Direction::None => "NONE",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "LEFT" => Ok(Direction::Left),
            "RIGHT" => Ok(Direction::Right),
            "FORWARD" => Ok(Direction::Forward),
            "NONE" => Ok(Direction::None),
            other => Err(ProtocolError::Payload(format!("unknown direction '{}'", other))),
        }
    }
}

/// How directions are framed on the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Bare token: `LEFT`
    #[default]
    Plain,
    /// `{"MessageType":4,"Data":"LEFT"}`
    Envelope,
}

/// Encode a direction for the data channel
pub fn encode_direction(direction: Direction, format: WireFormat) -> String {
    match format {
        WireFormat::Plain => direction.as_str().to_string(),
        WireFormat::Envelope => {
            let envelope = TypedMessage {
                message_type: MessageType::Input,
                data: direction.as_str().to_string(),
            };
            serde_json::to_string(&envelope).unwrap_or_else(|_| direction.as_str().to_string())
        }
    }
}

/// Decode a data channel payload in either format
pub fn decode_direction(payload: &str) -> Result<Direction, ProtocolError> {
    let trimmed = payload.trim();
    if trimmed.starts_with('{') {
        let envelope: TypedMessage = serde_json::from_str(trimmed)
            .map_err(|e| ProtocolError::Payload(e.to_string()))?;
        if envelope.message_type != MessageType::Input {
            return Err(ProtocolError::Payload(format!(
                "expected input envelope, got {:?}",
                envelope.message_type
            )));
        }
        return envelope.data.parse();
    }
    trimmed.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer() {
        let msg = parse_inbound(r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0\r\n"}}"#)
            .unwrap();
        match msg {
            InboundMessage::Offer { offer } => assert_eq!(offer.sdp, "v=0\r\n"),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_candidate_object_and_bare_string() {
        let msg = parse_inbound(
            r#"{"type":"ice-candidate","candidate":{"candidate":"1 1 udp 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::IceCandidate { candidate } => {
                assert!(candidate.candidate.starts_with("1 1 udp"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("expected candidate, got {:?}", other),
        }

        let msg = parse_inbound(r#"{"type":"ice-candidate","candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ host"}"#)
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::IceCandidate {
                candidate: IceCandidateInit::new("candidate:1 1 udp 1 1.2.3.4 9 typ host")
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert_eq!(
            parse_inbound(r#"{"type":"ping"}"#),
            Err(ProtocolError::UnsupportedType("ping".to_string()))
        );
        assert_eq!(parse_inbound(r#"{"color":"red"}"#), Err(ProtocolError::MissingType));
        assert!(matches!(
            parse_inbound(r#"{"type":"offer","offer":{}}"#),
            Err(ProtocolError::Malformed { ref kind, .. }) if kind == "offer"
        ));
        assert!(matches!(parse_inbound("not json"), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn test_lobby_commands() {
        let start = parse_inbound(r#"{"type":"message","message":"start"}"#).unwrap();
        let stop = parse_inbound(r#"{"type":"message","message":"stop"}"#).unwrap();
        let typed = parse_inbound(r#"{"type":"message","message":{"MessageType":0,"Data":""}}"#)
            .unwrap();
        let failure = parse_inbound(r#"{"type":"message","message":{"MessageType":2,"Data":"lobby closed"}}"#)
            .unwrap();

        let command = |msg: InboundMessage| match msg {
            InboundMessage::Message { message } => message.command().unwrap(),
            other => panic!("expected message, got {:?}", other),
        };

        assert_eq!(command(start), LobbyCommand::Start);
        assert_eq!(command(stop), LobbyCommand::Stop);
        assert_eq!(command(typed), LobbyCommand::Start);
        assert_eq!(command(failure), LobbyCommand::ReportError("lobby closed".to_string()));
    }

    #[test]
    fn test_message_type_numbers() {
        let typed: TypedMessage = serde_json::from_str(r#"{"MessageType":2,"Data":"full"}"#).unwrap();
        assert_eq!(typed.message_type, MessageType::Error);
        assert_eq!(u8::from(MessageType::Input), 4);
        assert_eq!(MessageType::try_from(3), Ok(MessageType::Success));
        assert!(MessageType::try_from(9).is_err());
        assert!(serde_json::from_str::<TypedMessage>(r#"{"MessageType":9,"Data":""}"#).is_err());
    }

    #[test]
    fn test_encode_stamps_session_fields() {
        let frame = OutboundMessage::Answer {
            answer: SessionDescription::answer("v=0"),
        }
        .encode("c0ffee", "ABCD")
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "answer");
        assert_eq!(value["answer"]["type"], "answer");
        assert_eq!(value["answer"]["sdp"], "v=0");
        assert_eq!(value["clientId"], "c0ffee");
        assert_eq!(value["lobbyCode"], "ABCD");

        let register: Value = serde_json::from_str(
            &OutboundMessage::RegisterClient {}.encode("c0ffee", "ABCD").unwrap(),
        )
        .unwrap();
        assert_eq!(register["type"], "register-client");
    }

    #[test]
    fn test_direction_payloads() {
        assert_eq!(encode_direction(Direction::Left, WireFormat::Plain), "LEFT");
        let envelope = encode_direction(Direction::Right, WireFormat::Envelope);
        assert_eq!(envelope, r#"{"MessageType":4,"Data":"RIGHT"}"#);

        assert_eq!(decode_direction("FORWARD").unwrap(), Direction::Forward);
        assert_eq!(decode_direction(&envelope).unwrap(), Direction::Right);
        assert!(decode_direction("SIDEWAYS").is_err());
        assert!(decode_direction(r#"{"MessageType":0,"Data":"LEFT"}"#).is_err());
    }
}
