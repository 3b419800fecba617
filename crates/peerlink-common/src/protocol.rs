//! Wire protocol for the Peerlink signaling channel.
//!
//! Every frame is one UTF-8 JSON envelope. Inbound envelopes carry a
//! `type` plus optional `code`, `role`, and `payload`; outbound envelopes
//! carry `type`, an optional `payload`, and — only where a handler stamps
//! the relay — a top-level millisecond `timestamp`. The relayed payloads
//! themselves (`signal`, `monitorInfo`, `processInfo`, and friends) are
//! opaque to the server and forwarded structurally unchanged.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types understood by the signaling server.
///
/// The string forms are the wire contract shared with the client and
/// viewer applications; an unrecognized string parses as [`Unknown`] so
/// the dispatcher can answer with an error instead of dropping the peer.
///
/// [`Unknown`]: MessageType::Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    RequestCode,
    CodeAssigned,
    Register,
    SessionEstablished,
    ClientConnected,
    ClientDisconnected,
    ClientReconnected,
    ViewerConnected,
    ViewerDisconnected,
    Connect,
    Signal,
    DisplayConfigChanged,
    MonitorInfo,
    ProcessInfo,
    AdminCommand,
    AdminCommandResponse,
    Error,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RequestCode => "requestCode",
            MessageType::CodeAssigned => "codeAssigned",
            MessageType::Register => "register",
            MessageType::SessionEstablished => "sessionEstablished",
            MessageType::ClientConnected => "clientConnected",
            MessageType::ClientDisconnected => "clientDisconnected",
            MessageType::ClientReconnected => "clientReconnected",
            MessageType::ViewerConnected => "viewerConnected",
            MessageType::ViewerDisconnected => "viewerDisconnected",
            MessageType::Connect => "connect",
            MessageType::Signal => "signal",
            MessageType::DisplayConfigChanged => "displayConfigChanged",
            MessageType::MonitorInfo => "monitorInfo",
            MessageType::ProcessInfo => "processInfo",
            MessageType::AdminCommand => "adminCommand",
            MessageType::AdminCommandResponse => "adminCommandResponse",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "requestCode" => MessageType::RequestCode,
            "codeAssigned" => MessageType::CodeAssigned,
            "register" => MessageType::Register,
            "sessionEstablished" => MessageType::SessionEstablished,
            "clientConnected" => MessageType::ClientConnected,
            "clientDisconnected" => MessageType::ClientDisconnected,
            "clientReconnected" => MessageType::ClientReconnected,
            "viewerConnected" => MessageType::ViewerConnected,
            "viewerDisconnected" => MessageType::ViewerDisconnected,
            "connect" => MessageType::Connect,
            "signal" => MessageType::Signal,
            "displayConfigChanged" => MessageType::DisplayConfigChanged,
            "monitorInfo" => MessageType::MonitorInfo,
            "processInfo" => MessageType::ProcessInfo,
            "adminCommand" => MessageType::AdminCommand,
            "adminCommandResponse" => MessageType::AdminCommandResponse,
            "error" => MessageType::Error,
            _ => MessageType::Unknown,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from(s.as_str()))
    }
}

/// Which side of a session a connection speaks for.
///
/// Anything other than `client` or `viewer` on the wire degrades to
/// `Unassigned`, which the register handler ignores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Unassigned,
    Client,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "unassigned",
            Role::Client => "client",
            Role::Viewer => "viewer",
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "client" => Role::Client,
            "viewer" => Role::Viewer,
            _ => Role::Unassigned,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Role::from(s.as_str()))
    }
}

/// Inbound envelope. All fields except `type` are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Outbound envelope.
///
/// Built through [`new`] for direct replies (no top-level timestamp) or
/// [`stamped`] for relays that carry one. Payload-level timestamps are the
/// handlers' business.
///
/// [`new`]: OutboundMessage::new
/// [`stamped`]: OutboundMessage::stamped
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl OutboundMessage {
    pub fn new(kind: MessageType, payload: impl Into<Option<Value>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            timestamp: None,
        }
    }

    pub fn stamped(kind: MessageType, payload: impl Into<Option<Value>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            timestamp: Some(now_millis()),
        }
    }

    /// An `error` envelope with the conventional `{"message": ...}` payload.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// Current Unix time in milliseconds, the unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
