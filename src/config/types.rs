// Steerlink configuration types
// All settings with defaults matching the public signaling deployment

use serde::{Deserialize, Serialize};

use crate::network::controls::SendPolicy;
use crate::network::protocol::WireFormat;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub controls: ControlsConfig,
    #[serde(default)]
    pub keybindings: KeyBindings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Signaling server WebSocket URL
    pub signaling_server: String,

    // Single STUN server used for server reflexive candidates (host:port)
    pub stun_server: String,

    // Give up if the data channel is not open after this many seconds
    pub connection_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_server: "ws://localhost:8080".to_string(),
            stun_server: "stun.l.google.com:19302".to_string(),
            connection_timeout_secs: 60,
        }
    }
}

/// Data channel parameters used when this side creates the channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub label: String,
    pub ordered: bool,

    // None = fully reliable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            label: "controls".to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicyKind {
    #[default]
    OnChange,
    Retransmit,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlsConfig {
    // "on_change" sends once per direction change, "retransmit" also resends on a timer
    pub send_policy: SendPolicyKind,

    pub retransmit_interval_ms: u64,

    // "plain" sends LEFT/RIGHT/..., "envelope" wraps it in {MessageType, Data}
    pub wire_format: WireFormat,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            send_policy: SendPolicyKind::OnChange,
            retransmit_interval_ms: 100,
            wire_format: WireFormat::Plain,
        }
    }
}

impl ControlsConfig {
    pub fn policy(&self) -> SendPolicy {
        match self.send_policy {
            SendPolicyKind::OnChange => SendPolicy::OnChange,
            SendPolicyKind::Retransmit => SendPolicy::Retransmit {
                interval_ms: self.retransmit_interval_ms.max(1),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyBindings {
    pub left: String,
    pub right: String,
    pub quit: String,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            left: "Left".to_string(),
            right: "Right".to_string(),
            quit: "Q".to_string(),
        }
    }
}
