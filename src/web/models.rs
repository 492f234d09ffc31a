//! Data models for the WebSocket protocol and REST responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gcode::toolpath::Bounds;

/// Commands a client sends over the WebSocket, tagged with `command`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Enumerate ports; answered with [`BridgeEvent::Ports`].
    List,
    Open {
        port: String,
        #[serde(default)]
        baudrate: Option<u32>,
    },
    Close {
        port: String,
    },
    /// Transmit raw text immediately, exactly as given.
    Write {
        port: String,
        text: String,
    },
    /// Transmit text with a newline appended.
    Writeline {
        port: String,
        text: String,
    },
    /// Append program lines to the port's queue. Both spellings are
    /// accepted on the wire.
    #[serde(alias = "enqueue")]
    Load {
        port: String,
        lines: Vec<String>,
    },
    Run {
        port: String,
        #[serde(rename = "loop", default)]
        looping: bool,
    },
    Pause {
        port: String,
    },
    Stop {
        port: String,
    },
    Clear {
        port: String,
    },
}

/// One entry in the port list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: String,
    pub inuse: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

/// Replies produced by the bridge itself rather than by a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BridgeEvent {
    Ports {
        ports: Vec<PortInfo>,
    },
    /// A program was accepted; totals and extents come from a dry
    /// interpreter pass over it.
    Loaded {
        port: String,
        total: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        bounds: Option<Bounds>,
    },
}
