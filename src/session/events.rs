//! Event messages fanned out from a session to its attached clients.

use serde::Serialize;

use crate::protocol::StatusReport;

/// One session event as delivered to clients. Tagged with `event` so a
/// browser console can switch on it directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// The port finished opening, or an extra client joined it.
    Open {
        port: String,
        baudrate: u32,
        inuse: bool,
    },
    /// The session is gone; `inuse` is always false here.
    Close { port: String, inuse: bool },
    Error { port: String, message: String },
    /// A raw line from the device, or the local echo of a transmitted
    /// command.
    Readline { port: String, text: String },
    /// Parsed machine status, shared by every attached client.
    Status {
        port: String,
        #[serde(flatten)]
        report: StatusReport,
    },
    /// Queue progress snapshot, sent only when it changed.
    QueueStatus {
        port: String,
        executed: usize,
        total: usize,
    },
}
