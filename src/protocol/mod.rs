// src/protocol/mod.rs - Grbl-class controller response classification
use serde::{Deserialize, Serialize};

use crate::gcode::Position;

/// A parsed machine-state report, e.g.
/// `<Idle,MPos:1.000,2.000,3.000,WPos:0.000,0.000,0.000>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub active_state: String,
    pub machine_position: Position,
    pub working_position: Position,
}

/// One line received from the controller, classified by prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerResponse {
    /// `ok` acknowledgment; advances the send queue.
    Ok,
    /// `error...` negative acknowledgment; advances the queue but is
    /// surfaced to clients. Carries the full line.
    Error(String),
    /// A parseable `<...>` status report.
    Status(StatusReport),
    /// A `<...>` line that does not match the report grammar.
    Malformed(String),
    /// Any other informational line, passed through verbatim.
    Raw(String),
}

/// Classifies a received line. The caller is expected to have trimmed it
/// and skipped empties.
pub fn parse_response(line: &str) -> ControllerResponse {
    if line.starts_with("ok") {
        return ControllerResponse::Ok;
    }
    if line.starts_with("error") {
        return ControllerResponse::Error(line.to_string());
    }
    if line.starts_with('<') {
        return match parse_status_report(line) {
            Some(report) => ControllerResponse::Status(report),
            None => ControllerResponse::Malformed(line.to_string()),
        };
    }
    ControllerResponse::Raw(line.to_string())
}

/// Parses a status report of the form
/// `<State,MPos:x,y,z,WPos:x,y,z>`. Grbl 1.1 `|`-separated reports are
/// accepted too. Returns `None` for anything that does not carry a
/// state plus both position triples; malformed reports are dropped by
/// the caller, never treated as errors.
pub fn parse_status_report(line: &str) -> Option<StatusReport> {
    let line = line.trim();
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    let normalized = inner.replace('|', ",");
    let fields: Vec<&str> = normalized.split(',').collect();

    let active_state = fields.first()?.trim();
    if active_state.is_empty() || active_state.contains(':') {
        return None;
    }

    let mut machine_position = None;
    let mut working_position = None;
    let mut idx = 1;
    while idx < fields.len() {
        if let Some(first) = fields[idx].strip_prefix("MPos:") {
            machine_position = parse_triple(first, fields.get(idx + 1), fields.get(idx + 2));
            idx += 3;
        } else if let Some(first) = fields[idx].strip_prefix("WPos:") {
            working_position = parse_triple(first, fields.get(idx + 1), fields.get(idx + 2));
            idx += 3;
        } else {
            // FS:, Ov:, Bf: and friends are not modeled here.
            idx += 1;
        }
    }

    Some(StatusReport {
        active_state: active_state.to_string(),
        machine_position: machine_position?,
        working_position: working_position?,
    })
}

fn parse_triple(first: &str, second: Option<&&str>, third: Option<&&str>) -> Option<Position> {
    Some(Position {
        x: first.trim().parse().ok()?,
        y: second?.trim().parse().ok()?,
        z: third?.trim().parse().ok()?,
    })
}
