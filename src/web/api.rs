//! Axum routes: port listing plus the WebSocket bridge into sessions.

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gcode::toolpath::ToolpathInterpreter;
use crate::session::events::SessionEvent;
use crate::session::{ClientId, SessionError, SessionManager};
use crate::web::models::{BridgeEvent, ClientCommand, PortInfo};

/// Creates the Axum router with every endpoint.
pub fn create_router(manager: SessionManager) -> Router {
    Router::new()
        .route("/api/ports", get(list_ports))
        .route("/ws", get(ws_upgrade))
        .with_state(manager)
}

async fn list_ports(State(manager): State<SessionManager>) -> Json<Vec<PortInfo>> {
    Json(port_list(&manager).await)
}

/// Enumerated ports merged with the open-session registry: an open port
/// that enumeration no longer shows (unplugged but still held) is listed
/// too.
async fn port_list(manager: &SessionManager) -> Vec<PortInfo> {
    let opened: HashMap<String, DateTime<Utc>> = manager.opened_ports().await.into_iter().collect();
    let mut ports: Vec<PortInfo> = manager
        .available_ports()
        .into_iter()
        .map(|port| {
            let opened_at = opened.get(&port).copied();
            PortInfo {
                inuse: opened_at.is_some(),
                port,
                opened_at,
            }
        })
        .collect();
    for (port, opened_at) in opened {
        if !ports.iter().any(|info| info.port == port) {
            ports.push(PortInfo {
                port,
                inuse: true,
                opened_at: Some(opened_at),
            });
        }
    }
    ports.sort_by(|a, b| a.port.cmp(&b.port));
    ports
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(manager): State<SessionManager>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_connection(socket, manager))
}

async fn client_connection(socket: WebSocket, manager: SessionManager) {
    let client = ClientId::new();
    tracing::info!(?client, "web client connected");
    let (mut sink, mut stream) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<BridgeEvent>();

    // One writer task funnels session events and bridge replies into the
    // socket so frames never interleave.
    let writer = tokio::spawn(async move {
        loop {
            let json = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => serde_json::to_string(&event),
                    None => break,
                },
                reply = replies_rx.recv() => match reply {
                    Some(reply) => serde_json::to_string(&reply),
                    None => break,
                },
            };
            match json {
                Ok(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("event serialization failed: {e}"),
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    handle_command(command, client, &manager, &events_tx, &replies_tx).await;
                }
                Err(e) => tracing::debug!(?client, "unparseable command: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    manager.detach(client).await;
    writer.abort();
    tracing::info!(?client, "web client disconnected");
}

async fn handle_command(
    command: ClientCommand,
    client: ClientId,
    manager: &SessionManager,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
    replies_tx: &mpsc::UnboundedSender<BridgeEvent>,
) {
    match command {
        ClientCommand::List => {
            let ports = port_list(manager).await;
            let _ = replies_tx.send(BridgeEvent::Ports { ports });
        }
        ClientCommand::Open { port, baudrate } => {
            if let Err(e) = manager.open(&port, baudrate, client, events_tx.clone()).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Close { port } => {
            if let Err(e) = manager.close(&port).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Write { port, text } => {
            if let Err(e) = manager.write(&port, client, text).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Writeline { port, text } => {
            if let Err(e) = manager.write_line(&port, client, text).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Load { port, lines } => {
            let total = lines.len();
            // Dry interpreter pass for program extents; the machine sees
            // nothing until the queue is run.
            let mut interpreter = ToolpathInterpreter::new();
            for line in &lines {
                interpreter.interpret_line(line, &mut |_| {});
            }
            let bounds = interpreter.bounds();
            match manager.enqueue(&port, lines).await {
                Ok(()) => {
                    let _ = replies_tx.send(BridgeEvent::Loaded { port, total, bounds });
                }
                Err(e) => report_error(events_tx, &port, e),
            }
        }
        ClientCommand::Run { port, looping } => {
            if let Err(e) = manager.run(&port, looping).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Pause { port } => {
            if let Err(e) = manager.pause(&port).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Stop { port } => {
            if let Err(e) = manager.stop(&port).await {
                report_error(events_tx, &port, e);
            }
        }
        ClientCommand::Clear { port } => {
            if let Err(e) = manager.clear(&port).await {
                report_error(events_tx, &port, e);
            }
        }
    }
}

/// Command failures are delivered on the client's own event stream, the
/// same way a session fault would be.
fn report_error(events_tx: &mpsc::UnboundedSender<SessionEvent>, port: &str, error: SessionError) {
    let _ = events_tx.send(SessionEvent::Error {
        port: port.to_string(),
        message: error.to_string(),
    });
}
