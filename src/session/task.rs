// src/session/task.rs - Per-port actor: flow control, polling, event fan-out
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::SerialConfig;
use crate::protocol::{ControllerResponse, parse_response};
use crate::queue::{CommandQueue, PlayOptions};
use crate::session::events::SessionEvent;
use crate::session::{ClientId, SessionManager, SessionRequest};
use crate::transport::{Transport, spawn_line_reader};

/// Why the actor is exiting; decides which final events go out.
enum Shutdown {
    /// A client asked; acknowledged once teardown is done.
    Requested(oneshot::Sender<()>),
    /// Transport fault; broadcast as an error before the close event.
    Fault(String),
    /// The device closed the connection.
    Disconnected,
    /// Every handle to this session was dropped.
    Orphaned,
}

pub(super) fn spawn_session(
    port: String,
    baudrate: u32,
    transport: Arc<dyn Transport>,
    requests: mpsc::Receiver<SessionRequest>,
    manager: SessionManager,
    serial: SerialConfig,
    opener: (ClientId, mpsc::UnboundedSender<SessionEvent>),
) {
    tokio::spawn(async move {
        let mut queue = CommandQueue::new();
        let released_rx = queue.subscribe();
        let mut session = Session {
            port,
            baudrate,
            transport,
            manager,
            clients: HashMap::new(),
            queue,
            released_rx,
            inflight: false,
            pending_echo: HashMap::new(),
            last_reported: None,
        };
        session.clients.insert(opener.0, opener.1);
        session.broadcast(SessionEvent::Open {
            port: session.port.clone(),
            baudrate: session.baudrate,
            inuse: true,
        });
        session.run(requests, serial).await;
    });
}

struct Session {
    port: String,
    baudrate: u32,
    transport: Arc<dyn Transport>,
    manager: SessionManager,
    clients: HashMap<ClientId, mpsc::UnboundedSender<SessionEvent>>,
    queue: CommandQueue,
    /// The session's own subscription to its queue. Released lines park
    /// here until [`Session::pump`] is allowed to transmit them.
    released_rx: mpsc::UnboundedReceiver<String>,
    /// A queued line has been transmitted and its ok/error has not come
    /// back yet. Nothing else from the queue goes out while this is set.
    inflight: bool,
    /// Last raw command each client sent outside the queue. A status
    /// report is echoed raw to exactly the clients whose entry is `?`.
    pending_echo: HashMap<ClientId, String>,
    last_reported: Option<(usize, usize)>,
}

impl Session {
    async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>, serial: SerialConfig) {
        let (mut lines, reader) = spawn_line_reader(self.transport.clone());
        let poll_period = Duration::from_millis(serial.poll_interval_ms);
        let mut poll = interval_at(Instant::now() + poll_period, poll_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let report_period = Duration::from_millis(serial.report_interval_ms);
        let mut report = interval_at(Instant::now() + report_period, report_period);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown = loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        if let Err(shutdown) = self.handle_request(request).await {
                            break shutdown;
                        }
                    }
                    None => break Shutdown::Orphaned,
                },
                line = lines.recv() => match line {
                    Some(Ok(line)) => {
                        if let Err(shutdown) = self.handle_line(line).await {
                            break shutdown;
                        }
                    }
                    Some(Err(e)) => break Shutdown::Fault(format!("read failed: {e}")),
                    None => break Shutdown::Disconnected,
                },
                _ = poll.tick() => {
                    if let Err(e) = self.transport.write(b"?").await {
                        break Shutdown::Fault(format!("status poll failed: {e}"));
                    }
                }
                _ = report.tick() => self.report_queue_status(),
            }
        };
        reader.abort();
        self.teardown(shutdown).await;
    }

    async fn handle_request(&mut self, request: SessionRequest) -> Result<(), Shutdown> {
        match request {
            SessionRequest::Attach { client, tx } => {
                let _ = tx.send(SessionEvent::Open {
                    port: self.port.clone(),
                    baudrate: self.baudrate,
                    inuse: true,
                });
                self.clients.insert(client, tx);
            }
            SessionRequest::Detach { client } => {
                self.clients.remove(&client);
                self.pending_echo.remove(&client);
            }
            SessionRequest::Write { client, text } => {
                self.client_write(client, text, false).await;
            }
            SessionRequest::WriteLine { client, text } => {
                self.client_write(client, text, true).await;
            }
            SessionRequest::Enqueue { lines } => {
                let count = lines.len();
                self.queue.push(lines);
                tracing::info!(port = %self.port, count, "lines enqueued");
            }
            SessionRequest::Run { looping } => {
                self.queue.play(PlayOptions { looping });
                return self.pump().await;
            }
            SessionRequest::Pause => self.queue.pause(),
            SessionRequest::Stop => {
                self.queue.stop();
                self.drain_released();
            }
            SessionRequest::Clear => {
                self.queue.clear();
                self.drain_released();
            }
            SessionRequest::Close { respond_to } => {
                return Err(Shutdown::Requested(respond_to));
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: String) -> Result<(), Shutdown> {
        if line.is_empty() {
            return Ok(());
        }
        match parse_response(&line) {
            ControllerResponse::Ok => {
                self.broadcast(SessionEvent::Readline {
                    port: self.port.clone(),
                    text: line,
                });
                self.advance().await
            }
            ControllerResponse::Error(message) => {
                self.broadcast(SessionEvent::Error {
                    port: self.port.clone(),
                    message,
                });
                self.advance().await
            }
            ControllerResponse::Status(report) => {
                // Raw echo goes only to the clients whose last raw command
                // was `?`; the parsed report is for everyone.
                let askers: Vec<ClientId> = self
                    .pending_echo
                    .iter()
                    .filter(|(_, command)| command.trim() == "?")
                    .map(|(client, _)| *client)
                    .collect();
                for client in askers {
                    self.pending_echo.remove(&client);
                    self.send_to(
                        client,
                        SessionEvent::Readline {
                            port: self.port.clone(),
                            text: line.clone(),
                        },
                    );
                }
                self.broadcast(SessionEvent::Status {
                    port: self.port.clone(),
                    report,
                });
                Ok(())
            }
            ControllerResponse::Malformed(raw) => {
                tracing::debug!(port = %self.port, line = %raw, "dropping malformed status report");
                Ok(())
            }
            ControllerResponse::Raw(text) => {
                self.broadcast(SessionEvent::Readline {
                    port: self.port.clone(),
                    text,
                });
                Ok(())
            }
        }
    }

    /// An ok/error arrived for the line in flight: free the wire, then
    /// transmit the next line. A line released earlier but parked while
    /// the wire was busy takes priority over popping a fresh one.
    async fn advance(&mut self) -> Result<(), Shutdown> {
        self.inflight = false;
        if let Ok(line) = self.released_rx.try_recv() {
            return self.transmit(line).await;
        }
        self.queue.release();
        self.pump().await
    }

    /// Transmits parked released lines while the wire is free. The
    /// in-flight latch opens again only on ack, so at most one line goes
    /// out per call.
    async fn pump(&mut self) -> Result<(), Shutdown> {
        while !self.inflight {
            match self.released_rx.try_recv() {
                Ok(line) => self.transmit(line).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn transmit(&mut self, line: String) -> Result<(), Shutdown> {
        if let Err(e) = self.transport.write(format!("{line}\n").as_bytes()).await {
            return Err(Shutdown::Fault(format!("write failed: {e}")));
        }
        self.inflight = true;
        tracing::debug!(port = %self.port, line = %line, "transmitted");
        self.broadcast(SessionEvent::Readline {
            port: self.port.clone(),
            text: format!("> {line}"),
        });
        Ok(())
    }

    /// Immediate write on behalf of one client, bypassing the queue. A
    /// failure here is reported to that client only; the session and the
    /// other clients carry on.
    async fn client_write(&mut self, client: ClientId, text: String, newline: bool) {
        let payload = if newline {
            format!("{text}\n")
        } else {
            text.clone()
        };
        if let Err(e) = self.transport.write(payload.as_bytes()).await {
            tracing::warn!(port = %self.port, "client write failed: {e}");
            self.send_to(
                client,
                SessionEvent::Error {
                    port: self.port.clone(),
                    message: format!("write failed: {e}"),
                },
            );
            return;
        }
        self.pending_echo.insert(client, text);
    }

    fn report_queue_status(&mut self) {
        let snapshot = (self.queue.executed_count(), self.queue.size());
        if self.last_reported == Some(snapshot) {
            return;
        }
        self.last_reported = Some(snapshot);
        self.broadcast(SessionEvent::QueueStatus {
            port: self.port.clone(),
            executed: snapshot.0,
            total: snapshot.1,
        });
    }

    fn drain_released(&mut self) {
        while self.released_rx.try_recv().is_ok() {}
    }

    fn broadcast(&mut self, event: SessionEvent) {
        self.clients.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn send_to(&mut self, client: ClientId, event: SessionEvent) {
        if let Some(tx) = self.clients.get(&client) {
            if tx.send(event).is_err() {
                self.clients.remove(&client);
            }
        }
    }

    async fn teardown(mut self, shutdown: Shutdown) {
        self.manager.remove(&self.port).await;
        match shutdown {
            Shutdown::Requested(respond_to) => {
                tracing::info!(port = %self.port, "session closed");
                self.broadcast_close();
                let _ = respond_to.send(());
            }
            Shutdown::Fault(message) => {
                tracing::error!(port = %self.port, "session fault: {message}");
                self.broadcast(SessionEvent::Error {
                    port: self.port.clone(),
                    message,
                });
                self.broadcast_close();
            }
            Shutdown::Disconnected => {
                tracing::info!(port = %self.port, "device disconnected");
                self.broadcast_close();
            }
            Shutdown::Orphaned => {
                tracing::debug!(port = %self.port, "all session handles dropped");
                self.broadcast_close();
            }
        }
    }

    fn broadcast_close(&mut self) {
        self.broadcast(SessionEvent::Close {
            port: self.port.clone(),
            inuse: false,
        });
    }
}
