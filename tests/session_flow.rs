// tests/session_flow.rs - Flow control, status routing, and teardown
use std::sync::Arc;
use std::time::Duration;

use cnc_host::config::SerialConfig;
use cnc_host::session::events::SessionEvent;
use cnc_host::session::{ClientId, SessionManager};
use cnc_host::transport::mock::{MockDevice, MockFactory};
use tokio::sync::mpsc;
use tokio::time::timeout;

const PORT: &str = "/dev/ttyUSB0";

/// Intervals long enough that the periodic poll and report tickers stay
/// out of the way; tests drive everything explicitly.
fn quiet_serial() -> SerialConfig {
    SerialConfig {
        baudrate: 115200,
        poll_interval_ms: 60_000,
        report_interval_ms: 60_000,
    }
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn recv(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_write(device: &mut MockDevice) -> String {
    timeout(Duration::from_secs(5), device.next_write_str())
        .await
        .expect("timed out waiting for write")
        .expect("transport dropped")
}

async fn assert_no_write(device: &mut MockDevice) {
    assert!(
        timeout(Duration::from_millis(100), device.next_write_str())
            .await
            .is_err(),
        "unexpected write reached the device"
    );
}

async fn next_error(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> String {
    loop {
        if let SessionEvent::Error { message, .. } = recv(events).await {
            return message;
        }
    }
}

async fn open_session() -> (
    SessionManager,
    MockDevice,
    ClientId,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    open_session_with(quiet_serial()).await
}

async fn open_session_with(
    serial: SerialConfig,
) -> (
    SessionManager,
    MockDevice,
    ClientId,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let factory = Arc::new(MockFactory::new());
    let device = factory.add_port(PORT);
    let manager = SessionManager::new(factory, serial);
    let client = ClientId::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    manager.open(PORT, None, client, events_tx).await.unwrap();
    match recv(&mut events_rx).await {
        SessionEvent::Open { port, inuse, .. } => {
            assert_eq!(port, PORT);
            assert!(inuse);
        }
        other => panic!("expected open event, got {other:?}"),
    }
    (manager, device, client, events_rx)
}

#[tokio::test]
async fn run_gates_each_line_on_ack() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager
        .enqueue(PORT, lines(&["G0 X1", "G0 X2", "G0 X3"]))
        .await
        .unwrap();
    manager.run(PORT, false).await.unwrap();

    assert_eq!(next_write(&mut device).await, "G0 X1\n");
    assert_no_write(&mut device).await;

    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X3\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn enqueue_appends_to_a_running_program() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    // More lines arrive while the first is still in flight; they extend
    // the program instead of replacing it.
    manager.enqueue(PORT, lines(&["G0 X2"])).await.unwrap();
    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn transmissions_and_acks_echo_to_clients() {
    let (manager, mut device, _client, mut events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");
    device.feed_line("ok");

    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert_eq!(text, "> G0 X1"),
        other => panic!("expected transmit echo, got {other:?}"),
    }
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert_eq!(text, "ok"),
        other => panic!("expected ack echo, got {other:?}"),
    }
}

#[tokio::test]
async fn resume_before_ack_keeps_one_line_in_flight() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager
        .enqueue(PORT, lines(&["G0 X1", "G0 X2", "G0 X3"]))
        .await
        .unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    // Pause and resume while the first line is still unacknowledged.
    manager.pause(PORT).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_no_write(&mut device).await;

    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X3\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn pause_parks_the_queue_until_resume() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1", "G0 X2"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    manager.pause(PORT).await.unwrap();
    device.feed_line("ok");
    assert_no_write(&mut device).await;

    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
}

#[tokio::test]
async fn looped_run_wraps_transparently() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1", "G0 X2"])).await.unwrap();
    manager.run(PORT, true).await.unwrap();

    assert_eq!(next_write(&mut device).await, "G0 X1\n");
    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    // End of program: the loop wraps straight into the first line.
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    manager.stop(PORT).await.unwrap();
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn run_after_completed_job_plays_newly_enqueued_lines() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;

    // The drained job left the queue running; a fresh load and run must
    // still play.
    manager.enqueue(PORT, lines(&["G0 X2"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn repeated_run_mid_job_does_not_double_transmit() {
    let (manager, mut device, _client, _events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1", "G0 X2"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    // A second run while the first line is unacknowledged releases the
    // next line into the parking channel, not onto the wire.
    manager.run(PORT, false).await.unwrap();
    assert_no_write(&mut device).await;

    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    device.feed_line("ok");
    assert_no_write(&mut device).await;
}

#[tokio::test]
async fn status_reports_broadcast_and_echo_to_askers() {
    let (manager, mut device, client, mut events) = open_session().await;

    // A second client joins the same port and never asks for status.
    let bystander = ClientId::new();
    let (tx2, mut events2) = mpsc::unbounded_channel();
    manager.open(PORT, None, bystander, tx2).await.unwrap();
    assert!(matches!(recv(&mut events2).await, SessionEvent::Open { .. }));

    manager.write(PORT, client, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");
    device.feed_line("<Idle,MPos:1.000,2.000,3.000,WPos:4.000,5.000,6.000>");

    // The asker gets the raw report first, then the parsed broadcast.
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert!(text.starts_with("<Idle")),
        other => panic!("expected raw echo, got {other:?}"),
    }
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => {
            assert_eq!(report.active_state, "Idle");
            assert_eq!(report.machine_position.x, 1.0);
            assert_eq!(report.working_position.z, 6.0);
        }
        other => panic!("expected status, got {other:?}"),
    }

    // The bystander sees only the parsed report.
    match recv(&mut events2).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.active_state, "Idle"),
        other => panic!("expected status only, got {other:?}"),
    }

    // A later unsolicited report is not echoed raw to anyone.
    device.feed_line("<Run,MPos:1,2,3,WPos:4,5,6>");
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.active_state, "Run"),
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn newer_write_replaces_the_status_echo_claim() {
    let (manager, mut device, client, mut events) = open_session().await;
    manager.write(PORT, client, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");
    manager
        .write_line(PORT, client, "G90".to_string())
        .await
        .unwrap();
    assert_eq!(next_write(&mut device).await, "G90\n");

    // Only the client's most recent command counts, and it was not "?".
    device.feed_line("<Idle,MPos:1,2,3,WPos:4,5,6>");
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.active_state, "Idle"),
        other => panic!("expected parsed status only, got {other:?}"),
    }
}

#[tokio::test]
async fn detach_leaves_the_port_open_for_others() {
    let (manager, mut device, client, mut events) = open_session().await;

    let guest = ClientId::new();
    let (guest_tx, mut guest_events) = mpsc::unbounded_channel();
    manager.open(PORT, None, guest, guest_tx).await.unwrap();
    assert!(matches!(recv(&mut guest_events).await, SessionEvent::Open { .. }));

    // Guest claims the next status report, then drops off before it lands.
    manager.write(PORT, guest, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");
    manager.detach(guest).await;
    // A write from the surviving client doubles as a barrier: once it
    // reaches the device, the detach ahead of it has been handled.
    manager.write(PORT, client, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");

    device.feed_line("<Idle,MPos:1,2,3,WPos:4,5,6>");
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert!(text.starts_with("<Idle")),
        other => panic!("expected raw echo, got {other:?}"),
    }
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.active_state, "Idle"),
        other => panic!("expected status, got {other:?}"),
    }
    // The detached client's stream closes with nothing further on it.
    assert!(
        timeout(Duration::from_secs(5), guest_events.recv())
            .await
            .expect("timed out waiting for the stream to close")
            .is_none()
    );

    // The port itself stays open and playable.
    manager.enqueue(PORT, lines(&["G0 X1"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");
}

#[tokio::test]
async fn pipe_delimited_reports_parse_too() {
    let (manager, mut device, client, mut events) = open_session().await;
    manager.write(PORT, client, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");

    device.feed_line("<Hold|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>");
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert!(text.starts_with("<Hold")),
        other => panic!("expected raw echo, got {other:?}"),
    }
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.active_state, "Hold"),
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_status_reports_are_dropped() {
    let (manager, mut device, client, mut events) = open_session().await;
    manager.write(PORT, client, "?".to_string()).await.unwrap();
    assert_eq!(next_write(&mut device).await, "?");

    // Missing WPos: dropped without any event, and the pending echo
    // survives for the next good report.
    device.feed_line("<Idle,MPos:1.0,2.0,3.0>");
    device.feed_line("<Idle,MPos:1,2,3,WPos:4,5,6>");
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert!(text.contains("WPos")),
        other => panic!("expected raw echo of the good report, got {other:?}"),
    }
    match recv(&mut events).await {
        SessionEvent::Status { report, .. } => assert_eq!(report.machine_position.z, 3.0),
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn queue_status_broadcasts_only_on_change() {
    let serial = SerialConfig {
        baudrate: 115200,
        poll_interval_ms: 60_000,
        report_interval_ms: 50,
    };
    let (manager, mut device, _client, mut events) = open_session_with(serial).await;

    async fn next_queue_status(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (usize, usize) {
        loop {
            if let SessionEvent::QueueStatus {
                executed, total, ..
            } = recv(events).await
            {
                return (executed, total);
            }
        }
    }

    // The first tick reports the initial snapshot once.
    assert_eq!(next_queue_status(&mut events).await, (0, 0));

    // A stable queue stays silent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::QueueStatus { .. }),
            "queue status repeated without a change"
        );
    }

    manager.enqueue(PORT, lines(&["G0 X1", "G0 X2"])).await.unwrap();
    assert_eq!(next_queue_status(&mut events).await, (0, 2));

    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");
    assert_eq!(next_queue_status(&mut events).await, (1, 2));

    device.feed_line("ok");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
    assert_eq!(next_queue_status(&mut events).await, (2, 2));

    device.feed_line("ok");
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::QueueStatus { .. }),
            "queue status repeated after completion"
        );
    }
}

#[tokio::test]
async fn periodic_poll_queries_status() {
    let serial = SerialConfig {
        baudrate: 115200,
        poll_interval_ms: 50,
        report_interval_ms: 60_000,
    };
    let (_manager, mut device, _client, mut events) = open_session_with(serial).await;

    assert_eq!(next_write(&mut device).await, "?");
    device.feed_line("<Idle,MPos:0,0,0,WPos:0,0,0>");

    // The parsed report is broadcast; nobody asked, so no raw echo.
    loop {
        match recv(&mut events).await {
            SessionEvent::Status { report, .. } => {
                assert_eq!(report.active_state, "Idle");
                break;
            }
            SessionEvent::Readline { text, .. } => panic!("unexpected raw echo: {text}"),
            _ => {}
        }
    }

    // Polling continues.
    assert_eq!(next_write(&mut device).await, "?");
}

#[tokio::test]
async fn device_error_response_advances_the_queue() {
    let (manager, mut device, _client, mut events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1", "G0 X2"])).await.unwrap();
    manager.run(PORT, false).await.unwrap();
    assert_eq!(next_write(&mut device).await, "G0 X1\n");

    device.feed_line("error:20");
    assert_eq!(next_error(&mut events).await, "error:20");
    assert_eq!(next_write(&mut device).await, "G0 X2\n");
}

#[tokio::test]
async fn unsolicited_lines_broadcast_to_everyone() {
    let (_manager, device, _client, mut events) = open_session().await;
    device.feed_line("Grbl 1.1f ['$' for help]");
    match recv(&mut events).await {
        SessionEvent::Readline { text, .. } => assert!(text.starts_with("Grbl 1.1f")),
        other => panic!("expected readline, got {other:?}"),
    }
}

#[tokio::test]
async fn read_fault_tears_down_the_session() {
    let (manager, device, client, mut events) = open_session().await;
    device.fail_reads();

    assert!(next_error(&mut events).await.contains("read failed"));
    match recv(&mut events).await {
        SessionEvent::Close { inuse, .. } => assert!(!inuse),
        other => panic!("expected close, got {other:?}"),
    }
    // The session's sender is gone once teardown finishes.
    assert!(
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .is_none()
    );

    // The registry entry is gone with it.
    assert!(manager.run(PORT, false).await.is_err());
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(manager.open(PORT, None, client, tx).await.is_err());
}

#[tokio::test]
async fn device_disconnect_closes_cleanly() {
    let (manager, device, _client, mut events) = open_session().await;
    drop(device);

    match recv(&mut events).await {
        SessionEvent::Close { inuse, .. } => assert!(!inuse),
        other => panic!("expected close without error, got {other:?}"),
    }
    assert!(manager.pause(PORT).await.is_err());
}

#[tokio::test]
async fn queued_write_failure_is_fatal() {
    let (manager, device, _client, mut events) = open_session().await;
    manager.enqueue(PORT, lines(&["G0 X1"])).await.unwrap();
    device.fail_writes(true);
    manager.run(PORT, false).await.unwrap();

    assert!(next_error(&mut events).await.contains("write failed"));
    match recv(&mut events).await {
        SessionEvent::Close { inuse, .. } => assert!(!inuse),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn adhoc_write_failure_stays_local() {
    let (manager, mut device, client, mut events) = open_session().await;
    device.fail_writes(true);
    manager
        .write_line(PORT, client, "G90".to_string())
        .await
        .unwrap();
    assert!(next_error(&mut events).await.contains("write failed"));

    // The session survives the failed write.
    device.fail_writes(false);
    manager
        .write_line(PORT, client, "G91".to_string())
        .await
        .unwrap();
    assert_eq!(next_write(&mut device).await, "G91\n");
}

#[tokio::test]
async fn close_tears_down_and_acknowledges() {
    let (manager, _device, _client, mut events) = open_session().await;
    manager.close(PORT).await.unwrap();
    match recv(&mut events).await {
        SessionEvent::Close { inuse, .. } => assert!(!inuse),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(manager.close(PORT).await.is_err());
}

#[tokio::test]
async fn open_unknown_port_fails() {
    let factory = Arc::new(MockFactory::new());
    let manager = SessionManager::new(factory, quiet_serial());
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = manager
        .open("/dev/ttyACM9", None, ClientId::new(), tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to open"));
}

#[tokio::test]
async fn operations_require_an_open_port() {
    let factory = Arc::new(MockFactory::new());
    let _device = factory.add_port(PORT);
    let manager = SessionManager::new(factory, quiet_serial());
    assert!(manager.write(PORT, ClientId::new(), "?".to_string()).await.is_err());
    assert!(manager.run(PORT, false).await.is_err());
    assert!(manager.close(PORT).await.is_err());
}
