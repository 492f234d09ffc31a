// src/transport/mock.rs - In-memory transport pair for tests
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use super::{Transport, TransportFactory};
use tokio::sync::{Mutex, mpsc};

/// Test half of a [`pair`]: what the session writes shows up on the
/// paired [`MockDevice`], and bytes the device feeds are read back.
pub struct MockTransport {
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Inbound>,
    fail_writes: Arc<AtomicBool>,
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        while inbound.pending.is_empty() {
            match inbound.rx.recv().await {
                Some(Ok(bytes)) => inbound.pending = bytes,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = inbound.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.drain(..n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        self.written_tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock device dropped"))
    }
}

/// Device half driven by the test: observe writes, feed responses,
/// inject faults. Dropping it makes the transport read EOF.
pub struct MockDevice {
    written_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    feed_tx: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockDevice {
    /// Feeds one response line, CRLF-terminated as a Grbl board sends it.
    pub fn feed_line(&self, line: &str) {
        let _ = self.feed_tx.send(Ok(format!("{line}\r\n").into_bytes()));
    }

    pub fn feed_bytes(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            let _ = self.feed_tx.send(Ok(bytes.to_vec()));
        }
    }

    /// Makes the next transport read fail with an I/O error.
    pub fn fail_reads(&self) {
        let _ = self.feed_tx.send(Err(io::Error::other("injected read failure")));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Next raw write made by the session, or `None` once the transport
    /// is gone.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.written_rx.recv().await
    }

    pub async fn next_write_str(&mut self) -> Option<String> {
        self.next_write()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub fn pair() -> (MockTransport, MockDevice) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (feed_tx, feed_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let transport = MockTransport {
        written_tx,
        inbound: Mutex::new(Inbound {
            rx: feed_rx,
            pending: Vec::new(),
        }),
        fail_writes: fail_writes.clone(),
    };
    let device = MockDevice {
        written_rx,
        feed_tx,
        fail_writes,
    };
    (transport, device)
}

/// Factory over pre-registered mock ports. Opening a port consumes its
/// transport half; opening anything else fails like a missing device.
#[derive(Default)]
pub struct MockFactory {
    ports: StdMutex<HashMap<String, MockTransport>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `port` and returns the device half for the test to drive.
    pub fn add_port(&self, port: &str) -> MockDevice {
        let (transport, device) = pair();
        self.ports
            .lock()
            .unwrap()
            .insert(port.to_string(), transport);
        device
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, port: &str, _baudrate: u32) -> io::Result<Arc<dyn Transport>> {
        match self.ports.lock().unwrap().remove(port) {
            Some(transport) => Ok(Arc::new(transport)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port: {port}"),
            )),
        }
    }

    fn available_ports(&self) -> Vec<String> {
        self.ports.lock().unwrap().keys().cloned().collect()
    }
}
