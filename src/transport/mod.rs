// src/transport/mod.rs - Serial transport abstraction and line framing
pub mod mock;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Byte-level access to one device. A session owns its transport
/// exclusively; nothing else writes to it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes the whole buffer.
    async fn write(&self, buf: &[u8]) -> io::Result<()>;
}

/// Opens transports and enumerates ports. Injected into sessions so
/// tests can swap the serial layer for [`mock`] pairs.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, port: &str, baudrate: u32) -> io::Result<Arc<dyn Transport>>;
    fn available_ports(&self) -> Vec<String>;
}

/// Real serial port backed by serial2-tokio.
pub struct SerialTransport {
    port: SerialPort,
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.port.write(&buf[written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        Ok(())
    }
}

pub struct SerialFactory;

#[async_trait]
impl TransportFactory for SerialFactory {
    async fn open(&self, port: &str, baudrate: u32) -> io::Result<Arc<dyn Transport>> {
        let port = SerialPort::open(port, baudrate)?;
        Ok(Arc::new(SerialTransport { port }))
    }

    fn available_ports(&self) -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}

/// Spawns the framing task for a transport: raw bytes are accumulated
/// and complete lines (trailing CR/LF stripped) are delivered in order.
/// A read error is delivered once and ends the task; EOF ends the task
/// and is observed as the channel closing.
pub fn spawn_line_reader(
    transport: Arc<dyn Transport>,
) -> (mpsc::UnboundedReceiver<io::Result<String>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let mut pending = String::new();
        loop {
            match transport.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("transport closed by remote");
                    break;
                }
                Ok(n) => {
                    pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = pending.find('\n') {
                        let rest = pending.split_off(pos + 1);
                        let line = std::mem::replace(&mut pending, rest);
                        let line = line.trim_end_matches(['\n', '\r']).to_string();
                        if tx.send(Ok(line)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    (rx, handle)
}
