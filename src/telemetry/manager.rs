//! Cross-process telemetry: the parent process binds a loopback listener and
//! ingests sample batches that worker processes forward over a compact
//! length-prefixed binary protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::reader::{MetricExporter, MetricSample};
use super::Recorder;
use crate::{Error, Result};

/// Where the manager listens unless configured otherwise.
pub const DEFAULT_MANAGER_ADDR: &str = "127.0.0.1:4315";

/// Largest accepted frame; a batch beyond this is a protocol error.
const MAX_FRAME_BYTES: u32 = 16 << 20;

/// The parent-process sample sink. Lives as long as the parent process;
/// dropping it stops the listener.
#[derive(Debug)]
pub struct TelemetryManager {
    local_addr: std::net::SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TelemetryManager {
    /// Binds `addr` (the default loopback port when empty) and ingests every
    /// forwarded batch into `recorder`.
    pub async fn serve(recorder: Arc<Recorder>, addr: &str) -> Result<TelemetryManager> {
        let addr = if addr.is_empty() {
            DEFAULT_MANAGER_ADDR
        } else {
            addr
        };
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Other(format!("telemetry manager bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Other(e.to_string()))?;
        tracing::debug!(addr = %local_addr, "telemetry manager listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "telemetry worker connected");
                        let recorder = recorder.clone();
                        tokio::spawn(async move {
                            if let Err(err) = ingest_connection(recorder, stream).await {
                                tracing::debug!(error = %err, "telemetry worker disconnected");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "telemetry manager accept failed");
                        break;
                    }
                }
            }
        });

        Ok(TelemetryManager {
            local_addr,
            accept_task,
        })
    }

    /// The bound address, useful with an ephemeral port.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Drop for TelemetryManager {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn ingest_connection(recorder: Arc<Recorder>, mut stream: TcpStream) -> Result<()> {
    loop {
        let len = match stream.read_u32_le().await {
            Ok(len) => len,
            // Clean end of stream.
            Err(ref err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(Error::Other(err.to_string())),
        };
        if len > MAX_FRAME_BYTES {
            return Err(Error::Other(format!("telemetry frame of {} bytes", len)));
        }
        let mut payload = vec![0u8; len as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        let batch: Vec<MetricSample> = bincode::deserialize(&payload)
            .map_err(|e| Error::Other(format!("telemetry frame: {}", e)))?;
        recorder.ingest(batch);
    }
}

/// Exporter used inside worker processes: ships each batch to the parent's
/// manager, reconnecting lazily after failures.
#[derive(Debug)]
pub struct TcpExporter {
    addr: String,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TcpExporter {
    /// An exporter targeting `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        TcpExporter {
            addr: addr.into(),
            stream: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl MetricExporter for TcpExporter {
    async fn export(&self, batch: &[MetricSample]) -> Result<()> {
        let payload = bincode::serialize(batch).map_err(|e| Error::Other(e.to_string()))?;
        if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
            return Err(Error::Other("telemetry batch exceeds frame bound".to_string()));
        }

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| Error::unavailable("export", "", e.to_string()))?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connected above");
        let write = async {
            stream.write_u32_le(payload.len() as u32).await?;
            stream.write_all(&payload).await?;
            stream.flush().await
        };
        if let Err(err) = write.await {
            // Drop the broken connection; the next export redials.
            *guard = None;
            return Err(Error::unavailable("export", "", err.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderSchema;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CaptureExporter {
        samples: Mutex<Vec<MetricSample>>,
    }

    #[async_trait]
    impl MetricExporter for CaptureExporter {
        async fn export(&self, batch: &[MetricSample]) -> Result<()> {
            self.samples.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn fast_reader() -> ReaderSchema {
        ReaderSchema {
            collect_interval_millis: 10,
            collect_interval_timeout: 50,
            export_interval_millis: 20,
            export_timeout_millis: 100,
        }
    }

    #[tokio::test]
    async fn workers_forward_through_the_manager() -> Result<(), Box<dyn std::error::Error>> {
        // Parent: a recorder draining into a capture exporter.
        let capture = Arc::new(CaptureExporter::default());
        let parent = Recorder::with_exporter(fast_reader(), BTreeMap::new(), capture.clone());
        let manager = TelemetryManager::serve(parent, "127.0.0.1:0").await?;

        // Worker: a recorder whose exporter ships to the manager.
        let worker = Recorder::with_exporter(
            fast_reader(),
            BTreeMap::from([("worker".to_string(), "1".to_string())]),
            Arc::new(TcpExporter::new(manager.local_addr().to_string())),
        );
        worker.operation_started("memory", "read");
        worker.operation_finished("memory", "read", "success", 0.01, Some(64));

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let samples = capture.samples.lock().unwrap();
        assert!(samples.iter().any(|s| s.name == "request.sum"));
        assert!(samples
            .iter()
            .any(|s| s.attributes.get("worker").map(String::as_str) == Some("1")));
        Ok(())
    }
}
