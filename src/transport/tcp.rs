// Reliable TCP transport
//
// Carries list synchronization. Frames are u32-LE length-prefixed so a
// whole member list arrives as one datagram regardless of size. Outbound
// sends run as detached best-effort tasks because the caller holds the
// engine lock; failures are logged, not surfaced.

use crate::error::{GossipError, Result};
use crate::transport::{DatagramHandler, Transport};
use crate::wire::NodeAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Reliable transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Local listen address; conventionally the same port as the UDP side.
    pub bind_addr: SocketAddr,

    /// Outbound connection timeout.
    pub connect_timeout: Duration,

    /// Upper bound on one inbound frame. A 16K-member list is well under
    /// 1 MB; anything bigger is a protocol violation.
    pub max_frame_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7946".parse().expect("static address"),
            connect_timeout: Duration::from_secs(10),
            max_frame_length: 4 * 1024 * 1024,
        }
    }
}

/// Reliable transport. The listener is owned between `startup` and
/// `shutdown`; per-connection handlers are joined on shutdown.
pub struct TcpTransport {
    config: TcpConfig,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the acceptor task.
    pub async fn startup(&self, handler: Arc<dyn DatagramHandler>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(address = %self.config.bind_addr, "reliable transport listening");

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(tx);

        let max_frame = self.config.max_frame_length;
        let worker = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, max_frame, handler).await
                                {
                                    tracing::warn!(peer = %peer, error = %e,
                                        "reliable connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
            // Listener closes here; drain the in-flight handlers.
            drop(listener);
            while connections.join_next().await.is_some() {}
            tracing::debug!("reliable acceptor stopped");
        });
        *self.worker.lock() = Some(worker);

        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn send(&self, destination: &NodeAddress, payload: &[u8]) -> Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(GossipError::Encode(format!(
                "frame of {} bytes exceeds u32 length prefix",
                payload.len()
            )));
        }
        let addr = destination.socket_addr();
        let payload = payload.to_vec();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            if let Err(e) = send_frame(addr, &payload, timeout).await {
                tracing::warn!(peer = %addr, error = %e, "reliable send failed");
            }
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| GossipError::Shutdown(format!("acceptor panicked: {}", e)))?;
        }
        Ok(())
    }
}

async fn send_frame(addr: SocketAddr, payload: &[u8], timeout: Duration) -> Result<()> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| GossipError::Transport(format!("connect to {} timed out", addr)))??;

    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    max_frame: usize,
    handler: Arc<dyn DatagramHandler>,
) -> Result<()> {
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > max_frame {
            return Err(GossipError::Transport(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, max_frame
            )));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        if let Err(e) = handler.dispatch_datagram(&payload) {
            tracing::warn!(error = %e, "inbound frame rejected");
        }
    }
}
