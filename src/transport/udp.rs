// UDP datagram transport
//
// The unreliable path: probes, acks and piggybacked gossip. Sends are
// non-blocking; a datagram that does not fit the socket buffer is dropped
// and the next protocol period covers the loss.

use crate::error::{GossipError, Result};
use crate::transport::{DatagramHandler, Transport};
use crate::wire::NodeAddress;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// UDP transport configuration.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local listen address.
    pub bind_addr: SocketAddr,

    /// SO_SNDBUF, if set.
    pub send_buffer_size: Option<usize>,

    /// SO_RCVBUF, if set.
    pub recv_buffer_size: Option<usize>,

    /// Receive buffer length per datagram; anything longer is truncated by
    /// the OS and will fail to parse.
    pub max_datagram_length_receive: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7946".parse().expect("static address"),
            send_buffer_size: Some(256 * 1024),
            recv_buffer_size: Some(256 * 1024),
            max_datagram_length_receive: 65_535,
        }
    }
}

/// UDP transport. The socket is owned between `startup` and `shutdown`.
pub struct UdpTransport {
    config: UdpConfig,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            socket: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the inbound dispatcher task.
    pub async fn startup(&self, handler: Arc<dyn DatagramHandler>) -> Result<()> {
        let bind_addr = self.config.bind_addr;
        let raw = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        if let Some(size) = self.config.send_buffer_size {
            raw.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.recv_buffer_size {
            raw.set_recv_buffer_size(size)?;
        }
        raw.set_nonblocking(true)?;
        raw.bind(&bind_addr.into())?;

        let socket = Arc::new(UdpSocket::from_std(raw.into())?);
        *self.socket.write() = Some(socket.clone());

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(tx);

        let max_len = self.config.max_datagram_length_receive;
        let worker = tokio::spawn(async move {
            let mut buf = vec![0u8; max_len];
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, peer)) => {
                            tracing::trace!(peer = %peer, bytes = len, "datagram received");
                            if let Err(e) = handler.dispatch_datagram(&buf[..len]) {
                                tracing::warn!(peer = %peer, error = %e,
                                    "inbound datagram rejected");
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "UDP receive failed");
                            break;
                        }
                    }
                }
            }
            tracing::debug!("UDP dispatcher stopped");
        });
        *self.worker.lock() = Some(worker);

        tracing::info!(address = %bind_addr, "UDP transport listening");
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn send(&self, destination: &NodeAddress, payload: &[u8]) -> Result<()> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| GossipError::Transport("UDP transport not started".into()))?;

        match socket.try_send_to(payload, destination.socket_addr()) {
            Ok(sent) if sent == payload.len() => Ok(()),
            Ok(sent) => Err(GossipError::Transport(format!(
                "short send to {}: {} of {} bytes",
                destination,
                sent,
                payload.len()
            ))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Best effort under the engine lock; the next period's
                // probes cover the loss.
                tracing::trace!(peer = %destination, "socket buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(GossipError::Transport(format!(
                "send to {} failed: {}",
                destination, e
            ))),
        }
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
                .map_err(|e| GossipError::Shutdown(format!("UDP dispatcher panicked: {}", e)))?;
        }
        *self.socket.write() = None;
        Ok(())
    }
}
