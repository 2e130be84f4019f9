//! RPC client used by the signaling plane to drive media nodes

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{read_frame, write_frame, RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
use crate::{Error, Result};

/// One logical connection to a media node. Survives reconnects: when the
/// TCP stream dies all pending calls fail and `is_connected` flips until
/// [`MediaRpcClient::reconnect`] succeeds.
pub struct MediaRpcClient {
    addr: SocketAddr,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<DashMap<u64, mpsc::UnboundedSender<ResponseFrame>>>,
}

impl MediaRpcClient {
    /// Create a client and attempt the first connect. A failed initial
    /// connect is not fatal; the health checker will retry.
    pub async fn connect(addr: SocketAddr) -> Arc<Self> {
        let client = Arc::new(Self {
            addr,
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
        });
        if let Err(e) = client.reconnect().await {
            warn!(addr = %addr, error = %e, "initial RPC connect failed");
        }
        client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// (Re-)establish the TCP stream and restart the reader task.
    pub async fn reconnect(&self) -> Result<()> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| Error::transport(format!("RPC connect to {} failed: {}", self.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport(format!("set_nodelay failed: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let addr = self.addr;
        tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                match read_frame::<_, ResponseFrame>(&mut reader).await {
                    Ok(Some(frame)) => {
                        let id = frame.id;
                        let done = frame.done;
                        if let Some(entry) = pending.get(&id) {
                            let _ = entry.value().send(frame);
                        }
                        if done {
                            pending.remove(&id);
                        }
                    }
                    Ok(None) => {
                        debug!(addr = %addr, "RPC connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "RPC read error");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            // wake every waiter with a synthetic failure
            for entry in pending.iter() {
                let _ = entry.value().send(ResponseFrame {
                    id: *entry.key(),
                    response: RpcResponse::Error {
                        message: "connection lost".to_string(),
                    },
                    done: true,
                });
            }
            pending.clear();
        });

        debug!(addr = %addr, "RPC connected");
        Ok(())
    }

    async fn send(&self, frame: &RequestFrame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::transport(format!("Not connected to {}", self.addr)))?;
        match write_frame(writer, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Unary call: send a request, await its single response frame.
    pub async fn request(&self, request: RpcRequest, deadline: Duration) -> Result<RpcResponse> {
        if !self.is_connected() {
            return Err(Error::transport(format!("Not connected to {}", self.addr)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);

        let frame = RequestFrame { id, request };
        if let Err(e) = self.send(&frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let response = timeout(deadline, rx.recv()).await;
        match response {
            Ok(Some(frame)) => frame.response.into_result(),
            Ok(None) => {
                self.pending.remove(&id);
                Err(Error::transport("RPC channel closed"))
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::timeout(format!(
                    "RPC call to {} timed out after {:?}",
                    self.addr, deadline
                )))
            }
        }
    }

    /// Streaming call: returns a receiver of response frames. The stream
    /// ends with a frame whose `done` flag is set.
    pub async fn request_stream(
        &self,
        request: RpcRequest,
    ) -> Result<mpsc::UnboundedReceiver<ResponseFrame>> {
        if !self.is_connected() {
            return Err(Error::transport(format!("Not connected to {}", self.addr)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);

        let frame = RequestFrame { id, request };
        if let Err(e) = self.send(&frame).await {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }
}
