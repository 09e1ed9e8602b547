//! Binary-framed RPC transport with a long-lived channel pool.
//!
//! One channel per `host:port`, created lazily and kept open until router
//! shutdown or explicit eviction. Frames are length-delimited bincode
//! envelopes carrying a correlation id, method, metadata (trace headers
//! propagate here), and the payload; responses are matched back to
//! callers through the correlation id, so one connection multiplexes any
//! number of in-flight requests. A keepalive ping runs every 30 s with a
//! 10 s timeout; a silent peer gets its channel torn down and the next
//! call reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use agent_mesh_core::error::MeshError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound RPC seam used by the router workers.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one request to `address` and await its response, bounded by
    /// the absolute `deadline`.
    async fn call(
        &self,
        address: &str,
        method: &str,
        metadata: &HashMap<String, String>,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Bytes, MeshError>;

    /// Drop the pooled channel for one address.
    async fn evict(&self, address: &str);

    /// Close every pooled channel.
    async fn shutdown(&self);

    /// Number of live pooled channels.
    async fn channel_count(&self) -> usize;
}

#[derive(Debug, Serialize, Deserialize)]
enum FrameKind {
    Request,
    Response,
    Error,
    Ping,
    Pong,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcFrame {
    id: u64,
    kind: FrameKind,
    method: String,
    metadata: HashMap<String, String>,
    payload: Vec<u8>,
}

type FrameWriter = FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Bytes, MeshError>>>>>;

async fn write_frame(writer: &Mutex<FrameWriter>, frame: RpcFrame) -> Result<(), MeshError> {
    let encoded = bincode::serialize(&frame)
        .map_err(|e| MeshError::serialization(format!("encode frame: {}", e)))?;
    writer
        .lock()
        .await
        .send(Bytes::from(encoded))
        .await
        .map_err(|e| MeshError::remote_unavailable(format!("send frame: {}", e)))
}

/// One pooled connection with its reader and keepalive tasks.
struct Channel {
    writer: Arc<Mutex<FrameWriter>>,
    pending: PendingMap,
    next_id: AtomicU64,
    broken: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
    keepalive_task: tokio::task::JoinHandle<()>,
}

impl Channel {
    async fn connect(address: &str) -> Result<Self, MeshError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| MeshError::remote_unavailable(format!("connect {}: {}", address, e)))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let writer = Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            LengthDelimitedCodec::new(),
        )));

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let broken = Arc::new(AtomicBool::new(false));
        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let reader_pending = pending.clone();
        let reader_broken = broken.clone();
        let reader_last_pong = last_pong.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let decoded: RpcFrame = match bincode::deserialize(&frame) {
                    Ok(decoded) => decoded,
                    Err(_) => continue,
                };
                match decoded.kind {
                    FrameKind::Response => {
                        if let Some(reply) = reader_pending.lock().await.remove(&decoded.id) {
                            let _ = reply.send(Ok(Bytes::from(decoded.payload)));
                        }
                    }
                    FrameKind::Error => {
                        if let Some(reply) = reader_pending.lock().await.remove(&decoded.id) {
                            let message = String::from_utf8_lossy(&decoded.payload).to_string();
                            let _ = reply.send(Err(MeshError::remote_unavailable(message)));
                        }
                    }
                    FrameKind::Pong => {
                        *reader_last_pong.lock().await = Instant::now();
                    }
                    FrameKind::Request | FrameKind::Ping => {
                        // This side only issues requests; inbound requests
                        // and pings are ignored.
                    }
                }
            }
            reader_broken.store(true, Ordering::SeqCst);
            // Fail every caller still waiting on this connection.
            for (_, reply) in reader_pending.lock().await.drain() {
                let _ = reply.send(Err(MeshError::remote_unavailable("connection closed")));
            }
        });

        let keepalive_writer = writer.clone();
        let keepalive_broken = broken.clone();
        let keepalive_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let ping = RpcFrame {
                    id: 0,
                    kind: FrameKind::Ping,
                    method: String::new(),
                    metadata: HashMap::new(),
                    payload: Vec::new(),
                };
                if write_frame(&keepalive_writer, ping).await.is_err() {
                    keepalive_broken.store(true, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(KEEPALIVE_TIMEOUT).await;
                if last_pong.lock().await.elapsed() > KEEPALIVE_INTERVAL + KEEPALIVE_TIMEOUT {
                    tracing::warn!("keepalive timed out; marking channel broken");
                    keepalive_broken.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        Ok(Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            broken,
            reader_task,
            keepalive_task,
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn call(
        &self,
        method: &str,
        metadata: &HashMap<String, String>,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Bytes, MeshError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, reply);

        let frame = RpcFrame {
            id,
            kind: FrameKind::Request,
            method: method.to_string(),
            metadata: metadata.clone(),
            payload: payload.to_vec(),
        };
        if let Err(err) = write_frame(&self.writer, frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::remote_unavailable("connection closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(MeshError::DeadlineExceeded {
                    operation: format!("rpc {}", method),
                })
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.keepalive_task.abort();
    }
}

/// Pooled framed-TCP transport.
pub struct FramedTcpTransport {
    pool: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Default for FramedTcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FramedTcpTransport {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
        }
    }

    async fn channel_for(&self, address: &str) -> Result<Arc<Channel>, MeshError> {
        let mut pool = self.pool.lock().await;
        if let Some(channel) = pool.get(address) {
            if !channel.is_broken() {
                return Ok(channel.clone());
            }
            pool.remove(address);
        }
        let channel = Arc::new(Channel::connect(address).await?);
        pool.insert(address.to_string(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl RpcTransport for FramedTcpTransport {
    async fn call(
        &self,
        address: &str,
        method: &str,
        metadata: &HashMap<String, String>,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Bytes, MeshError> {
        let channel = self.channel_for(address).await?;
        channel.call(method, metadata, payload, deadline).await
    }

    async fn evict(&self, address: &str) {
        self.pool.lock().await.remove(address);
    }

    async fn shutdown(&self) {
        self.pool.lock().await.clear();
    }

    async fn channel_count(&self) -> usize {
        self.pool.lock().await.len()
    }
}
