//! The framed request/response channel carried by each peer connection.
//!
//! One bidirectional QUIC stream per connection; both sides write
//! length-prefixed JSON frames on it. Outgoing requests are correlated to
//! responses by id through oneshot completions; the owning reader loop
//! routes inbound frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use iroh::endpoint::{Connection, RecvStream, SendStream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{NodeError, NodeResult};
use crate::protocol::{Frame, ResponseEnvelope, MAX_FRAME_SIZE};

/// Read one frame, or `None` when the stream ended.
pub async fn read_frame(recv: &mut RecvStream) -> NodeResult<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    if recv.read_exact(&mut len_bytes).await.is_err() {
        // Stream closed between frames
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NodeError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| NodeError::Network(format!("truncated frame: {}", e)))?;

    let frame = serde_json::from_slice(&buf)
        .map_err(|e| NodeError::Protocol(format!("malformed frame: {}", e)))?;
    Ok(Some(frame))
}

/// One peer's request channel.
pub struct RpcChannel {
    peer: String,
    conn: Connection,
    send: tokio::sync::Mutex<SendStream>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>,
    next_id: AtomicU64,
    /// Background pushers (log subscriptions) tied to this channel
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcChannel {
    pub fn new(peer: String, conn: Connection, send: SendStream) -> Self {
        Self {
            peer,
            conn,
            send: tokio::sync::Mutex::new(send),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Hex id of the peer on the other side.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn write_frame(&self, frame: &Frame) -> NodeResult<()> {
        let body = serde_json::to_vec(frame)
            .map_err(|e| NodeError::Serialization(e.to_string()))?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(NodeError::Protocol(format!(
                "frame too large: {} bytes",
                body.len()
            )));
        }
        let mut send = self.send.lock().await;
        send.write_all(&(body.len() as u32).to_be_bytes())
            .await
            .map_err(|e| NodeError::Network(format!("failed to send frame: {}", e)))?;
        send.write_all(&body)
            .await
            .map_err(|e| NodeError::Network(format!("failed to send frame: {}", e)))?;
        Ok(())
    }

    /// Send a request and wait for the matching response. There is no
    /// intrinsic timeout; callers that need one layer it themselves.
    pub async fn request(&self, method: &str, payload: Value) -> NodeResult<ResponseEnvelope> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        trace!(peer = %self.peer, id, method, "sending request");
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await
            .map_err(|_| NodeError::Cancelled(format!("connection to {} closed", self.peer)))
    }

    /// Send the response for an inbound request.
    pub async fn respond(&self, id: u64, envelope: ResponseEnvelope) -> NodeResult<()> {
        self.write_frame(&Frame::Response {
            id,
            status: envelope.status,
            data: envelope.data,
        })
        .await
    }

    /// Send a fire-and-forget push frame.
    pub async fn push(&self, kind: &str, payload: Value) -> NodeResult<()> {
        self.write_frame(&Frame::Push {
            kind: kind.to_string(),
            payload,
        })
        .await
    }

    /// Complete a pending request from the reader loop.
    pub fn complete(&self, id: u64, envelope: ResponseEnvelope) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(envelope);
        } else {
            debug!(peer = %self.peer, id, "response for unknown request id");
        }
    }

    /// Attach a background task to this channel's lifetime.
    pub fn register_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Abort attached tasks, fail pending requests, close the connection.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.lock().clear();
        self.conn.close(0u32.into(), b"closed");
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("peer", &self.peer)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
