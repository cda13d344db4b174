//! One persistent WebSocket connection to a master.
//!
//! A writer task drains an outgoing queue into the socket; a reader task
//! routes acks back to the waiting callers by frame id. When the reader ends
//! for any reason every pending call fails and the close reason is delivered
//! on the `closed` receiver returned from [`Connection::open`]. A deliberate
//! [`Connection::close`] drops that sender instead, so observers can tell the
//! two apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{self, Frame, NAMESPACE_AGENT};
use crate::error::ClusterError;

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// A live connection. Dropping it tears down both tasks.
pub struct Connection {
    node: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    /// Cleared by the reader once the socket is done.
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Session URL for a master node.
    pub fn url_for(node: &str) -> String {
        format!("ws://{node}{NAMESPACE_AGENT}")
    }

    /// Open a connection to `node` (`host:port`).
    pub async fn open(
        node: &str,
        rpc_timeout: Duration,
    ) -> Result<(Self, oneshot::Receiver<String>), ClusterError> {
        let url = Self::url_for(node);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClusterError::Connect {
                node: node.to_string(),
                reason: e.to_string(),
            })?;

        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed_rx) = oneshot::channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let pong = outgoing.clone();
        let reader_node = node.to_string();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => dispatch(&reader_pending, text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by master: {}", frame.reason.as_str()),
                            None => "closed by master".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            debug!(node = %reader_node, reason = %reason, "Connection reader finished");
            reader_alive.store(false, Ordering::SeqCst);
            fail_pending(&reader_pending);
            let _ = closed_tx.send(reason);
        });

        let connection = Self {
            node: node.to_string(),
            outgoing,
            pending,
            alive,
            next_id: AtomicU64::new(1),
            rpc_timeout,
            reader,
            writer,
        };
        Ok((connection, closed_rx))
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Send `event` with `payload` and wait for its acknowledgement.
    pub async fn call(&self, event: &str, payload: Value) -> Result<Value, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&Frame::Call {
            id,
            event: event.to_string(),
            payload,
        })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // Registered after the reader gave up: nobody will ever answer.
        if !self.alive.load(Ordering::SeqCst)
            || self.outgoing.send(Message::Text(frame.into())).is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(ClusterError::Disconnected);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(payload)) => protocol::ack_result(event, payload),
            Ok(Err(_)) => Err(ClusterError::Disconnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ClusterError::Timeout {
                    event: event.to_string(),
                    timeout: self.rpc_timeout,
                })
            }
        }
    }

    /// Close deliberately. Pending calls fail with `Disconnected` and the
    /// `closed` receiver sees its sender dropped rather than a reason.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        let _ = self.outgoing.send(Message::Close(None));
        fail_pending(&self.pending);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn dispatch(pending: &PendingAcks, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Ack { id, payload }) => match lock(pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => debug!(id, "Dropping ack for unknown call"),
        },
        Ok(Frame::Call { event, .. }) => {
            debug!(event = %event, "Ignoring call from master");
        }
        Err(e) => warn!(error = %e, "Unrecognized frame from master"),
    }
}

fn fail_pending(pending: &PendingAcks) {
    // Dropping the senders wakes every waiter with a receive error.
    lock(pending).clear();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
