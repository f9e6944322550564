//! Broadcast registry - the shared table of authenticated connections

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::framing::{Frame, QueuedFrame, encode_frame};
use crate::{LanshareError, Result, ServerMessage};

pub type ConnectionId = u64;

/// How long a broadcast waits on a peer whose queue is full before dropping it
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle for queueing frames to one connection's writer task.
///
/// The queue is bounded twice: by frame count and by the bytes of the frames
/// not yet written. Cloning is cheap. The connection stays open while any
/// clone is alive; `close` tears it down immediately.
#[derive(Debug, Clone)]
pub struct Outbound {
    id: ConnectionId,
    peer: SocketAddr,
    tx: mpsc::Sender<QueuedFrame>,
    budget: Arc<Semaphore>,
    budget_bytes: usize,
    shutdown: CancellationToken,
}

impl Outbound {
    /// Create a handle plus the receiving end for the writer task
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        capacity: usize,
        budget_bytes: usize,
    ) -> (Self, mpsc::Receiver<QueuedFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let budget_bytes = budget_bytes.clamp(1, Semaphore::MAX_PERMITS);
        let outbound = Self {
            id,
            peer,
            tx,
            budget: Arc::new(Semaphore::new(budget_bytes)),
            budget_bytes,
            shutdown: CancellationToken::new(),
        };
        (outbound, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // a frame larger than the whole budget takes all of it
    fn cost(&self, frame: &Frame) -> u32 {
        u32::try_from(frame.len().clamp(1, self.budget_bytes)).unwrap_or(u32::MAX)
    }

    /// Queue a message, waiting until the writer has room for it
    pub async fn send(&self, message: &ServerMessage) -> Result<()> {
        self.send_frame(encode_frame(message)?).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        let cost = self.cost(&frame);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(LanshareError::ConnectionClosed),
            sent = async {
                let permit = self
                    .budget
                    .clone()
                    .acquire_many_owned(cost)
                    .await
                    .map_err(|_| LanshareError::ConnectionClosed)?;
                self.tx
                    .send(QueuedFrame::new(frame, permit))
                    .await
                    .map_err(|_| LanshareError::ConnectionClosed)
            } => sent,
        }
    }

    /// `send_frame`, giving up once `limit` has passed
    pub async fn send_frame_within(&self, frame: Frame, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.send_frame(frame))
            .await
            .map_err(|_| LanshareError::SendStalled { waited: limit })?
    }

    /// Queue a frame without waiting. `Ok(false)` means there is no room
    /// right now; only a dead connection is an error.
    pub fn try_send_frame(&self, frame: Frame) -> Result<bool> {
        if self.is_closed() {
            return Err(LanshareError::ConnectionClosed);
        }
        let Ok(permit) = self.budget.clone().try_acquire_many_owned(self.cost(&frame)) else {
            return Ok(false);
        };
        match self.tx.try_send(QueuedFrame::new(frame, permit)) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(LanshareError::ConnectionClosed),
        }
    }

    /// Force the connection closed
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Clone)]
struct Client {
    nickname: String,
    outbound: Outbound,
}

/// Live authenticated connections keyed by connection id.
///
/// Every operation takes the one lock for its whole duration, including the
/// fan-out loop of `broadcast`. Sends inside the loop never wait. Peers with
/// no room are retried after the lock is released, each for at most the
/// stall timeout.
pub struct BroadcastRegistry {
    clients: Mutex<HashMap<ConnectionId, Client>>,
    stall_timeout: Duration,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::with_stall_timeout(DEFAULT_STALL_TIMEOUT)
    }

    pub fn with_stall_timeout(stall_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            stall_timeout,
        }
    }

    pub async fn register(&self, outbound: Outbound, nickname: impl Into<String>) {
        let nickname = nickname.into();
        tracing::info!(peer = %outbound.peer(), nickname = %nickname, "Client registered");
        let mut clients = self.clients.lock().await;
        clients.insert(outbound.id(), Client { nickname, outbound });
    }

    /// Remove a connection, returning the nickname it was registered under
    pub async fn deregister(&self, id: ConnectionId) -> Option<String> {
        let removed = self.clients.lock().await.remove(&id);
        removed.map(|client| {
            tracing::debug!(nickname = %client.nickname, "Client deregistered");
            client.nickname
        })
    }

    /// Send `message` to every registered connection whose nickname differs
    /// from `exclude`. Dead peers are closed and removed at once; peers whose
    /// queue stays full past the stall timeout are closed and removed too.
    /// Returns the number of peers the message was queued for.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) -> Result<usize> {
        let frame = encode_frame(message)?;
        let mut delivered = 0;
        let mut backlogged = Vec::new();

        {
            let mut clients = self.clients.lock().await;
            let mut failed = Vec::new();
            for (id, client) in clients.iter() {
                if exclude == Some(client.nickname.as_str()) {
                    continue;
                }
                match client.outbound.try_send_frame(frame.clone()) {
                    Ok(true) => delivered += 1,
                    Ok(false) => backlogged.push(client.clone()),
                    Err(e) => {
                        tracing::warn!(
                            nickname = %client.nickname,
                            peer = %client.outbound.peer(),
                            error = %e,
                            "Broadcast send failed, dropping client"
                        );
                        failed.push(*id);
                    }
                }
            }

            for id in failed {
                if let Some(client) = clients.remove(&id) {
                    client.outbound.close();
                }
            }
        }

        if !backlogged.is_empty() {
            delivered += self.deliver_backlogged(backlogged, frame).await;
        }
        Ok(delivered)
    }

    /// Wait on every backlogged peer at once; the slowest bounds the wait
    async fn deliver_backlogged(&self, backlogged: Vec<Client>, frame: Frame) -> usize {
        let mut pending = JoinSet::new();
        for client in backlogged {
            let frame = frame.clone();
            let limit = self.stall_timeout;
            pending.spawn(async move {
                let result = client.outbound.send_frame_within(frame, limit).await;
                (client, result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = pending.join_next().await {
            let Ok((client, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        nickname = %client.nickname,
                        peer = %client.outbound.peer(),
                        error = %e,
                        "Peer stalled, dropping client"
                    );
                    self.deregister(client.outbound.id()).await;
                    client.outbound.close();
                }
            }
        }
        delivered
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const BUDGET: usize = 64 * 1024;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn chat(sender: &str, content: &str) -> ServerMessage {
        ServerMessage::Message {
            sender: sender.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let registry = BroadcastRegistry::new();
        let (alice, mut alice_rx) = Outbound::new(1, peer(1), 8, BUDGET);
        let (bob, mut bob_rx) = Outbound::new(2, peer(2), 8, BUDGET);
        registry.register(alice, "alice").await;
        registry.register(bob, "bob").await;

        let delivered = registry.broadcast(&chat("alice", "hi"), Some("alice")).await.unwrap();
        assert_eq!(delivered, 1);

        let frame = bob_rx.try_recv().unwrap();
        let received: ServerMessage = serde_json::from_str(frame.trim_end()).unwrap();
        assert_eq!(received, chat("alice", "hi"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_exclusion_reaches_everyone() {
        let registry = BroadcastRegistry::new();
        let (alice, mut alice_rx) = Outbound::new(1, peer(1), 8, BUDGET);
        let (bob, mut bob_rx) = Outbound::new(2, peer(2), 8, BUDGET);
        registry.register(alice, "alice").await;
        registry.register(bob, "bob").await;

        assert_eq!(registry.broadcast(&chat("x", "y"), None).await.unwrap(), 2);
        assert!(alice_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn failed_peer_is_removed_and_closed() {
        let registry = BroadcastRegistry::new();
        let (alive, mut alive_rx) = Outbound::new(1, peer(1), 8, BUDGET);
        let (dead, dead_rx) = Outbound::new(2, peer(2), 8, BUDGET);
        let dead_handle = dead.clone();
        registry.register(alive, "alive").await;
        registry.register(dead, "dead").await;
        drop(dead_rx);

        let delivered = registry.broadcast(&chat("x", "hello"), None).await.unwrap();
        assert_eq!(delivered, 1);
        assert!(alive_rx.try_recv().is_ok());
        assert!(!registry.contains(2).await);
        assert!(dead_handle.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn fan_out_survives_one_stalled_and_one_broken_peer() {
        let registry = BroadcastRegistry::with_stall_timeout(Duration::from_millis(100));
        let mut receivers = Vec::new();

        for id in 0..100u64 {
            let (outbound, rx) = Outbound::new(id, peer(1000 + id as u16), 1, BUDGET);
            registry.register(outbound, format!("user{id}")).await;
            receivers.push(Some(rx));
        }

        // user0's writer is gone, user1 never drains its one-slot queue
        receivers[0] = None;
        registry.broadcast(&chat("warmup", "fill"), Some("warmup")).await.unwrap();
        for rx in receivers.iter_mut().skip(2).flatten() {
            rx.try_recv().unwrap();
        }

        let delivered = tokio::time::timeout(
            Duration::from_secs(1),
            registry.broadcast(&chat("user99", "ping"), Some("user99")),
        )
        .await
        .expect("broadcast must not block")
        .unwrap();

        assert_eq!(delivered, 97);
        assert_eq!(registry.len().await, 98);
        assert!(!registry.contains(0).await);
        assert!(!registry.contains(1).await);
        for rx in receivers.iter_mut().skip(2).take(97).flatten() {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn briefly_full_peer_is_kept() {
        let registry = BroadcastRegistry::with_stall_timeout(Duration::from_secs(5));
        let (busy, mut busy_rx) = Outbound::new(1, peer(1), 1, BUDGET);
        registry.register(busy, "busy").await;
        registry.broadcast(&chat("x", "first"), None).await.unwrap();

        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = busy_rx.recv().await.unwrap();
            let second = busy_rx.recv().await.unwrap();
            (first.to_string(), second.to_string())
        });

        assert_eq!(registry.broadcast(&chat("x", "second"), None).await.unwrap(), 1);
        assert!(registry.contains(1).await);

        let (first, second) = drain.await.unwrap();
        assert!(first.contains("first"));
        assert!(second.contains("second"));
    }

    #[tokio::test]
    async fn queued_bytes_are_bounded() {
        let (outbound, mut rx) = Outbound::new(1, peer(1), 16, 100);
        let frame: Frame = Arc::from(format!("{}\n", "a".repeat(59)));

        assert!(outbound.try_send_frame(frame.clone()).unwrap());
        assert!(!outbound.try_send_frame(frame.clone()).unwrap());

        // writing the first frame hands its bytes back
        drop(rx.recv().await.unwrap());
        assert!(outbound.try_send_frame(frame.clone()).unwrap());
    }

    #[tokio::test]
    async fn oversized_frame_takes_the_whole_budget() {
        let (outbound, mut rx) = Outbound::new(1, peer(1), 16, 100);
        let big: Frame = Arc::from("b".repeat(500));

        outbound.send_frame(big).await.unwrap();
        assert!(!outbound.try_send_frame(Arc::from("c\n")).unwrap());
        drop(rx.recv().await.unwrap());
        assert!(outbound.try_send_frame(Arc::from("c\n")).unwrap());
    }

    #[tokio::test]
    async fn deregister_returns_nickname() {
        let registry = BroadcastRegistry::new();
        let (outbound, _rx) = Outbound::new(7, peer(7), 4, BUDGET);
        registry.register(outbound, "carol").await;

        assert_eq!(registry.deregister(7).await, Some("carol".to_string()));
        assert_eq!(registry.deregister(7).await, None);
        assert!(registry.is_empty().await);
    }
}
