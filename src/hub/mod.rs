use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use warp::ws::Message;

/// Per-client send queue depth. Overflow drops the message: a slow consumer
/// must never stall the broadcast path.
pub const CLIENT_QUEUE_DEPTH: usize = 32;

/// Multiplexes persistent channels by user id. A user may hold several
/// channels at once (multi-tab); each gets its own bounded queue drained by
/// its connection's writer task, which is what serializes per-client writes.
pub struct Hub {
    clients: RwLock<HashMap<i64, HashMap<u64, mpsc::Sender<Message>>>>,
    next_client_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Registers a channel's send queue and hands back the id used to
    /// unregister it. The caller keeps the receiving end for its writer task.
    pub fn register(&self, user_id: i64, tx: mpsc::Sender<Message>) -> u64 {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().entry(user_id).or_default().insert(client_id, tx);
        client_id
    }

    /// Bounded queue pair for one channel.
    pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(CLIENT_QUEUE_DEPTH)
    }

    pub fn unregister(&self, user_id: i64, client_id: u64) {
        let mut clients = self.clients.write();
        if let Some(set) = clients.get_mut(&user_id) {
            set.remove(&client_id);
            if set.is_empty() {
                clients.remove(&user_id);
            }
        }
    }

    pub fn broadcast(&self, msg: &Message) {
        let clients = self.clients.read();
        for set in clients.values() {
            for tx in set.values() {
                push(tx, msg);
            }
        }
    }

    pub fn send_to_user(&self, user_id: i64, msg: &Message) {
        let clients = self.clients.read();
        if let Some(set) = clients.get(&user_id) {
            for tx in set.values() {
                push(tx, msg);
            }
        }
    }

    /// Distinct users with at least one open channel.
    pub fn online_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.clients.read().keys().copied().collect()
    }
}

fn push(tx: &mpsc::Sender<Message>, msg: &Message) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(msg.clone()) {
        // queue full: drop rather than block the producer
        tracing::debug!("client queue full, message dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::text(s)
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_all_tabs() {
        let hub = Hub::new();
        let (tx1, mut rx1) = Hub::channel();
        let (tx2, mut rx2) = Hub::channel();
        hub.register(7, tx1);
        hub.register(7, tx2);
        hub.send_to_user(7, &text("hi"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(hub.online_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_covers_every_user() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = Hub::channel();
        let (tx_b, mut rx_b) = Hub::channel();
        hub.register(1, tx_a);
        hub.register(2, tx_b);
        hub.broadcast(&text("state"));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        let mut ids = hub.user_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let hub = Hub::new();
        let (tx, mut rx) = Hub::channel();
        hub.register(3, tx);
        for i in 0..CLIENT_QUEUE_DEPTH + 10 {
            hub.send_to_user(3, &text(&format!("m{i}")));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CLIENT_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn test_unregister_removes_empty_user() {
        let hub = Hub::new();
        let (tx, _rx) = Hub::channel();
        let id = hub.register(9, tx);
        assert_eq!(hub.online_count(), 1);
        hub.unregister(9, id);
        assert_eq!(hub.online_count(), 0);
        hub.send_to_user(9, &text("late")); // no panic, no delivery
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_harmless() {
        let hub = Hub::new();
        let (tx, rx) = Hub::channel();
        hub.register(4, tx);
        drop(rx);
        hub.broadcast(&text("x"));
    }
}
