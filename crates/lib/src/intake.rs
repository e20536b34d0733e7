//! Bounded intake queue between producers (webhook server, poller, scheduler) and dispatcher workers.

use crate::error::{GatewayError, Result};
use crate::message::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};

/// Producer side. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<Message>,
    capacity: usize,
}

/// Consumer side, shared by the worker pool.
#[derive(Clone)]
pub struct IntakeReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

/// Create a queue holding at most `depth` messages (minimum 1).
pub fn intake_queue(depth: usize) -> (IntakeQueue, IntakeReceiver) {
    let capacity = depth.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        IntakeQueue { tx, capacity },
        IntakeReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl IntakeQueue {
    /// Enqueue without waiting. `QueueFull` when at capacity, `Shutdown` once workers are gone.
    /// On error the message is handed back so the caller can retry it.
    pub fn try_submit(&self, msg: Message) -> std::result::Result<(), (GatewayError, Message)> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => (
                GatewayError::QueueFull {
                    capacity: self.capacity,
                },
                m,
            ),
            mpsc::error::TrySendError::Closed(m) => (GatewayError::Shutdown, m),
        })
    }

    pub fn submit(&self, msg: Message) -> Result<()> {
        self.try_submit(msg).map_err(|(e, _)| e)
    }

    /// Messages currently waiting.
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive hold on the receiver. Other workers wait until it is dropped, so whatever the
/// holder does with a message before dropping it happens in queue order.
pub struct IntakeGuard<'a> {
    rx: MutexGuard<'a, mpsc::Receiver<Message>>,
}

impl IntakeReceiver {
    /// Next message; `None` once every producer is dropped and the queue is drained.
    pub async fn recv(&self) -> Option<Message> {
        self.lock().await.recv().await
    }

    pub async fn lock(&self) -> IntakeGuard<'_> {
        IntakeGuard {
            rx: self.rx.lock().await,
        }
    }
}

impl IntakeGuard<'_> {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, Origin};

    fn msg(text: &str) -> Message {
        Message::synthetic(Channel::Telegram, "1", text, Origin::Scheduled)
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (q, rx) = intake_queue(2);
        q.submit(msg("a")).unwrap();
        q.submit(msg("b")).unwrap();
        assert_eq!(q.depth(), 2);
        match q.try_submit(msg("c")) {
            Err((GatewayError::QueueFull { capacity }, m)) => {
                assert_eq!(capacity, 2);
                assert_eq!(m.text(), "c");
            }
            other => panic!("expected QueueFull, got {:?}", other.map_err(|(e, _)| e)),
        }
        assert_eq!(rx.recv().await.unwrap().text(), "a");
        q.submit(msg("c")).unwrap();
        assert_eq!(rx.recv().await.unwrap().text(), "b");
        assert_eq!(rx.recv().await.unwrap().text(), "c");
    }

    #[tokio::test]
    async fn closed_queue_reports_shutdown() {
        let (q, rx) = intake_queue(1);
        drop(rx);
        assert!(matches!(q.submit(msg("a")), Err(GatewayError::Shutdown)));
    }
}
