//! Broadcast hub: the single path from "message accepted" to "message
//! delivered".
//!
//! Connection handlers submit validated messages into one bounded queue.
//! A single task drains it, appends each message to the store and fans
//! the stored row out to the registry's recipients. Because there is one
//! consumer, dispatch order equals persistence order. A full queue blocks
//! the submitting handler instead of dropping the message.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::NewMessage;
use crate::error::{ChatError, ChatResult};
use crate::frame::{self, ControlFrame, MessageFrame};
use crate::registry::{ConnId, ConnectionRegistry};
use crate::server::SharedState;

/// A message waiting to be persisted and dispatched.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Connection that sent it; told about failures.
    pub origin: ConnId,
    pub message: NewMessage,
}

/// Producer side of the hub queue.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Submission>,
}

impl HubHandle {
    /// Create the hub queue. The receiver goes to [`run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a message, waiting while the queue is full.
    pub async fn submit(&self, submission: Submission) -> ChatResult<()> {
        self.tx
            .send(submission)
            .await
            .map_err(|_| ChatError::Transport("dispatch queue closed".into()))
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Recipients whose queue was closed or full; they were deregistered.
    pub dropped: usize,
}

/// Deliver a stored message to every live recipient of its chat.
///
/// The recipient set is snapshotted under the registry lock and written
/// outside it. A failed write deregisters that recipient only.
pub fn dispatch(registry: &ConnectionRegistry, message: &MessageFrame) -> DispatchReport {
    let text = frame::encode(message);
    let mut report = DispatchReport::default();
    for recipient in registry.snapshot_recipients(message.chat_id) {
        match recipient.tx.try_send(text.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                tracing::info!(conn_id = recipient.id, chat_id = message.chat_id, reason, "Dropping recipient");
                registry.deregister(recipient.id);
                report.dropped += 1;
            }
        }
    }
    report
}

/// Drain the hub queue until every producer is gone.
pub async fn run(state: Arc<SharedState>, mut rx: mpsc::Receiver<Submission>) {
    while let Some(Submission { origin, message }) = rx.recv().await {
        let chat_id = message.chat_id;
        let stored = state.db.lock().append_message(&message);
        match stored {
            Ok(row) => {
                let frame = MessageFrame::from(row);
                let report = dispatch(&state.registry, &frame);
                tracing::debug!(
                    chat_id,
                    msg_id = frame.id,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Dispatched"
                );
            }
            Err(e) => {
                match &e {
                    ChatError::ChatClosed(_) => tracing::warn!(chat_id, conn_id = origin, "Message to closed chat dropped"),
                    _ => tracing::error!(chat_id, conn_id = origin, "Failed to persist message: {e}"),
                }
                let notice = ControlFrame::Error { message: e.to_string() };
                state.registry.send_to(origin, frame::encode(&notice));
            }
        }
    }
    tracing::info!("Dispatch queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Db;
    use chrono::Utc;
    use std::time::Duration;

    fn message(chat_id: i64, id: i64) -> MessageFrame {
        MessageFrame {
            id,
            chat_id,
            sender: "A".into(),
            content: "hello".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn broken_recipient_does_not_poison_the_rest() {
        let reg = ConnectionRegistry::new();
        let (s1, mut r1) = mpsc::channel(4);
        let (s2, mut r2) = mpsc::channel(4);
        let (s3, r3) = mpsc::channel(4);
        reg.register_staff(1, "a", s1);
        reg.register_staff(2, "b", s2);
        reg.register_staff(3, "c", s3);
        drop(r3); // peer went away mid-broadcast

        let report = dispatch(&reg, &message(1, 1));
        assert_eq!(report, DispatchReport { delivered: 2, dropped: 1 });
        assert!(r1.try_recv().unwrap().contains("\"content\":\"hello\""));
        assert!(r2.try_recv().is_ok());
        assert!(!reg.is_registered(3));
        assert!(reg.is_registered(1) && reg.is_registered(2));
    }

    #[test]
    fn full_queue_is_treated_as_dead_peer() {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        reg.register_customer(1, "A", 5, tx);
        assert_eq!(dispatch(&reg, &message(5, 1)).delivered, 1);
        assert_eq!(dispatch(&reg, &message(5, 2)).dropped, 1);
        assert!(!reg.is_registered(1));
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn run_persists_then_dispatches_in_order() {
        let db = Db::open_memory().unwrap();
        let chat = db.create_or_resume_chat("A").unwrap();
        let (state, rx) = SharedState::new(ServerConfig::default(), db);
        let (staff_tx, mut staff_rx) = mpsc::channel(16);
        state.registry.register_staff(9, "root", staff_tx);
        tokio::spawn(run(Arc::clone(&state), rx));

        for content in ["one", "two", "three"] {
            state
                .hub
                .submit(Submission {
                    origin: 9,
                    message: NewMessage {
                        chat_id: chat.id,
                        sender: "A".into(),
                        content: content.into(),
                        timestamp: Some(Utc::now()),
                    },
                })
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame: MessageFrame = serde_json::from_str(&recv(&mut staff_rx).await).unwrap();
            seen.push((frame.id, frame.content));
        }
        let stored = state.db.lock().read_messages(chat.id).unwrap();
        let expected: Vec<_> = stored.into_iter().map(|m| (m.id, m.content)).collect();
        assert_eq!(seen, expected);
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_to_origin_only() {
        let db = Db::open_memory().unwrap();
        let (state, rx) = SharedState::new(ServerConfig::default(), db);
        let (origin_tx, mut origin_rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        state.registry.register_staff(1, "root", origin_tx);
        state.registry.register_staff(2, "ops", other_tx);
        tokio::spawn(run(Arc::clone(&state), rx));

        state
            .hub
            .submit(Submission {
                origin: 1,
                message: NewMessage { chat_id: 404, sender: "staff".into(), content: "hi".into(), timestamp: None },
            })
            .await
            .unwrap();

        let notice: ControlFrame = serde_json::from_str(&recv(&mut origin_rx).await).unwrap();
        assert!(matches!(notice, ControlFrame::Error { .. }));
        assert!(other_rx.try_recv().is_err());
        assert!(state.db.lock().open_chats().unwrap().is_empty());
    }
}
