//! Per-connection handler.
//!
//! Each upgraded WebSocket gets one task that owns the socket outright. It
//! registers the connection, then multiplexes two directions in one loop:
//! inbound frames are validated and submitted to the hub, and frames queued
//! in the connection's outbox are written with a deadline. The task ends on
//! any read error, on a failed write, or when the registry drops the
//! outbox (chat closed, evicted, or a dispatch to this peer failed).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::db::NewMessage;
use crate::error::ChatError;
use crate::frame::{self, ContentCheck, ControlFrame, Inbound, MessageFrame};
use crate::hub::Submission;
use crate::identity::Identity;
use crate::lifecycle;
use crate::registry::ConnId;
use crate::server::SharedState;

/// What a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A customer connection, tied to the customer's open chat.
    Customer { chat_id: i64 },
    /// A staff connection; receives all chat traffic.
    Staff,
}

/// Token bucket limiting inbound messages per connection.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tokens: f64,
    max: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(refill_per_sec: f64, burst: f64) -> Self {
        let max = burst.max(1.0);
        Self { tokens: max, max, refill_per_sec, last: Instant::now() }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max);
        self.last = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

/// Result of handling one inbound text frame.
enum Step {
    Continue,
    Reply(Vec<String>),
    Disconnect,
}

/// Serve one upgraded socket until it closes or is dropped.
pub async fn handle(mut socket: WebSocket, state: Arc<SharedState>, identity: Identity, binding: Binding) {
    let conn_id = state.registry.next_id();
    let write_timeout = state.config.write_timeout();

    // The registry owns the only sender; when it lets go, `rx` ends.
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbound_buffer.max(1));
    match binding {
        Binding::Customer { chat_id } => {
            state.registry.register_customer(conn_id, &identity.username, chat_id, tx);
            tracing::info!(conn_id, user = %identity.username, chat_id, "Customer connected");

            // A close may have landed between resolving the chat and registering.
            if !lifecycle::is_open(&state, chat_id).unwrap_or(false) {
                state.registry.deregister(conn_id);
                let closed = frame::encode(&ControlFrame::ChatClosed { chat_id });
                let _ = send_text(&mut socket, closed, write_timeout).await;
                let _ = socket.send(WsMessage::Close(None)).await;
                return;
            }

            let mut greeting = vec![frame::encode(&ControlFrame::ChatAssigned { chat_id })];
            greeting.extend(replay(&state, chat_id, &identity));
            for text in greeting {
                if let Err(e) = send_text(&mut socket, text, write_timeout).await {
                    tracing::debug!(conn_id, "Greeting failed: {e}");
                    state.registry.deregister(conn_id);
                    return;
                }
            }
        }
        Binding::Staff => {
            state.registry.register_staff(conn_id, &identity.username, tx);
            tracing::info!(conn_id, user = %identity.username, "Staff connected");
        }
    }

    let idle = state.config.idle_timeout();
    let mut limiter = state
        .config
        .rate_limited()
        .then(|| RateLimiter::new(state.config.rate_per_sec, state.config.rate_burst));
    let mut last_activity = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(_))) => {
                        tracing::debug!(conn_id, "Binary frame is a protocol violation");
                        break;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ping/Pong; axum answers pings itself
                        last_activity = Instant::now();
                        awaiting_pong = false;
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, "Read error: {e}");
                        break;
                    }
                };
                last_activity = Instant::now();
                awaiting_pong = false;

                match handle_text(&state, conn_id, &identity, binding, text.as_str(), &mut limiter).await {
                    Step::Continue => {}
                    Step::Reply(frames) => {
                        let mut failed = false;
                        for text in frames {
                            if let Err(e) = send_text(&mut socket, text, write_timeout).await {
                                tracing::debug!(conn_id, "Write failed: {e}");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Step::Disconnect => break,
                }
            }
            out = rx.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = send_text(&mut socket, text, write_timeout).await {
                            tracing::debug!(conn_id, "Write failed: {e}");
                            break;
                        }
                    }
                    None => {
                        tracing::info!(conn_id, "Connection dropped by registry");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(last_activity + idle) => {
                if awaiting_pong {
                    tracing::info!(conn_id, "Idle timeout");
                    break;
                }
                if send_ws(&mut socket, WsMessage::Ping(Default::default()), write_timeout).await.is_err() {
                    break;
                }
                awaiting_pong = true;
                last_activity = Instant::now();
            }
        }
    }

    state.registry.deregister(conn_id);
    let _ = tokio::time::timeout(Duration::from_secs(1), socket.send(WsMessage::Close(None))).await;
    tracing::info!(conn_id, user = %identity.username, "Disconnected");
}

async fn handle_text(
    state: &Arc<SharedState>,
    conn_id: ConnId,
    identity: &Identity,
    binding: Binding,
    text: &str,
    limiter: &mut Option<RateLimiter>,
) -> Step {
    let inbound = match frame::parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::debug!(conn_id, "Undecodable frame: {e}");
            return Step::Disconnect;
        }
    };

    match inbound {
        Inbound::Message { chat_id, content } => {
            match frame::validate_content(&content, state.config.max_content_len) {
                Ok(ContentCheck::Accept) => {}
                Ok(ContentCheck::Empty) => return Step::Continue,
                Err(e) => return error_reply(e.to_string()),
            }
            let chat_id = match (binding, chat_id) {
                (Binding::Customer { chat_id }, _) => chat_id,
                (Binding::Staff, Some(chat_id)) => chat_id,
                (Binding::Staff, None) => return error_reply("chatId is required"),
            };
            if limiter.as_mut().is_some_and(|l| !l.try_acquire()) {
                tracing::debug!(conn_id, "Rate limited");
                return error_reply("you are sending messages too fast");
            }

            let submission = Submission {
                origin: conn_id,
                message: NewMessage {
                    chat_id,
                    sender: identity.sender().to_string(),
                    content,
                    timestamp: Some(Utc::now()),
                },
            };
            match state.hub.submit(submission).await {
                Ok(()) => Step::Continue,
                Err(e) => {
                    tracing::warn!(conn_id, "Submit failed: {e}");
                    Step::Disconnect
                }
            }
        }
        Inbound::Join { chat_id } => match binding {
            Binding::Staff => match lifecycle::history(state, chat_id, identity) {
                Ok(log) => Step::Reply(log.into_iter().map(|m| frame::encode(&MessageFrame::from(m))).collect()),
                Err(e) => error_reply(e.to_string()),
            },
            Binding::Customer { .. } => error_reply("join is only available to staff"),
        },
        Inbound::Unknown(kind) => error_reply(format!("unknown frame type: {kind}")),
    }
}

/// Encoded history of a chat for a newly joined viewer.
fn replay(state: &SharedState, chat_id: i64, viewer: &Identity) -> Vec<String> {
    match lifecycle::history(state, chat_id, viewer) {
        Ok(log) => log.into_iter().map(|m| frame::encode(&MessageFrame::from(m))).collect(),
        Err(e) => {
            tracing::error!(chat_id, "History replay failed: {e}");
            Vec::new()
        }
    }
}

fn error_reply(message: impl Into<String>) -> Step {
    Step::Reply(vec![frame::encode(&ControlFrame::Error { message: message.into() })])
}

async fn send_text(socket: &mut WebSocket, text: String, deadline: Duration) -> Result<(), ChatError> {
    send_ws(socket, WsMessage::Text(text.into()), deadline).await
}

async fn send_ws(socket: &mut WebSocket, msg: WsMessage, deadline: Duration) -> Result<(), ChatError> {
    match tokio::time::timeout(deadline, socket.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ChatError::Transport(e.to_string())),
        Err(_) => Err(ChatError::Transport("write timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_burst_then_refills() {
        let mut limiter = RateLimiter::new(1.0, 3.0);
        let start = limiter.last;
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start + Duration::from_millis(500)));
        assert!(limiter.try_acquire_at(start + Duration::from_millis(1600)));
    }

    #[test]
    fn limiter_caps_at_burst() {
        let mut limiter = RateLimiter::new(10.0, 2.0);
        let later = limiter.last + Duration::from_secs(60);
        assert!(limiter.try_acquire_at(later));
        assert!(limiter.try_acquire_at(later));
        assert!(!limiter.try_acquire_at(later));
    }
}
