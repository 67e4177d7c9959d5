//! Chat session lifecycle: `open → closed`, nothing else.
//!
//! A user has at most one open chat. Resuming is idempotent, closing is
//! idempotent and terminal, and a close drops every live connection bound
//! to the chat so neither side keeps writing into it.

use crate::db::{ChatRow, CloseOutcome, MessageRow, ResolvedChat};
use crate::error::{ChatError, ChatResult};
use crate::frame::{self, ControlFrame};
use crate::identity::Identity;
use crate::server::SharedState;

/// Return the user's open chat id, creating the chat if needed.
pub fn create_or_resume(state: &SharedState, username: &str) -> ChatResult<ResolvedChat> {
    let resolved = state.db.lock().create_or_resume_chat(username)?;
    if resolved.created {
        tracing::info!(chat_id = resolved.id, user = username, "Chat opened");
    }
    Ok(resolved)
}

/// Close a chat on behalf of its owner or a staff member.
pub fn close(state: &SharedState, chat_id: i64, actor: &Identity) -> ChatResult<CloseOutcome> {
    let outcome = {
        let db = state.db.lock();
        let chat = db.get_chat(chat_id)?.ok_or(ChatError::NotFound(chat_id))?;
        authorize(&chat, actor)?;
        db.close_chat(chat_id)?
    };

    // Also runs on an already-closed chat, to catch a connection that
    // registered while the close was in flight.
    let farewell = frame::encode(&ControlFrame::ChatClosed { chat_id });
    let dropped = state.registry.drop_chat(chat_id, &farewell);

    match outcome {
        CloseOutcome::Closed => tracing::info!(
            chat_id,
            by = %actor.username,
            role = ?actor.role,
            dropped = dropped.len(),
            "Chat closed"
        ),
        CloseOutcome::AlreadyClosed => tracing::debug!(chat_id, "Chat already closed"),
    }
    Ok(outcome)
}

/// Stored history of a chat, oldest first.
pub fn history(state: &SharedState, chat_id: i64, viewer: &Identity) -> ChatResult<Vec<MessageRow>> {
    let db = state.db.lock();
    let chat = db.get_chat(chat_id)?.ok_or(ChatError::NotFound(chat_id))?;
    authorize(&chat, viewer)?;
    db.read_messages(chat_id)
}

pub fn open_chats(state: &SharedState) -> ChatResult<Vec<ChatRow>> {
    state.db.lock().open_chats()
}

/// Whether the chat exists and is still open.
pub fn is_open(state: &SharedState, chat_id: i64) -> ChatResult<bool> {
    Ok(state.db.lock().get_chat(chat_id)?.is_some_and(|c| c.is_open()))
}

/// Staff may act on any chat, customers only on their own.
fn authorize(chat: &ChatRow, actor: &Identity) -> ChatResult<()> {
    if actor.is_staff() || chat.owner == actor.username {
        Ok(())
    } else {
        Err(ChatError::Forbidden)
    }
}
