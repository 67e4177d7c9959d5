//! SQLite persistence layer.
//!
//! Stores chats, their message log, and the user/session rows written by
//! the authentication layer. Uses WAL mode for concurrent reads during writes.
//!
//! The one-open-chat-per-user rule is enforced by a partial unique index,
//! so `create_or_resume_chat` never relies on an application-level
//! check-then-insert.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use crate::error::{ChatError, ChatResult};
use crate::identity::{Identity, Role};

/// Lifecycle status of a chat. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Open,
    Closed,
}

impl ChatStatus {
    fn as_str(self) -> &'static str {
        match self {
            ChatStatus::Open => "open",
            ChatStatus::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "open" { ChatStatus::Open } else { ChatStatus::Closed }
    }
}

/// A persisted chat row.
#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: i64,
    pub owner: String,
    pub status: ChatStatus,
    pub created_at: DateTime<Utc>,
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A message that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub sender: String,
    pub content: String,
    /// Server-side stamp. `None` lets the store stamp it.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Result of resolving a user's open chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedChat {
    pub id: i64,
    /// True when this call inserted the row.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                role     TEXT NOT NULL DEFAULT 'user'
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token      TEXT PRIMARY KEY,
                username   TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                owner      TEXT NOT NULL,
                status     TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
                created_at INTEGER NOT NULL,
                closed_at  INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_one_open
                ON chats(owner) WHERE status = 'open';

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id   INTEGER NOT NULL REFERENCES chats(id),
                sender    TEXT NOT NULL,
                content   TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
                ON messages(chat_id, id);
            ",
        )?;
        Ok(())
    }

    // ── Identity ───────────────────────────────────────────────────────

    /// Insert or update a user. Written by the authentication layer.
    pub fn add_user(&self, username: &str, role: Role) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (username, role) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET role = excluded.role",
            params![username, role.as_str()],
        )?;
        Ok(())
    }

    /// Issue a session token for an existing user.
    pub fn create_session(&self, username: &str) -> SqlResult<String> {
        let token = hex::encode(rand::random::<[u8; 16]>());
        self.conn.execute(
            "INSERT INTO sessions (token, username, created_at) VALUES (?1, ?2, ?3)",
            params![token, username, Utc::now().timestamp()],
        )?;
        Ok(token)
    }

    /// Resolve a session token to the identity it asserts.
    pub fn lookup_session(&self, token: &str) -> SqlResult<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT u.username, u.role FROM sessions s
                 JOIN users u ON u.username = s.username
                 WHERE s.token = ?1",
                params![token],
                |row| {
                    let username: String = row.get(0)?;
                    let role: String = row.get(1)?;
                    Ok(Identity { username, role: Role::parse(&role) })
                },
            )
            .optional()
    }

    // ── Chats ──────────────────────────────────────────────────────────

    /// Return the user's open chat, creating one if none exists.
    ///
    /// The conditional insert and the lookup share one transaction; the
    /// partial unique index turns a racing second insert into a no-op.
    pub fn create_or_resume_chat(&self, owner: &str) -> ChatResult<ResolvedChat> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO chats (owner, status, created_at) VALUES (?1, 'open', ?2)
             ON CONFLICT DO NOTHING",
            params![owner, Utc::now().timestamp_micros()],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM chats WHERE owner = ?1 AND status = 'open'",
            params![owner],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(ResolvedChat { id, created: inserted == 1 })
    }

    pub fn get_chat(&self, id: i64) -> ChatResult<Option<ChatRow>> {
        let chat = self
            .conn
            .query_row(
                "SELECT id, owner, status, created_at FROM chats WHERE id = ?1",
                params![id],
                map_chat_row,
            )
            .optional()?;
        Ok(chat)
    }

    /// Transition a chat to `closed`. Closing a closed chat is a no-op.
    pub fn close_chat(&self, id: i64) -> ChatResult<CloseOutcome> {
        let updated = self.conn.execute(
            "UPDATE chats SET status = 'closed', closed_at = ?2 WHERE id = ?1 AND status = 'open'",
            params![id, Utc::now().timestamp_micros()],
        )?;
        if updated == 1 {
            return Ok(CloseOutcome::Closed);
        }
        match self.get_chat(id)? {
            Some(_) => Ok(CloseOutcome::AlreadyClosed),
            None => Err(ChatError::NotFound(id)),
        }
    }

    /// All open chats, oldest first.
    pub fn open_chats(&self) -> ChatResult<Vec<ChatRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner, status, created_at FROM chats WHERE status = 'open' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_chat_row)?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Append a message to an open chat and return the stored row.
    ///
    /// The stored timestamp never precedes the chat's latest one, so
    /// insertion order and timestamp order agree.
    pub fn append_message(&self, msg: &NewMessage) -> ChatResult<MessageRow> {
        let tx = self.conn.unchecked_transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM chats WHERE id = ?1",
                params![msg.chat_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref().map(ChatStatus::parse) {
            None => return Err(ChatError::ConstraintViolation(msg.chat_id)),
            Some(ChatStatus::Closed) => return Err(ChatError::ChatClosed(msg.chat_id)),
            Some(ChatStatus::Open) => {}
        }

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE chat_id = ?1",
            params![msg.chat_id],
            |row| row.get(0),
        )?;
        let stamped = msg.timestamp.unwrap_or_else(Utc::now).timestamp_micros();
        let ts = latest.map_or(stamped, |l| stamped.max(l));

        let result = tx.execute(
            "INSERT INTO messages (chat_id, sender, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![msg.chat_id, msg.sender, msg.content, ts],
        );
        if let Err(e) = result {
            if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
                return Err(ChatError::ConstraintViolation(msg.chat_id));
            }
            return Err(e.into());
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(MessageRow {
            id,
            chat_id: msg.chat_id,
            sender: msg.sender.clone(),
            content: msg.content.clone(),
            timestamp: micros_to_datetime(ts),
        })
    }

    /// Every message of a chat, oldest first. Fails with `NotFound` for
    /// an unknown chat id.
    pub fn read_messages(&self, chat_id: i64) -> ChatResult<Vec<MessageRow>> {
        if self.get_chat(chat_id)?.is_none() {
            return Err(ChatError::NotFound(chat_id));
        }
        let mut stmt = self.conn.prepare(
            "SELECT id, chat_id, sender, content, timestamp
             FROM messages
             WHERE chat_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], map_message_row)?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn map_chat_row(row: &Row<'_>) -> SqlResult<ChatRow> {
    let status: String = row.get(2)?;
    Ok(ChatRow {
        id: row.get(0)?,
        owner: row.get(1)?,
        status: ChatStatus::parse(&status),
        created_at: micros_to_datetime(row.get(3)?),
    })
}

fn map_message_row(row: &Row<'_>) -> SqlResult<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        timestamp: micros_to_datetime(row.get(4)?),
    })
}

impl ChatRow {
    pub fn is_open(&self) -> bool {
        self.status == ChatStatus::Open
    }
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
