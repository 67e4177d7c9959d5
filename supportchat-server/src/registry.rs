//! Live connection registry.
//!
//! Maps connection ids to the outbound queue of their socket task. Customer
//! connections are bound to one chat; staff connections are global and
//! receive every chat's traffic. The registry holds only the sending half
//! of each queue: removing an entry drops that sender, which ends the
//! owning connection task once its queue drains.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::identity::Role;

pub type ConnId = u64;

/// Outbound queue of one connection. Frames are pre-encoded JSON text.
pub type Outbox = mpsc::Sender<String>;

struct Entry {
    role: Role,
    chat_id: Option<i64>,
    user: String,
    tx: Outbox,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, Entry>,
    /// chat id -> the customer connection bound to it
    customers: HashMap<i64, ConnId>,
    staff: HashSet<ConnId>,
}

impl Inner {
    fn remove(&mut self, id: ConnId) -> Option<Entry> {
        let entry = self.conns.remove(&id)?;
        match entry.role {
            Role::Staff => {
                self.staff.remove(&id);
            }
            Role::Customer => {
                if let Some(chat_id) = entry.chat_id {
                    if self.customers.get(&chat_id) == Some(&id) {
                        self.customers.remove(&chat_id);
                    }
                }
            }
        }
        Some(entry)
    }
}

/// A dispatch target captured under the lock.
#[derive(Clone)]
pub struct Recipient {
    pub id: ConnId,
    pub tx: Outbox,
}

/// Live connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub customers: usize,
    pub staff: usize,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a customer connection under its chat.
    ///
    /// A chat has at most one live customer connection: an earlier one for
    /// the same chat is evicted and its id returned.
    pub fn register_customer(&self, id: ConnId, user: &str, chat_id: i64, tx: Outbox) -> Option<ConnId> {
        let mut inner = self.inner.lock();
        let evicted = inner.customers.get(&chat_id).copied().filter(|old| *old != id);
        if let Some(old) = evicted {
            inner.remove(old);
            tracing::info!(conn_id = old, chat_id, "Evicted previous customer connection");
        }
        inner.conns.insert(
            id,
            Entry { role: Role::Customer, chat_id: Some(chat_id), user: user.to_string(), tx },
        );
        inner.customers.insert(chat_id, id);
        evicted
    }

    /// Register a staff connection. Staff see every chat.
    pub fn register_staff(&self, id: ConnId, user: &str, tx: Outbox) {
        let mut inner = self.inner.lock();
        inner.conns.insert(id, Entry { role: Role::Staff, chat_id: None, user: user.to_string(), tx });
        inner.staff.insert(id);
    }

    /// Remove a connection. Safe to call any number of times; returns
    /// whether this call removed it.
    pub fn deregister(&self, id: ConnId) -> bool {
        let removed = self.inner.lock().remove(id);
        if let Some(ref entry) = removed {
            tracing::debug!(conn_id = id, user = %entry.user, role = ?entry.role, "Deregistered");
        }
        removed.is_some()
    }

    /// Queue a frame for one connection. Returns false if it is gone or
    /// its queue is full.
    pub fn send_to(&self, id: ConnId, frame: String) -> bool {
        let tx = self.inner.lock().conns.get(&id).map(|e| e.tx.clone());
        tx.is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    pub fn is_registered(&self, id: ConnId) -> bool {
        self.inner.lock().conns.contains_key(&id)
    }

    /// Everyone who should receive a message for `chat_id`: all staff plus
    /// the chat's customer connection, if live.
    ///
    /// Callers write outside the lock; a recipient may deregister before
    /// its write lands.
    pub fn snapshot_recipients(&self, chat_id: i64) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let customer = inner.customers.get(&chat_id);
        inner
            .staff
            .iter()
            .chain(customer)
            .filter_map(|id| inner.conns.get(id).map(|e| Recipient { id: *id, tx: e.tx.clone() }))
            .collect()
    }

    /// Drop every connection bound to `chat_id`. `farewell` is queued to
    /// each first, best-effort. Returns the removed ids.
    pub fn drop_chat(&self, chat_id: i64, farewell: &str) -> Vec<ConnId> {
        let mut inner = self.inner.lock();
        let bound: Vec<ConnId> = inner
            .conns
            .iter()
            .filter(|(_, e)| e.chat_id == Some(chat_id))
            .map(|(id, _)| *id)
            .collect();
        for id in &bound {
            if let Some(entry) = inner.remove(*id) {
                let _ = entry.tx.try_send(farewell.to_string());
            }
        }
        bound
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats { customers: inner.customers.len(), staff: inner.staff.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<String>) {
        mpsc::channel(8)
    }

    fn ids(recipients: &[Recipient]) -> Vec<ConnId> {
        let mut v: Vec<_> = recipients.iter().map(|r| r.id).collect();
        v.sort();
        v
    }

    #[test]
    fn customer_receives_only_own_chat() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = outbox();
        let (b, _rb) = outbox();
        reg.register_customer(1, "alice", 10, a);
        reg.register_customer(2, "bob", 20, b);
        assert_eq!(ids(&reg.snapshot_recipients(10)), [1]);
        assert_eq!(ids(&reg.snapshot_recipients(20)), [2]);
        assert!(reg.snapshot_recipients(30).is_empty());
    }

    #[test]
    fn staff_receive_every_chat() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = outbox();
        let (s1, _r1) = outbox();
        let (s2, _r2) = outbox();
        reg.register_customer(1, "alice", 10, a);
        reg.register_staff(2, "root", s1);
        reg.register_staff(3, "ops", s2);
        assert_eq!(ids(&reg.snapshot_recipients(10)), [1, 2, 3]);
        assert_eq!(ids(&reg.snapshot_recipients(99)), [2, 3]);
        assert_eq!(reg.stats(), RegistryStats { customers: 1, staff: 2 });
    }

    #[test]
    fn deregister_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = outbox();
        reg.register_customer(1, "alice", 10, a);
        assert!(reg.deregister(1));
        assert!(!reg.deregister(1));
        assert!(!reg.is_registered(1));
        assert!(reg.snapshot_recipients(10).is_empty());
    }

    #[test]
    fn second_customer_connection_evicts_first() {
        let reg = ConnectionRegistry::new();
        let (a, mut ra) = outbox();
        let (b, _rb) = outbox();
        reg.register_customer(1, "alice", 10, a);
        assert_eq!(reg.register_customer(2, "alice", 10, b), Some(1));
        assert_eq!(ids(&reg.snapshot_recipients(10)), [2]);
        // The evicted queue is closed once its sender is gone.
        assert!(matches!(ra.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        // Late deregistration of the evicted id doesn't unbind the new one.
        assert!(!reg.deregister(1));
        assert_eq!(ids(&reg.snapshot_recipients(10)), [2]);
    }

    #[test]
    fn drop_chat_removes_bound_connections_and_sends_farewell() {
        let reg = ConnectionRegistry::new();
        let (a, mut ra) = outbox();
        let (s, _rs) = outbox();
        reg.register_customer(1, "alice", 10, a);
        reg.register_staff(2, "root", s);

        assert_eq!(reg.drop_chat(10, "bye"), [1]);
        assert!(!reg.is_registered(1));
        assert!(reg.is_registered(2));
        assert_eq!(ra.try_recv().unwrap(), "bye");
        assert!(matches!(ra.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        assert!(reg.drop_chat(10, "bye").is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let reg = ConnectionRegistry::new();
        let a = reg.next_id();
        let b = reg.next_id();
        assert_ne!(a, b);
    }
}
