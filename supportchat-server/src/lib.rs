//! Real-time customer support chat.
//!
//! A customer and staff exchange messages over WebSockets. Messages are
//! persisted before they are fanned out, chats move from open to closed
//! exactly once, and each user has at most one open chat.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod frame;
pub mod hub;
pub mod identity;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod web;
