//! Server configuration, from command-line flags or `SUPPORTCHAT_*`
//! environment variables.

use std::time::Duration;

use clap::Parser;

/// Upper bound for any configured timeout.
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Parser)]
#[command(name = "supportchat-server", about = "Real-time customer support chat server")]
pub struct ServerConfig {
    /// Address for HTTP and WebSocket traffic.
    #[arg(long, env = "SUPPORTCHAT_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path. `:memory:` keeps everything in memory.
    #[arg(long, env = "SUPPORTCHAT_DB_PATH", default_value = "supportchat.db")]
    pub db_path: String,

    /// Capacity of the queue between connection handlers and the dispatcher.
    #[arg(long, env = "SUPPORTCHAT_DISPATCH_QUEUE", default_value_t = 256)]
    pub dispatch_queue: usize,

    /// Per-connection outbound frame buffer. A peer that falls this far
    /// behind is dropped.
    #[arg(long, env = "SUPPORTCHAT_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Seconds of silence before a connection is pinged; a second silent
    /// period drops it.
    #[arg(long, env = "SUPPORTCHAT_IDLE_TIMEOUT", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Deadline for a single socket write.
    #[arg(long, env = "SUPPORTCHAT_WRITE_TIMEOUT", default_value_t = 30)]
    pub write_timeout_secs: u64,

    /// Sustained inbound messages per second per connection. `0` turns
    /// the limiter off.
    #[arg(long, env = "SUPPORTCHAT_RATE_PER_SEC", default_value_t = 0.0)]
    pub rate_per_sec: f64,

    /// Inbound burst allowance per connection, when limiting is on.
    #[arg(long, env = "SUPPORTCHAT_RATE_BURST", default_value_t = 3.0)]
    pub rate_burst: f64,

    /// Maximum message content length in bytes.
    #[arg(long, env = "SUPPORTCHAT_MAX_CONTENT_LEN", default_value_t = 4096)]
    pub max_content_len: usize,

    /// Seconds to wait for open requests on shutdown.
    #[arg(long, env = "SUPPORTCHAT_SHUTDOWN_GRACE", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: "supportchat.db".to_string(),
            dispatch_queue: 256,
            outbound_buffer: 64,
            idle_timeout_secs: 60,
            write_timeout_secs: 30,
            rate_per_sec: 0.0,
            rate_burst: 3.0,
            max_content_len: 4096,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.clamp(1, MAX_TIMEOUT_SECS))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.clamp(1, MAX_TIMEOUT_SECS))
    }

    /// Whether inbound messages are rate limited.
    pub fn rate_limited(&self) -> bool {
        self.rate_per_sec > 0.0
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_parser_defaults() {
        let parsed = ServerConfig::parse_from(["supportchat-server"]);
        let default = ServerConfig::default();
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.db_path, default.db_path);
        assert_eq!(parsed.dispatch_queue, default.dispatch_queue);
        assert_eq!(parsed.rate_burst, default.rate_burst);
        assert_eq!(parsed.rate_per_sec, default.rate_per_sec);
        assert!(!default.rate_limited());
        assert_eq!(parsed.shutdown_grace_secs, default.shutdown_grace_secs);
    }

    #[test]
    fn flags_override() {
        let parsed = ServerConfig::parse_from([
            "supportchat-server",
            "--listen-addr",
            "0.0.0.0:9000",
            "--db-path",
            ":memory:",
            "--rate-per-sec",
            "2.5",
        ]);
        assert_eq!(parsed.listen_addr, "0.0.0.0:9000");
        assert!(parsed.in_memory());
        assert_eq!(parsed.rate_per_sec, 2.5);
        assert!(parsed.rate_limited());
    }

    #[test]
    fn huge_timeouts_are_capped() {
        let config = ServerConfig {
            idle_timeout_secs: u64::MAX,
            write_timeout_secs: u64::MAX,
            ..Default::default()
        };
        let now = tokio::time::Instant::now();
        assert!(now.checked_add(config.idle_timeout()).is_some());
        assert_eq!(config.idle_timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
        assert_eq!(config.write_timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
        assert_eq!(ServerConfig { idle_timeout_secs: 0, ..Default::default() }.idle_timeout(), Duration::from_secs(1));
    }
}
