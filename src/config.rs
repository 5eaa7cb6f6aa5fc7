use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration.
///
/// The copy-execution service runs on every tape server host; jobs are
/// handed off by connecting to `copyd_port` on the drive's server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Port of the copy-execution service on each tape server.
    pub copyd_port: u16,

    /// How long to wait for the copy-execution service to acknowledge a
    /// start-job message before rolling the match back.
    pub dispatch_timeout: Duration,

    /// After a dispatch failure the drive stays FREE but is skipped by the
    /// matching engine for this long, so a dead tape server is not hammered.
    pub dispatch_retry_backoff: Duration,

    /// Upper bound on pending requests per drive group.
    pub max_queue_len: usize,

    /// Start with matching held (maintenance mode).
    pub start_held: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:5012"
                .parse()
                .expect("default listen address is valid"),
            copyd_port: 5003,
            dispatch_timeout: Duration::from_secs(5),
            dispatch_retry_backoff: Duration::from_secs(30),
            max_queue_len: 10_000,
            start_held: false,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:5012");
        assert_eq!(cfg.copyd_port, 5003);
        assert_eq!(cfg.dispatch_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_queue_len, 10_000);
        assert!(!cfg.start_held);
    }

    #[test]
    fn server_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = ServerConfig::new(addr);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.copyd_port, 5003);
    }
}
