use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{
    buffer::DEFAULT_PACK_THRESHOLD,
    error::{NetError, Result},
    line::{LinePolicy, LineReader, DEFAULT_MAX_LINE_LENGTH, LF},
};

use super::{
    connection::{DEFAULT_MAX_INPUT, DEFAULT_READ_CHUNK},
    listener::DEFAULT_BACKLOG,
};

/// Configuration for [`TcpServer`](super::TcpServer) and
/// [`ThreadedTcpServer`](crate::thread_pool::ThreadedTcpServer).
///
/// Controls the bind address, connection limits, socket options and the
/// per-connection buffering applied to every accepted peer. Use
/// [`TcpServerConfig::builder`] for validated construction.
///
/// ## Buffering
///
/// - `read_chunk`: bytes requested from the kernel per `recv`
/// - `max_input`: cap on unconsumed input; exceeding it is a
///   [`NetError::BufferOverflow`] and closes the connection
/// - `max_line_length` / `line_policy`: framing applied by
///   [`TcpConnection::read_line`](super::TcpConnection::read_line)
/// - `pack_threshold`: consumed bytes tolerated before a buffer compacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    /// Local address to bind.
    pub address: Ipv4Addr,
    /// Port to bind; `0` lets the kernel choose.
    pub port: u16,
    /// Kernel accept queue length.
    pub backlog: i32,
    /// Hard limit on concurrent connections (`None` for unlimited).
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY on accepted sockets.
    pub no_delay: bool,
    pub read_chunk: usize,
    pub max_input: usize,
    /// `0` disables the line bound.
    pub max_line_length: usize,
    pub line_delimiter: u8,
    pub line_policy: LinePolicy,
    /// `0` selects the default threshold.
    pub pack_threshold: usize,
}

impl TcpServerConfig {
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }

    /// Checks the buffering limits against each other.
    pub fn validate(&self) -> Result<()> {
        if self.read_chunk == 0 {
            return Err(NetError::Configuration(
                "read_chunk must be greater than zero".into(),
            ));
        }
        if self.max_input < self.read_chunk {
            return Err(NetError::Configuration(format!(
                "max_input ({}) must be at least read_chunk ({})",
                self.max_input, self.read_chunk
            )));
        }
        if self.backlog <= 0 {
            return Err(NetError::Configuration(
                "backlog must be positive".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(NetError::Configuration(
                "max_connections must allow at least one connection".into(),
            ));
        }
        Ok(())
    }

    /// A fresh line reader for one connection.
    pub fn line_reader(&self) -> LineReader {
        LineReader::new(self.line_delimiter, self.max_line_length, self.line_policy)
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            backlog: DEFAULT_BACKLOG,
            max_connections: None,
            no_delay: true,
            read_chunk: DEFAULT_READ_CHUNK,
            max_input: DEFAULT_MAX_INPUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            line_delimiter: LF,
            line_policy: LinePolicy::default(),
            pack_threshold: DEFAULT_PACK_THRESHOLD,
        }
    }
}

/// Builder for [`TcpServerConfig`].
///
/// Unset fields take the values from [`TcpServerConfig::default`].
#[derive(Debug, Clone, Default)]
pub struct TcpServerConfigBuilder {
    config: TcpServerConfig,
}

impl TcpServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.config.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn read_chunk(mut self, size: usize) -> Self {
        self.config.read_chunk = size;
        self
    }

    pub fn max_input(mut self, size: usize) -> Self {
        self.config.max_input = size;
        self
    }

    pub fn max_line_length(mut self, max_len: usize) -> Self {
        self.config.max_line_length = max_len;
        self
    }

    pub fn line_delimiter(mut self, delimiter: u8) -> Self {
        self.config.line_delimiter = delimiter;
        self
    }

    pub fn line_policy(mut self, policy: LinePolicy) -> Self {
        self.config.line_policy = policy;
        self
    }

    pub fn pack_threshold(mut self, threshold: usize) -> Self {
        self.config.pack_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<TcpServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TcpServerConfig::builder().port(8080).build().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backlog, libc::SOMAXCONN);
        assert_eq!(config.read_chunk, 8 * 1024);
        assert_eq!(config.max_line_length, 32 * 1024);
        assert_eq!(config.line_policy, LinePolicy::Split);
        assert!(config.no_delay);
        assert_eq!(config.max_connections, None);
    }

    #[test]
    fn test_builder_rejects_inconsistent_limits() {
        let err = TcpServerConfig::builder()
            .read_chunk(4096)
            .max_input(1024)
            .build()
            .unwrap_err();
        assert!(matches!(err, NetError::Configuration(_)));

        assert!(TcpServerConfig::builder().read_chunk(0).build().is_err());
        assert!(TcpServerConfig::builder().max_connections(0).build().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TcpServerConfig = serde_json::from_str(
            r#"{"port": 7000, "line_policy": "reject", "max_connections": 16}"#,
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.line_policy, LinePolicy::Reject);
        assert_eq!(config.max_connections, Some(16));
        assert_eq!(config.read_chunk, DEFAULT_READ_CHUNK);
        config.validate().unwrap();

        let reader = config.line_reader();
        assert_eq!(reader.policy(), LinePolicy::Reject);
        assert_eq!(reader.delimiter(), LF);
    }
}
