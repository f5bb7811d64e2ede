use anyhow::{Context, Result, anyhow, bail};
use std::{fmt, str::FromStr, time::Duration};

/// Default depth of the pending-connection queue
pub const DEFAULT_BACKLOG: u32 = 100;

/// Default relay read timeout. Kept small so both directions of a tunnel get
/// serviced quickly and shutdown is noticed promptly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Default maximum number of bytes requested per read
pub const DEFAULT_BLOCK_SIZE: usize = 9999;

/// Largest block size accepted, each tunnel allocates one block up front
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Endpoint is a host and port pair, e.g. `127.0.0.1:9000` or `[::1]:9000`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        // Split on the last colon so bare IPv6 hosts still fail loudly below
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("[ERR] expected <host:port>, got '{s}'"))?;

        // Strip brackets from IPv6 literals
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            bail!("[ERR] missing host in '{s}'");
        }
        if host.contains(':') && !s.starts_with('[') {
            bail!("[ERR] IPv6 hosts must be bracketed, e.g. [::1]:80, got '{s}'");
        }

        let port = port
            .parse::<u16>()
            .with_context(|| format!("[ERR] invalid port in '{s}'"))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Config holds the listening and remote endpoints along with the
/// tunables used while relaying. It is shared read-only once the
/// server starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    pub remote: Endpoint,
    pub backlog: u32,
    pub read_timeout: Duration,
    pub block_size: usize,
    /// 0 = quiet, 1 = verbose, 2 = very verbose
    pub verbosity: u8,
    pub whitelist: Vec<String>,
}

impl Config {
    /// new builds a config with default tunables
    pub fn new(listen: Endpoint, remote: Endpoint) -> Self {
        Self {
            listen,
            remote,
            backlog: DEFAULT_BACKLOG,
            read_timeout: DEFAULT_READ_TIMEOUT,
            block_size: DEFAULT_BLOCK_SIZE,
            verbosity: 0,
            whitelist: Vec::new(),
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// with_whitelist seeds the client whitelist, an empty list allows all
    pub fn with_whitelist<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// validate checks the tunables before the server is started
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("[ERR] block size must be positive");
        }
        if self.block_size > MAX_BLOCK_SIZE {
            bail!(
                "[ERR] block size must be at most {MAX_BLOCK_SIZE} bytes, got {}",
                self.block_size
            );
        }
        if self.read_timeout.is_zero() {
            bail!("[ERR] read timeout must be positive");
        }
        if self.verbosity > 2 {
            bail!("[ERR] verbosity must be 0, 1 or 2, got {}", self.verbosity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_endpoint() {
        let ep: Endpoint = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 9000));
        assert_eq!(ep.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn parses_hostname_endpoint() {
        let ep: Endpoint = "localhost:80".parse().unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 80);
    }

    #[test]
    fn parses_bracketed_ipv6_endpoint() {
        let ep: Endpoint = "[::1]:8080".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.to_string(), "[::1]:8080");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!("127.0.0.1".parse::<Endpoint>().is_err());
        assert!(":9000".parse::<Endpoint>().is_err());
        assert!("host:70000".parse::<Endpoint>().is_err());
        assert!("host:abc".parse::<Endpoint>().is_err());
        assert!("::1:80".parse::<Endpoint>().is_err());
    }

    #[test]
    fn defaults_and_builders() {
        let config = Config::new(Endpoint::new("0.0.0.0", 1), Endpoint::new("10.0.0.1", 2));
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.whitelist.is_empty());
        assert!(config.validate().is_ok());

        let config = config
            .with_backlog(5)
            .with_block_size(16)
            .with_read_timeout(Duration::from_millis(10))
            .with_verbosity(2)
            .with_whitelist(["10.0.0.5"]);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.block_size, 16);
        assert_eq!(config.whitelist, vec!["10.0.0.5".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_tunables() {
        let base = Config::new(Endpoint::new("0.0.0.0", 1), Endpoint::new("10.0.0.1", 2));
        assert!(base.clone().with_block_size(0).validate().is_err());
        assert!(base.clone().with_read_timeout(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_verbosity(3).validate().is_err());
        assert!(
            base.clone()
                .with_block_size(MAX_BLOCK_SIZE + 1)
                .validate()
                .is_err()
        );
        assert!(base.with_block_size(MAX_BLOCK_SIZE).validate().is_ok());
    }
}
