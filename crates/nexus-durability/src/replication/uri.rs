//! `scheme://host:port` destination addresses

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Destination of a producer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    /// Scheme, e.g. `vgx`
    pub scheme: String,
    /// Host name or IP literal (no brackets)
    pub host: String,
    /// Port
    pub port: u16,
}

impl Uri {
    /// Parse `scheme://host:port`; `default_scheme` applies when the scheme is
    /// omitted
    pub fn parse(s: &str, default_scheme: &str) -> Result<Self> {
        let invalid = |why: &str| Error::topology(format!("Invalid URI '{}': {}", s, why));
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => (default_scheme, s),
        };
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
            return Err(invalid("bad scheme"));
        }
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        if port == 0 {
            return Err(invalid("port 0"));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        })
    }

    /// Resolve the host to socket addresses
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::topology(format!("Cannot resolve {}: {}", self, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::topology(format!("Cannot resolve {}: no addresses", self)));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse() {
        let uri = Uri::parse("vgx://replica-1:9000", "vgx").unwrap();
        assert_eq!(uri.host, "replica-1");
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.to_string(), "vgx://replica-1:9000");
    }

    #[test]
    fn test_default_scheme() {
        let uri = Uri::parse("127.0.0.1:9001", "vgx").unwrap();
        assert_eq!(uri.to_string(), "vgx://127.0.0.1:9001");
    }

    #[test]
    fn test_ipv6() {
        let uri = Uri::parse("vgx://[::1]:9002", "vgx").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.to_string(), "vgx://[::1]:9002");
    }

    #[test]
    fn test_invalid() {
        for bad in ["vgx://host", "vgx://:80", "vgx://h:0", "vgx://h:99999", "://h:1"] {
            let err = Uri::parse(bad, "vgx").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Topology, "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let uri = Uri::parse("vgx://127.0.0.1:9003", "vgx").unwrap();
        let addrs = uri.resolve().await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:9003".parse::<SocketAddr>().unwrap());
    }
}
