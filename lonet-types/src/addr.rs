use std::fmt;

/// Address of a virtnet endpoint: `network` names the virtual network (elided
/// from the string form), `host` is the owning host's name and `port` its
/// port on that host.
///
/// The string form only ever prints `host:port` (`network` is elided), but
/// equality is componentwise over all three fields, matching the reference
/// implementation's `Addr.__eq__`, which compares `.net` along with `.host`
/// and `.port`.
#[derive(Debug, Clone)]
pub struct Addr {
    pub network: String,
    pub host: String,
    pub port: u32,
}

impl Addr {
    pub fn new(network: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Addr {
            network: network.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses `"host:port"` into a virtnet address for `network`. The host
    /// part may be empty (resolved later against the calling host, see
    /// [`Addr::parse_relative`]); the port part must be a valid `u32`.
    pub fn parse(network: impl Into<String>, text: &str) -> Result<Addr, AddrParseError> {
        let mut parts = text.splitn(2, ':');
        let host = parts.next().unwrap_or("");
        let Some(port) = parts.next() else {
            return Err(AddrParseError(text.to_string()));
        };
        // splitn(2, ..) never yields a third part, but a bare "a:b:c" must
        // still be rejected: the port half would contain a stray ':'.
        let port: u32 = port.parse().map_err(|_| AddrParseError(text.to_string()))?;
        Ok(Addr::new(network, host, port))
    }

    /// Parses `text` relative to `self_host`: an empty host component
    /// resolves to `self_host` (`":0"` dialed/listened from host `"a"` means
    /// `"a:0"`).
    pub fn parse_relative(
        network: impl Into<String>,
        text: &str,
        self_host: &str,
    ) -> Result<Addr, AddrParseError> {
        let mut addr = Addr::parse(network, text)?;
        if addr.host.is_empty() {
            addr.host = self_host.to_string();
        }
        Ok(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.host == other.host && self.port == other.port
    }
}
impl Eq for Addr {}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid virtnet address")]
pub struct AddrParseError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let a = Addr::new("lonetX", "alpha", 42);
        let s = a.to_string();
        let b = Addr::parse("lonetX", &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_host_allowed() {
        let a = Addr::parse("lonetX", ":0").unwrap();
        assert_eq!(a.host, "");
        assert_eq!(a.port, 0);
    }

    #[test]
    fn relative_resolves_empty_host() {
        let a = Addr::parse_relative("lonetX", ":0", "alpha").unwrap();
        assert_eq!(a.host, "alpha");
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(Addr::parse("lonetX", "alpha").is_err());
    }

    #[test]
    fn rejects_non_integer_port() {
        assert!(Addr::parse("lonetX", "alpha:x").is_err());
    }

    #[test]
    fn rejects_extra_colon() {
        assert!(Addr::parse("lonetX", "alpha:1:2").is_err());
    }
}
