//! Proxy endpoint and connection commands

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A SOCKS proxy to tunnel through
///
/// Immutable for the lifetime of a session; equality is structural.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Host name or IP literal
    pub host: String,
    /// Port, 1-65535
    pub port: u16,
    /// Optional SOCKS username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Optional SOCKS password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

impl ProxyEndpoint {
    /// Create an endpoint without credentials
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let endpoint = Self {
            host: host.into(),
            port,
            user: None,
            pass: None,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Attach SOCKS credentials
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Validate host and port
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::InvalidConfig("proxy host is required".into()));
        }
        if host.len() != self.host.len() || host.chars().any(|c| c.is_whitespace() || c == '\0') {
            return Err(Error::InvalidConfig(format!("invalid proxy host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("proxy port must be 1-65535".into()));
        }
        Ok(())
    }

    /// The `host:port` string handed to the forwarding engine
    pub fn server_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.user {
            Some(ref user) => write!(f, "{}@{}", user, self.server_address()),
            None => write!(f, "{}", self.server_address()),
        }
    }
}

impl std::fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A request from the external command layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(ProxyEndpoint),
    Disconnect,
}

impl Command {
    /// Build a CONNECT command from loosely-typed fields
    ///
    /// A missing or blank host, or a port that is not an integer in
    /// 1-65535, is rejected. Blank credentials are treated as absent.
    pub fn connect(
        host: Option<&str>,
        port: Option<&str>,
        user: Option<&str>,
        pass: Option<&str>,
    ) -> Result<Self> {
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig("CONNECT requires a host".into()))?;

        let port = port
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidConfig("CONNECT requires a port".into()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid port '{}'", port)))?;

        let mut endpoint = ProxyEndpoint::new(host, port)?;
        endpoint.user = non_blank(user);
        endpoint.pass = non_blank(pass);

        Ok(Command::Connect(endpoint))
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).map(str::to_string)
}
