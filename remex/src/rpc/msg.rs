//! Wire messages.
//!
//! Every request and response is exactly one newline-terminated JSON object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, net::SocketAddr};

/// A dialable (host, port) pair.
///
/// Transmitted as a two element list `[host, port]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Address {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Creates a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Address> for (String, u16) {
    fn from(addr: Address) -> Self {
        (addr.host, addr.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self { host: addr.ip().to_string(), port: addr.port() }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A remote method invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the invoked method.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Outcome of a remote method invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    /// The method returned a value.
    Result(Value),
    /// The method failed.
    Error(WireError),
}

/// An application error as transmitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Error kind name.
    pub name: String,
    /// Message followed by payload values.
    #[serde(default)]
    pub args: Vec<Value>,
}
