//! Small helpers shared by startup code and the key vault client.

use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Listen address of the gRPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP `host:port`, meant for local development
    Tcp(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Parse `unix:///path/to.sock` or `tcp://host:port`.
///
/// The scheme is matched case-insensitively; the address must be non-empty.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEndpoint`] for any other form.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(endpoint.to_string());

    let (scheme, address) = endpoint.split_once("://").ok_or_else(invalid)?;
    if address.is_empty() {
        return Err(invalid());
    }

    match scheme.to_ascii_lowercase().as_str() {
        "unix" => Ok(Endpoint::Unix(PathBuf::from(address))),
        "tcp" => Ok(Endpoint::Tcp(address.to_string())),
        _ => Err(invalid()),
    }
}

/// Strip surrounding whitespace and double quotes from a config value.
///
/// Values copied from JSON or YAML frequently arrive as `"name"` or with a
/// trailing newline. Whitespace and quotes are trimmed together so the result
/// is a fixed point: sanitizing twice yields the same string.
#[must_use]
pub fn sanitize_string(value: &str) -> String {
    value
        .trim_matches(|c: char| c.is_whitespace() || c == '"')
        .to_string()
}
