//! Server list parsing.

use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 11211;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `host`, `host:port`, `[v6]:port` or `unix:///path`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty server entry".to_string());
        }
        if let Some(path) = raw.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(format!("unix socket path must be absolute: `{raw}`"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address: `{raw}`"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, raw)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(format!("unexpected trailing text: `{raw}`")),
            };
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        match raw.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Ok(Endpoint::Tcp {
                host: raw.to_string(),
                port: DEFAULT_PORT,
            }),
            Some((host, port)) => Ok(Endpoint::Tcp {
                host: host.to_string(),
                port: parse_port(port, raw)?,
            }),
            None => Ok(Endpoint::Tcp {
                host: raw.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| format!("invalid port in `{raw}`"))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Parse a comma-separated server list, skipping blank entries.
pub fn parse_server_list(raw: &str) -> Result<Vec<Endpoint>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Endpoint::parse)
        .collect()
}
