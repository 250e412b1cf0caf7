//! Connection descriptions and their textual form.
//!
//! The textual form is used in launch strings and the environment:
//! `<type>:<hostname>:<port>[:<interface>]`.

use crate::error::{NetError, Result};
use std::fmt;
use std::str::FromStr;

/// Transport type of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Plain TCP.
    TcpIp,
    /// Sockets Direct Protocol; accepted as an alias binding the TCP
    /// transport.
    Sdp,
    /// In-process pipe.
    Pipe,
    /// Reliable multicast group; `hostname` names the group.
    Rsp,
}

impl ConnectionType {
    pub fn is_multicast(&self) -> bool {
        matches!(self, ConnectionType::Rsp)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::TcpIp => "TCPIP",
            ConnectionType::Sdp => "SDP",
            ConnectionType::Pipe => "PIPE",
            ConnectionType::Rsp => "RSP",
        };
        f.write_str(name)
    }
}

impl FromStr for ConnectionType {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TCPIP" => Ok(ConnectionType::TcpIp),
            "SDP" => Ok(ConnectionType::Sdp),
            "PIPE" => Ok(ConnectionType::Pipe),
            "RSP" => Ok(ConnectionType::Rsp),
            other => Err(NetError::BadDescription(format!("unknown connection type {other:?}"))),
        }
    }
}

/// Describes how to reach one endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescription {
    pub conn_type: ConnectionType,
    pub hostname: String,
    pub port: u16,
    pub interface: Option<String>,
}

impl ConnectionDescription {
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        ConnectionDescription {
            conn_type: ConnectionType::TcpIp,
            hostname: hostname.into(),
            port,
            interface: None,
        }
    }

    pub fn pipe() -> Self {
        ConnectionDescription {
            conn_type: ConnectionType::Pipe,
            hostname: "local".into(),
            port: 0,
            interface: None,
        }
    }

    /// A reliable multicast group membership.
    pub fn group(name: impl Into<String>) -> Self {
        ConnectionDescription {
            conn_type: ConnectionType::Rsp,
            hostname: name.into(),
            port: 0,
            interface: None,
        }
    }

    /// The multicast group name, for RSP descriptions.
    pub fn group_name(&self) -> Option<&str> {
        match self.conn_type {
            ConnectionType::Rsp => Some(&self.hostname),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.conn_type, self.hostname, self.port)?;
        if let Some(iface) = &self.interface {
            write!(f, ":{iface}")?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionDescription {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let conn_type: ConnectionType = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| NetError::BadDescription(format!("empty description {s:?}")))?
            .parse()?;
        let hostname = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| NetError::BadDescription(format!("missing hostname in {s:?}")))?
            .to_string();
        let port = parts
            .next()
            .ok_or_else(|| NetError::BadDescription(format!("missing port in {s:?}")))?
            .parse::<u16>()
            .map_err(|e| NetError::BadDescription(format!("bad port in {s:?}: {e}")))?;
        let interface = parts.next().map(str::to_string);

        if parts.next().is_some() {
            return Err(NetError::BadDescription(format!("trailing fields in {s:?}")));
        }

        Ok(ConnectionDescription { conn_type, hostname, port, interface })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let desc: ConnectionDescription = "TCPIP:render1:4242".parse().unwrap();
        assert_eq!(desc.conn_type, ConnectionType::TcpIp);
        assert_eq!(desc.hostname, "render1");
        assert_eq!(desc.port, 4242);
        assert_eq!(desc.interface, None);
        assert_eq!(desc.to_string(), "TCPIP:render1:4242");
    }

    #[test]
    fn test_parse_with_interface() {
        let desc: ConnectionDescription = "SDP:node0:7777:ib0".parse().unwrap();
        assert_eq!(desc.conn_type, ConnectionType::Sdp);
        assert_eq!(desc.interface.as_deref(), Some("ib0"));
        assert_eq!(desc.to_string(), "SDP:node0:7777:ib0");
    }

    #[test]
    fn test_parse_group() {
        let desc: ConnectionDescription = "RSP:frame-data:0".parse().unwrap();
        assert_eq!(desc.group_name(), Some("frame-data"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<ConnectionDescription>().is_err());
        assert!("TCPIP".parse::<ConnectionDescription>().is_err());
        assert!("TCPIP:host".parse::<ConnectionDescription>().is_err());
        assert!("TCPIP:host:notaport".parse::<ConnectionDescription>().is_err());
        assert!("CARRIERPIGEON:host:1".parse::<ConnectionDescription>().is_err());
        assert!("TCPIP:host:1:eth0:extra".parse::<ConnectionDescription>().is_err());
    }
}
