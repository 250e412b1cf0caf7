//! TCP transport.

use super::{
    Connection, ConnectionDescription, ConnectionRef, ConnectionState, Listener, ListenerRef,
    StateCell,
};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A connected TCP stream.
pub struct TcpConnection {
    description: ConnectionDescription,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: StateCell,
}

impl TcpConnection {
    /// Connect to the described endpoint.
    pub async fn connect(description: ConnectionDescription) -> Result<ConnectionRef> {
        let addr = (description.hostname.as_str(), description.port);
        let stream = TcpStream::connect(addr).await.map_err(|e| map_connect_error(e, &description))?;
        stream.set_nodelay(true).ok();
        debug!("connected to {}", description);
        Ok(Self::from_stream(stream, description))
    }

    /// Wrap an accepted or connected stream.
    pub fn from_stream(stream: TcpStream, description: ConnectionDescription) -> ConnectionRef {
        let (reader, writer) = stream.into_split();
        Arc::new(TcpConnection {
            description,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            state: StateCell::new(ConnectionState::Connected),
        })
    }
}

fn map_connect_error(error: std::io::Error, description: &ConnectionDescription) -> NetError {
    match error.kind() {
        ErrorKind::ConnectionRefused => NetError::ConnectionRefused(description.to_string()),
        ErrorKind::AddrInUse => NetError::AddressInUse(description.to_string()),
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::TimedOut => {
            NetError::Unreachable(description.to_string())
        }
        _ => NetError::Io(error),
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn send(&self, buf: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(NetError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match writer.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                let err = NetError::Io(e);
                if err.is_connection_closed() {
                    Err(NetError::ConnectionClosed)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        match reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                let err = NetError::Io(e);
                if err.is_connection_closed() {
                    Err(NetError::ConnectionClosed)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn close(&self) {
        self.state.set(ConnectionState::Closed);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
    }
}

/// A bound TCP listener.
pub struct TcpListenerConnection {
    description: ConnectionDescription,
    listener: TcpListener,
    state: StateCell,
}

impl TcpListenerConnection {
    /// Bind the described address. Port 0 binds an ephemeral port; the
    /// returned listener's description carries the actual one.
    pub async fn bind(mut description: ConnectionDescription) -> Result<ListenerRef> {
        let addr = (description.hostname.as_str(), description.port);
        let listener = TcpListener::bind(addr).await.map_err(|e| map_connect_error(e, &description))?;
        description.port = listener.local_addr().map(|a| a.port()).unwrap_or(description.port);
        debug!("listening on {}", description);
        Ok(Arc::new(TcpListenerConnection {
            description,
            listener,
            state: StateCell::new(ConnectionState::Listening),
        }))
    }
}

#[async_trait]
impl Listener for TcpListenerConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    async fn accept(&self) -> Result<ConnectionRef> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        debug!("accepted connection from {peer}");
        let description = ConnectionDescription::tcp(peer.ip().to_string(), peer.port());
        Ok(TcpConnection::from_stream(stream, description))
    }

    async fn close(&self) {
        self.state.set(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_send_recv() {
        let listener = TcpListenerConnection::bind(ConnectionDescription::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let desc = listener.description().clone();
        assert_ne!(desc.port, 0);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = TcpConnection::connect(desc).await.unwrap();
        let server = accept.await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.send(b"pong").await.unwrap();
        client.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_recv_after_peer_close() {
        let listener = TcpListenerConnection::bind(ConnectionDescription::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let desc = listener.description().clone();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = TcpConnection::connect(desc).await.unwrap();
        let server = accept.await.unwrap();

        client.close().await;
        let mut buf = [0u8; 1];
        let err = server.recv_exact(&mut buf).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop to find a dead port.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = match TcpConnection::connect(ConnectionDescription::tcp("127.0.0.1", port)).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection to be refused"),
        };
        assert!(matches!(err, NetError::ConnectionRefused(_)));
    }
}
