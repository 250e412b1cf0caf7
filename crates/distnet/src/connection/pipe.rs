//! In-process pipe transport.
//!
//! Used for a node's connection to itself (self-addressed commands reach the
//! receiver through the same path as remote ones) and in tests.

use super::{Connection, ConnectionDescription, ConnectionRef, ConnectionState, StateCell};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

const PIPE_BUFFER: usize = 256 * 1024;

/// One end of an in-process bidirectional pipe.
pub struct PipeConnection {
    description: ConnectionDescription,
    reader: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    writer: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
    state: StateCell,
}

impl PipeConnection {
    /// Create a connected pair of pipe ends.
    pub fn pair() -> (ConnectionRef, ConnectionRef) {
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        (Self::from_stream(a), Self::from_stream(b))
    }

    fn from_stream(stream: DuplexStream) -> ConnectionRef {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(PipeConnection {
            description: ConnectionDescription::pipe(),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            state: StateCell::new(ConnectionState::Connected),
        })
    }
}

#[async_trait]
impl Connection for PipeConnection {
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
        writer.write_all(buf).await.map_err(|_| {
            self.state.set(ConnectionState::Closed);
            NetError::ConnectionClosed
        })
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await.map(|_| ()).map_err(|_| {
            self.state.set(ConnectionState::Closed);
            NetError::ConnectionClosed
        })
    }

    async fn close(&self) {
        self.state.set(ConnectionState::Closed);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
    }
}
