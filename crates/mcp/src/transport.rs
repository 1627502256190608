//! Pluggable broker transports.
//!
//! A transport moves newline-delimited JSON frames. The stdio transport is
//! the production default; tests drive the broker through channel pairs.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};

/// Error raised by a transport; the connection is closed on any of these.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream failed.
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The peer went away.
    #[error("transport closed")]
    Closed,
}

/// A bidirectional frame transport.
#[async_trait]
pub trait McpTransport: Send {
    /// Receive the next frame; `None` on orderly end-of-stream.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send one frame.
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;
}

/// Newline-delimited JSON over stdin/stdout.
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: Stdout,
}

impl StdioTransport {
    /// Attach to this process's stdio.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_owned()))
    }

    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// In-process transport over channels, for tests and embedding.
pub struct ChannelTransport {
    incoming: tokio::sync::mpsc::UnboundedReceiver<String>,
    outgoing: tokio::sync::mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Build a transport plus the client-side handles: a sender feeding the
    /// broker and a receiver of its responses.
    #[must_use]
    pub fn pair() -> (
        Self,
        tokio::sync::mpsc::UnboundedSender<String>,
        tokio::sync::mpsc::UnboundedReceiver<String>,
    ) {
        let (client_tx, incoming) = tokio::sync::mpsc::unbounded_channel();
        let (outgoing, client_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self { incoming, outgoing },
            client_tx,
            client_rx,
        )
    }
}

#[async_trait]
impl McpTransport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.outgoing
            .send(frame.to_owned())
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_transport_roundtrip() {
        let (mut transport, to_broker, mut from_broker) = ChannelTransport::pair();

        to_broker.send("ping".into()).unwrap();
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("ping"));

        transport.send("pong").await.unwrap();
        assert_eq!(from_broker.recv().await.as_deref(), Some("pong"));

        drop(to_broker);
        assert!(transport.recv().await.unwrap().is_none());
    }
}
