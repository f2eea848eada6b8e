//! Relay transport
//!
//! One TCP connection to the rendering consumer carrying newline-delimited
//! JSON. Nothing is queued across a reconnect: a failed write drops the
//! connection and whatever was in flight.

use std::time::Duration;

use skymark_common::OutgoingMessage;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Bound on a single connect attempt and a single write
pub const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outbound consumer connection
pub struct RelayTransport {
    address: String,
    retry_delay: Duration,
    stream: Option<TcpStream>,
    state: TransportState,
}

impl RelayTransport {
    pub fn new(address: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            address: address.into(),
            retry_delay,
            stream: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    /// Connect, retrying on the fixed delay until it works
    ///
    /// Returns false only when cancelled first.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> bool {
        self.disconnect();
        self.state = TransportState::Connecting;

        loop {
            if cancel.is_cancelled() {
                self.state = TransportState::Disconnected;
                return false;
            }

            let attempt =
                tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(self.address.as_str())).await;
            match attempt {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle on consumer socket: {}", e);
                    }
                    self.stream = Some(stream);
                    self.state = TransportState::Connected;
                    debug!("Consumer socket open at {}", self.address);
                    return true;
                }
                Ok(Err(e)) => warn!(
                    "Consumer not available at {}: {}. Retrying in {:?}...",
                    self.address, e, self.retry_delay
                ),
                Err(_) => warn!(
                    "Connecting to consumer at {} timed out. Retrying in {:?}...",
                    self.address, self.retry_delay
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state = TransportState::Disconnected;
                    return false;
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Write one message as one line
    ///
    /// Any write failure (including a stalled consumer) drops the connection.
    pub async fn send(&mut self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let line = message.to_line()?;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let write = tokio::time::timeout(IO_TIMEOUT, stream.write_all(line.as_bytes()));
        let written = match write.await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(_) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "consumer write timed out",
            ))),
        };

        if let Err(e) = written {
            warn!("Write to consumer failed: {}", e);
            self.disconnect();
            return Err(e);
        }
        Ok(())
    }

    /// Send, swallowing any failure
    ///
    /// A failed write still marks the transport down.
    pub async fn send_best_effort(&mut self, message: &OutgoingMessage) -> bool {
        match self.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Best-effort {} message dropped: {}", message.kind(), e);
                false
            }
        }
    }

    /// Drop the connection, if any
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Disconnected from consumer at {}", self.address);
        }
        self.state = TransportState::Disconnected;
    }
}
