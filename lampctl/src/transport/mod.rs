use miette::Diagnostic;
use thiserror::Error;

mod websocket;
pub use websocket::{ConnectError, WebSocketTransport};

/// An event delivered by the message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An inbound message payload.
    ///
    /// Delivered as raw bytes; the device logs through the same channel and
    /// may emit non-printable characters, which is why the original protocol
    /// forces binary frames.
    Message(Vec<u8>),
    /// The connection was closed by the peer.
    Closed,
}

/// Errors that can happen while sending on the channel.
#[derive(Error, Debug, Diagnostic)]
pub enum SendError {
    /// The connection is no longer open.
    #[error("the connection is closed")]
    #[diagnostic(code(lampctl::transport::send::closed))]
    Closed,
    /// The underlying transport failed.
    #[error("transport error")]
    #[diagnostic(code(lampctl::transport::send::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors that can happen while waiting for a channel event.
#[derive(Error, Debug, Diagnostic)]
pub enum ReceiveError {
    /// The underlying transport failed.
    #[error("transport error")]
    #[diagnostic(code(lampctl::transport::recv::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The persistent, message-oriented connection to the device.
///
/// Implementations deliver inbound messages in the order the connection
/// carries them (FIFO), and report connection loss as
/// [`ChannelEvent::Closed`] or a [`ReceiveError`]. There is no
/// transport-level retry or reconnect; a lost connection stays lost until
/// the caller opens a new one.
pub trait ChannelTransport {
    /// Sends a single command line to the device.
    fn send_text(&mut self, line: &str) -> Result<(), SendError>;

    /// Blocks until the next channel event arrives.
    fn poll_event(&mut self) -> Result<ChannelEvent, ReceiveError>;
}
