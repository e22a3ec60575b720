use std::net::TcpStream;

use miette::Diagnostic;
use thiserror::Error;
use tungstenite::{
    Message, WebSocket, client::IntoClientRequest, http::HeaderValue, stream::MaybeTlsStream,
};

use super::{ChannelEvent, ChannelTransport, ReceiveError, SendError};

/// The WebSocket subprotocol the bridge firmware expects.
const SUBPROTOCOL: &str = "arduino";

/// Possible error values of [`WebSocketTransport::connect`].
#[derive(Error, Debug, Diagnostic)]
pub enum ConnectError {
    /// The WebSocket handshake with the device failed.
    #[error("failed to connect to the device")]
    #[diagnostic(code(lampctl::transport::connect::handshake))]
    Handshake(#[from] tungstenite::Error),
}

/// A blocking WebSocket connection to the device's message channel.
pub struct WebSocketTransport {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Connects to the device channel, e.g. `ws://192.168.4.1:81/`.
    pub fn connect(url: &str) -> Result<Self, ConnectError> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let (socket, response) = tungstenite::connect(request)?;
        log::debug!("channel open, handshake status {}", response.status());

        Ok(Self { socket })
    }
}

fn is_closed(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}

impl ChannelTransport for WebSocketTransport {
    fn send_text(&mut self, line: &str) -> Result<(), SendError> {
        self.socket
            .send(Message::text(line.to_string()))
            .map_err(|err| {
                if is_closed(&err) {
                    SendError::Closed
                } else {
                    SendError::Transport(Box::new(err))
                }
            })
    }

    fn poll_event(&mut self) -> Result<ChannelEvent, ReceiveError> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    return Ok(ChannelEvent::Message(text.as_bytes().to_vec()));
                }
                Ok(Message::Binary(data)) => return Ok(ChannelEvent::Message(data.to_vec())),
                Ok(Message::Close(_)) => return Ok(ChannelEvent::Closed),
                // Control and partial frames carry no channel payload.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(err) if is_closed(&err) => return Ok(ChannelEvent::Closed),
                Err(err) => return Err(ReceiveError::Transport(Box::new(err))),
            }
        }
    }
}
