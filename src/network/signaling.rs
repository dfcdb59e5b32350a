// Signaling client
// WebSocket link to the lobby server: register on open, stamp every
// outbound frame with clientId/lobbyCode, dispatch inbound frames by type

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::error::{ProtocolError, SessionError};
use super::protocol::{parse_inbound, InboundMessage, OutboundMessage};
use super::session::{ClientSession, SessionInput};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What came off the WebSocket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(InboundMessage),
    /// Frame was received but could not be used
    Invalid(ProtocolError),
    Closed,
    Failed(String),
}

impl From<SignalingEvent> for SessionInput {
    fn from(event: SignalingEvent) -> Self {
        match event {
            SignalingEvent::Message(message) => SessionInput::Signal(message),
            SignalingEvent::Invalid(error) => SessionInput::Protocol(error),
            SignalingEvent::Closed => SessionInput::SignalingClosed,
            SignalingEvent::Failed(reason) => SessionInput::SignalingFailed(reason),
        }
    }
}

pub struct SignalingClient {
    session: ClientSession,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    open: bool,
}

impl SignalingClient {
    /// Open the WebSocket and send `register-client`
    pub async fn connect(url: &str, session: ClientSession) -> Result<Self, SessionError> {
        info!("Connecting to signaling server: {}", url);
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::Signaling(format!("Unable to connect to {}: {}", url, e)))?;

        let (sink, stream) = ws.split();
        let mut client = Self {
            session,
            sink,
            stream,
            open: true,
        };

        client.send(&OutboundMessage::RegisterClient {}).await?;
        info!(
            "Registered {} for lobby {}",
            client.session.client_id, client.session.lobby_code
        );
        Ok(client)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send one frame; fails if the socket is not open
    pub async fn send(&mut self, message: &OutboundMessage) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::Signaling(format!(
                "Cannot send '{}', signaling connection is not open",
                message.kind()
            )));
        }

        let frame = message
            .encode(&self.session.client_id, &self.session.lobby_code)
            .map_err(|e| SessionError::Signaling(format!("Failed to encode {}: {}", message.kind(), e)))?;
        debug!("Signaling out: {}", message.kind());

        if let Err(e) = self.sink.send(Message::Text(frame)).await {
            self.open = false;
            return Err(SessionError::Signaling(e.to_string()));
        }
        Ok(())
    }

    /// Wait for the next meaningful frame. Control frames are skipped.
    /// After `Closed` or `Failed` the client stays closed.
    pub async fn next_event(&mut self) -> SignalingEvent {
        if !self.open {
            return SignalingEvent::Closed;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return match parse_inbound(&text) {
                        Ok(message) => SignalingEvent::Message(message),
                        Err(e) => {
                            warn!("Dropping signaling frame: {}", e);
                            SignalingEvent::Invalid(e)
                        }
                    };
                }
                Some(Ok(Message::Binary(_))) => {
                    return SignalingEvent::Invalid(ProtocolError::InvalidJson(
                        "binary frame".to_string(),
                    ));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Signaling server closed the connection: {:?}", frame);
                    self.open = false;
                    return SignalingEvent::Closed;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Signaling connection error: {}", e);
                    self.open = false;
                    return SignalingEvent::Failed(e.to_string());
                }
                None => {
                    self.open = false;
                    return SignalingEvent::Closed;
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.sink.send(Message::Close(None)).await;
            let _ = self.sink.close().await;
        }
    }
}
