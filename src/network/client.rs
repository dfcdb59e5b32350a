// Network client interface for the front end
// Provides channels to communicate with the network thread

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use tokio::sync::mpsc::UnboundedSender;

use super::controls::Control;
use super::error::SessionError;
use super::protocol::Direction;
use super::session::ConnectionState;

/// Handle for the front end to communicate with the network.
/// Dropping it tears the session down.
pub struct NetworkClient {
    /// Send commands TO the network thread
    tx: UnboundedSender<NetworkCommand>,

    /// Receive events FROM the network thread
    rx: mpsc::Receiver<NetworkEvent>,

    /// Data channel open
    connected: Arc<AtomicBool>,
}

/// Commands the front end sends to the network thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Steering button went down
    Press(Control),

    /// Steering button went up
    Release(Control),

    /// Send a direction now. Only the data channel must be open; the
    /// lobby start/stop gate governs key edges, not this command.
    SendDirection(Direction),

    /// Send raw text over the data channel
    SendMessage(String),

    /// Close the peer connection and the WebSocket
    Disconnect,
}

/// Events the network thread sends to the front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Identity assigned for this session
    SessionReady { client_id: String, lobby_code: String },

    ConnectionStateChanged(ConnectionState),

    /// Steering input is (or stops being) forwarded to the peer
    AcceptingInputChanged(bool),

    /// Color assigned by the lobby, passed through verbatim
    PlayerColor(String),

    Success(String),

    Error(SessionError),

    /// Direction sent by the remote controller
    ReceivedDirection(Direction),
}

impl NetworkClient {
    /// Create a new network client (called by start_network)
    pub fn new(
        tx: UnboundedSender<NetworkCommand>,
        rx: mpsc::Receiver<NetworkEvent>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self { tx, rx, connected }
    }

    /// Check if the data channel is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn press(&self, control: Control) -> io::Result<()> {
        self.send(NetworkCommand::Press(control))
    }

    pub fn release(&self, control: Control) -> io::Result<()> {
        self.send(NetworkCommand::Release(control))
    }

    pub fn send_direction(&self, direction: Direction) -> io::Result<()> {
        self.send(NetworkCommand::SendDirection(direction))
    }

    pub fn send_message(&self, text: impl Into<String>) -> io::Result<()> {
        self.send(NetworkCommand::SendMessage(text.into()))
    }

    /// Try to receive network events (non-blocking)
    /// Returns None if no events available
    pub fn try_recv_event(&self) -> Option<NetworkEvent> {
        self.rx.try_recv().ok()
    }

    /// Gracefully disconnect
    pub fn disconnect(&self) -> io::Result<()> {
        self.send(NetworkCommand::Disconnect)
    }

    fn send(&self, command: NetworkCommand) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        // Runtime may already be gone
        let _ = self.tx.send(NetworkCommand::Disconnect);
    }
}
