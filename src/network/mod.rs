// Networking module for Steerlink
// Signaling over WebSocket, WebRTC data channel via str0m, and the
// control session state machine in between

pub mod candidates;
pub mod client;
pub mod controls;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::{NetworkClient, NetworkCommand, NetworkEvent};
pub use controls::{Control, SendPolicy};
pub use error::{ProtocolError, SessionError};
pub use protocol::{Direction, WireFormat};
pub use runtime::RuntimeOptions;
pub use session::{ClientSession, ConnectionState, ManagerOptions, Role};

use std::io;
use std::sync::mpsc;
use std::sync::{atomic::AtomicBool, Arc};

/// Initialize and start the network layer
/// Returns a NetworkClient handle for the front end to communicate with
pub fn start_network(session: ClientSession, options: RuntimeOptions) -> io::Result<NetworkClient> {
    // Create channels for bidirectional communication
    let (event_tx, event_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();

    // Shared "data channel open" flag
    let connected = Arc::new(AtomicBool::new(false));

    runtime::spawn_network_thread(session, options, event_tx, cmd_rx, connected.clone())?;

    Ok(NetworkClient::new(cmd_tx, event_rx, connected))
}
