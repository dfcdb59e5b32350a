// Network runtime - runs one control session in a background thread
// A single task owns the manager and multiplexes signaling frames, UDP
// datagrams, str0m deadlines, UI commands and the retransmit timer, so
// every state change is applied one input at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::client::{NetworkCommand, NetworkEvent};
use super::controls::SendPolicy;
use super::error::SessionError;
use super::session::{
    ClientSession, ConnectionState, Effect, ManagerOptions, PeerConnectionManager, Role,
    SessionInput,
};
use super::signaling::{SignalingClient, SignalingEvent};
use super::transport::Str0mTransport;
use crate::config::ChannelSettings;

/// Everything the runtime needs besides the session identity
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub signaling_server: String,
    pub stun_server: String,
    pub role: Role,
    pub channel: ChannelSettings,
    pub manager: ManagerOptions,
}

/// Delivers events to the front end and mirrors the connected flag
struct EventSink {
    tx: mpsc::Sender<NetworkEvent>,
    connected: Arc<AtomicBool>,
}

impl EventSink {
    fn emit(&self, event: NetworkEvent) {
        if let NetworkEvent::ConnectionStateChanged(state) = &event {
            self.connected
                .store(*state == ConnectionState::Connected, Ordering::Relaxed);
        }
        // Front end may already be gone
        let _ = self.tx.send(event);
    }
}

/// Initialize and run the network in a background thread
pub fn spawn_network_thread(
    session: ClientSession,
    options: RuntimeOptions,
    event_tx: mpsc::Sender<NetworkEvent>,
    cmd_rx: UnboundedReceiver<NetworkCommand>,
    connected: Arc<AtomicBool>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("steerlink-network".to_string())
        .spawn(move || {
            let sink = EventSink { tx: event_tx, connected };

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime: {}", e);
                    sink.emit(NetworkEvent::Error(SessionError::Peer(e.to_string())));
                    sink.emit(NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                    return;
                }
            };

            rt.block_on(async move {
                if let Err(e) = run_network(session, options, sink, cmd_rx).await {
                    error!("Network error: {}", e);
                }
            });
            info!("Network thread ending");
        })?;

    Ok(())
}

/// Main network event loop
async fn run_network(
    session: ClientSession,
    options: RuntimeOptions,
    sink: EventSink,
    mut cmd_rx: UnboundedReceiver<NetworkCommand>,
) -> Result<()> {
    sink.emit(NetworkEvent::SessionReady {
        client_id: session.client_id.clone(),
        lobby_code: session.lobby_code.clone(),
    });

    let transport = match Str0mTransport::gather(&options.stun_server, options.channel.clone()).await {
        Ok(transport) => transport,
        Err(e) => {
            let error = SessionError::Peer(format!("Failed to set up peer connection: {}", e));
            sink.emit(NetworkEvent::ConnectionStateChanged(ConnectionState::Connecting));
            sink.emit(NetworkEvent::Error(error));
            sink.emit(NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            return Err(e);
        }
    };
    let socket = transport.socket();

    let mut driver = Driver {
        manager: PeerConnectionManager::new(session.clone(), options.role, transport, options.manager),
        signaling: None,
        retransmit: None,
        sink,
    };

    let effects = driver.manager.start();
    driver.dispatch(effects).await;

    match SignalingClient::connect(&options.signaling_server, session).await {
        Ok(client) => {
            driver.signaling = Some(client);
            driver.handle(SessionInput::Registered).await;
        }
        Err(e) => {
            let reason = match e {
                SessionError::Signaling(reason) => reason,
                other => other.to_string(),
            };
            driver.handle(SessionInput::SignalingFailed(reason)).await;
        }
    }

    let mut buf = vec![0u8; 8192];

    loop {
        let deadline = driver.poll_transport().await;
        if driver.manager.is_terminal() {
            info!("Session ended, leaving network loop");
            break;
        }

        tokio::select! {
            event = next_signal(&mut driver.signaling) => {
                driver.handle(event.into()).await;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    if let Err(e) = driver.manager.transport_mut().handle_receive(source, &buf[..n]) {
                        warn!("Dropping datagram: {}", e);
                    }
                }
                Err(e) => warn!("UDP receive failed: {}", e),
            },
            _ = sleep_until(Instant::from_std(deadline)) => {
                if let Err(e) = driver.manager.transport_mut().handle_timeout() {
                    warn!("str0m timeout handling failed: {}", e);
                }
            }
            _ = next_tick(&mut driver.retransmit) => {
                driver.handle(SessionInput::RetransmitTick).await;
            }
            command = cmd_rx.recv() => match command.and_then(command_input) {
                Some(input) => driver.handle(input).await,
                None => {
                    info!("Disconnect requested");
                    break;
                }
            },
        }
    }

    driver.shutdown().await;
    Ok(())
}

/// Owns the manager and performs its effects
struct Driver {
    manager: PeerConnectionManager<Str0mTransport>,
    signaling: Option<SignalingClient>,
    retransmit: Option<Interval>,
    sink: EventSink,
}

impl Driver {
    async fn handle(&mut self, input: SessionInput) {
        let effects = self.manager.handle(input);
        self.dispatch(effects).await;
    }

    /// Perform effects in order; failures feed back into the manager
    async fn dispatch(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Notify(event) => self.sink.emit(event),
                Effect::Retransmit(true) => {
                    if let SendPolicy::Retransmit { interval_ms } = self.manager.policy() {
                        let period = Duration::from_millis(interval_ms);
                        let mut timer = interval_at(Instant::now() + period, period);
                        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        self.retransmit = Some(timer);
                        debug!("Retransmit timer started ({} ms)", interval_ms);
                    }
                }
                Effect::Retransmit(false) => {
                    if self.retransmit.take().is_some() {
                        debug!("Retransmit timer stopped");
                    }
                }
                Effect::Signal(message) => {
                    let result = match self.signaling.as_mut() {
                        Some(client) => client.send(&message).await,
                        None => Err(SessionError::Signaling(
                            "Signaling connection is not open".to_string(),
                        )),
                    };
                    if let Err(e) = result {
                        warn!("Failed to send '{}': {}", message.kind(), e);
                        let reason = match e {
                            SessionError::Signaling(reason) => reason,
                            other => other.to_string(),
                        };
                        queue.extend(self.manager.handle(SessionInput::SignalingFailed(reason)));
                    }
                }
            }
        }
    }

    /// Drain str0m until it only wants to wait; returns its next deadline
    async fn poll_transport(&mut self) -> std::time::Instant {
        loop {
            let mut events = Vec::new();
            let deadline = self.manager.transport_mut().poll(&mut events);
            if events.is_empty() || self.manager.is_terminal() {
                return deadline;
            }
            for event in events {
                self.handle(SessionInput::Transport(event)).await;
            }
        }
    }

    /// Stop the timer, close the peer connection and the WebSocket.
    /// Nothing is emitted from here on.
    async fn shutdown(&mut self) {
        let _ = self.manager.teardown();
        self.retransmit = None;
        if let Some(mut client) = self.signaling.take() {
            client.close().await;
        }
    }
}

/// None means the session should end
fn command_input(command: NetworkCommand) -> Option<SessionInput> {
    match command {
        NetworkCommand::Press(control) => Some(SessionInput::Press(control)),
        NetworkCommand::Release(control) => Some(SessionInput::Release(control)),
        NetworkCommand::SendDirection(direction) => Some(SessionInput::SendDirection(direction)),
        NetworkCommand::SendMessage(text) => Some(SessionInput::SendMessage(text)),
        NetworkCommand::Disconnect => None,
    }
}

async fn next_signal(signaling: &mut Option<SignalingClient>) -> SignalingEvent {
    match signaling {
        Some(client) if client.is_open() => client.next_event().await,
        _ => std::future::pending().await,
    }
}

async fn next_tick(retransmit: &mut Option<Interval>) {
    match retransmit {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::controls::Control;
    use crate::network::protocol::Direction;

    #[test]
    fn test_command_mapping() {
        assert_eq!(
            command_input(NetworkCommand::Press(Control::Left)),
            Some(SessionInput::Press(Control::Left))
        );
        assert_eq!(
            command_input(NetworkCommand::Release(Control::Right)),
            Some(SessionInput::Release(Control::Right))
        );
        assert_eq!(
            command_input(NetworkCommand::SendDirection(Direction::Forward)),
            Some(SessionInput::SendDirection(Direction::Forward))
        );
        assert_eq!(command_input(NetworkCommand::Disconnect), None);
    }

    #[test]
    fn test_sink_tracks_connected_flag() {
        let (tx, rx) = mpsc::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let sink = EventSink { tx, connected: connected.clone() };

        sink.emit(NetworkEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert!(connected.load(Ordering::Relaxed));
        sink.emit(NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        assert!(!connected.load(Ordering::Relaxed));
        assert_eq!(rx.try_iter().count(), 2);
    }

    fn driver(role: Role, options: ManagerOptions) -> (Driver, mpsc::Receiver<NetworkEvent>) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let transport = Str0mTransport::from_socket(socket, None, ChannelSettings::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let driver = Driver {
            manager: PeerConnectionManager::new(
                ClientSession::new("0123456789abc", "ABCD"),
                role,
                transport,
                options,
            ),
            signaling: None,
            retransmit: None,
            sink: EventSink {
                tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
        };
        (driver, rx)
    }

    #[tokio::test]
    async fn test_failed_signal_send_disconnects() {
        let (mut driver, rx) = driver(Role::Offerer, ManagerOptions::default());
        let effects = driver.manager.start();
        driver.dispatch(effects).await;

        // The offer goes out with no WebSocket to carry it
        driver.handle(SessionInput::Registered).await;

        assert!(driver.manager.is_terminal());
        assert_eq!(driver.manager.connection_state(), ConnectionState::Disconnected);

        let events: Vec<NetworkEvent> = rx.try_iter().collect();
        assert_eq!(
            events.first(),
            Some(&NetworkEvent::ConnectionStateChanged(ConnectionState::Connecting))
        );
        assert!(events
            .iter()
            .any(|event| matches!(event, NetworkEvent::Error(SessionError::Signaling(_)))));
        assert_eq!(
            events.last(),
            Some(&NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_retransmit_effects_drive_timer() {
        let options = ManagerOptions {
            policy: SendPolicy::Retransmit { interval_ms: 50 },
            ..ManagerOptions::default()
        };
        let (mut driver, _rx) = driver(Role::Answerer, options);

        driver.dispatch(vec![Effect::Retransmit(true)]).await;
        assert!(driver.retransmit.is_some());

        driver.dispatch(vec![Effect::Retransmit(false)]).await;
        assert!(driver.retransmit.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_silent() {
        let (mut driver, rx) = driver(Role::Answerer, ManagerOptions::default());
        let effects = driver.manager.start();
        driver.dispatch(effects).await;
        let before = rx.try_iter().count();
        assert_eq!(before, 1);

        driver.shutdown().await;
        assert!(driver.manager.is_terminal());
        assert_eq!(rx.try_iter().count(), 0);
    }
}
