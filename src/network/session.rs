// Peer connection manager
// Drives one peer connection from registration to an open data channel.
// All state changes go through `handle`, one input at a time, and come
// back out as effects for the runtime to perform.

use rand::Rng;
use tracing::{debug, info, warn};

use super::candidates::{normalize_candidate, IceCandidateQueue};
use super::client::NetworkEvent;
use super::controls::{Control, DirectionReducer, InputGate, SendPolicy};
use super::error::{ProtocolError, SessionError, TransportError};
use super::protocol::{
    decode_direction, encode_direction, Direction, IceCandidateInit, InboundMessage,
    LobbyCommand, OutboundMessage, SessionDescription, WireFormat,
};
use super::transport::{PeerTransport, TransportEvent};

/// Generate a random client id: 13 lowercase hex characters
pub fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..13)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Identity of this client on the signaling server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub client_id: String,
    pub lobby_code: String,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, lobby_code: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            lobby_code: lobby_code.into(),
        }
    }

    /// Build a session from a navigation path such as `/ABCD` (or a bare code)
    pub fn from_path(path: &str) -> Option<Self> {
        let code = path.strip_prefix('/').unwrap_or(path).trim();
        if code.is_empty() {
            return None;
        }
        Some(Self::new(generate_client_id(), code))
    }
}

/// Connection state as observed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// Only forward transitions are legal; leaving Disconnected needs a new session
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }
}

/// Which side of the negotiation this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waits for an offer and answers it (receives the data channel)
    Answerer,
    /// Creates the data channel and sends the offer
    Offerer,
}

/// Negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Registering,
    AwaitingOffer,
    AwaitingAnswer,
    Negotiated,
    Connected,
    Disconnected,
}

/// Everything the manager reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// WebSocket opened and `register-client` was sent
    Registered,
    SignalingFailed(String),
    SignalingClosed,
    Signal(InboundMessage),
    Protocol(ProtocolError),
    Transport(TransportEvent),
    Press(Control),
    Release(Control),
    SendDirection(Direction),
    SendMessage(String),
    RetransmitTick,
}

/// Work for the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a frame to the signaling server
    Signal(OutboundMessage),
    /// Tell the UI layer
    Notify(NetworkEvent),
    /// Start (true) or cancel (false) the retransmit timer
    Retransmit(bool),
}

/// Send behavior for the control channel
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub policy: SendPolicy,
    pub wire_format: WireFormat,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            policy: SendPolicy::OnChange,
            wire_format: WireFormat::Plain,
        }
    }
}

pub struct PeerConnectionManager<T: PeerTransport> {
    session: ClientSession,
    role: Role,
    transport: T,
    options: ManagerOptions,
    phase: Phase,
    connection: ConnectionState,
    candidates: IceCandidateQueue,
    gate: InputGate,
    reducer: DirectionReducer,
    retransmitting: bool,
    torn_down: bool,
    effects: Vec<Effect>,
}

impl<T: PeerTransport> PeerConnectionManager<T> {
    pub fn new(session: ClientSession, role: Role, transport: T, options: ManagerOptions) -> Self {
        Self {
            session,
            role,
            transport,
            options,
            phase: Phase::Idle,
            connection: ConnectionState::Connecting,
            candidates: IceCandidateQueue::new(),
            gate: InputGate::default(),
            reducer: DirectionReducer::new(),
            retransmitting: false,
            torn_down: false,
            effects: Vec::new(),
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_accepting_input(&self) -> bool {
        self.gate.is_open()
    }

    pub fn current_direction(&self) -> Direction {
        self.reducer.current()
    }

    pub fn policy(&self) -> SendPolicy {
        self.options.policy
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Disconnected or torn down; nothing further will happen
    pub fn is_terminal(&self) -> bool {
        self.torn_down || self.phase == Phase::Disconnected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Idle -> Registering. The caller opens the WebSocket next.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            info!(
                "Session {} joining lobby {}",
                self.session.client_id, self.session.lobby_code
            );
            self.phase = Phase::Registering;
            self.notify(NetworkEvent::ConnectionStateChanged(ConnectionState::Connecting));
        }
        self.take_effects()
    }

    /// Process one input to completion
    pub fn handle(&mut self, input: SessionInput) -> Vec<Effect> {
        if self.is_terminal() {
            debug!("Ignoring {:?} after session end", input);
            return Vec::new();
        }

        match input {
            SessionInput::Registered => self.on_registered(),
            SessionInput::SignalingFailed(reason) => self.fail(SessionError::Signaling(reason)),
            SessionInput::SignalingClosed => {
                if self.phase == Phase::Connected {
                    warn!("Signaling connection closed; data channel stays up");
                } else {
                    self.fail(SessionError::Signaling(
                        "Signaling server closed the connection".to_string(),
                    ));
                }
            }
            SessionInput::Signal(message) => self.on_signal(message),
            SessionInput::Protocol(error) => self.surface(error.into()),
            SessionInput::Transport(event) => self.on_transport(event),
            SessionInput::Press(control) => self.on_edge(control, true),
            SessionInput::Release(control) => self.on_edge(control, false),
            SessionInput::SendDirection(direction) => {
                if let Err(e) = self.send_direction(direction) {
                    self.surface(e);
                }
            }
            SessionInput::SendMessage(text) => {
                if let Err(e) = self.send_message(&text) {
                    self.surface(e);
                }
            }
            SessionInput::RetransmitTick => {
                if self.gate.is_open() && matches!(self.options.policy, SendPolicy::Retransmit { .. }) {
                    let direction = self.reducer.current();
                    if let Err(e) = self.send_direction(direction) {
                        self.surface(e);
                    }
                }
            }
        }

        self.take_effects()
    }

    /// Transmit a direction iff the data channel is open; never buffered
    pub fn send_direction(&mut self, direction: Direction) -> Result<(), SessionError> {
        let payload = encode_direction(direction, self.options.wire_format);
        self.send_message(&payload)?;
        debug!("Sent direction {}", direction);
        Ok(())
    }

    /// Transmit raw text iff the data channel is open; never buffered
    pub fn send_message(&mut self, text: &str) -> Result<(), SessionError> {
        if !self.transport.is_channel_open() {
            warn!("Data channel is not open, dropping '{}'", text);
            return Err(SessionError::ChannelNotOpen);
        }
        self.transport.send_text(text).map_err(|e| {
            warn!("Data channel write failed: {}", e);
            SessionError::ChannelNotOpen
        })
    }

    /// Close everything; no notifications are produced from here on
    pub fn teardown(&mut self) -> Vec<Effect> {
        if self.torn_down {
            return Vec::new();
        }
        info!("Tearing down session {}", self.session.client_id);
        self.torn_down = true;
        self.effects.clear();
        self.candidates.clear();
        self.gate = InputGate::default();
        self.transport.close();

        let mut effects = Vec::new();
        if self.retransmitting {
            self.retransmitting = false;
            effects.push(Effect::Retransmit(false));
        }
        effects
    }

    fn on_registered(&mut self) {
        if self.phase != Phase::Registering {
            warn!("Registered in unexpected phase {:?}", self.phase);
            return;
        }

        match self.role {
            Role::Answerer => {
                info!("Registered, waiting for offer");
                self.phase = Phase::AwaitingOffer;
            }
            Role::Offerer => match self.transport.create_offer() {
                Ok(offer) => {
                    info!("Registered, sending offer");
                    self.signal(OutboundMessage::Offer { offer });
                    self.trickle_local_candidates();
                    self.phase = Phase::AwaitingAnswer;
                }
                Err(e) => self.fail(SessionError::Peer(format!("Failed to create offer: {}", e))),
            },
        }
    }

    fn on_signal(&mut self, message: InboundMessage) {
        debug!("Signal received: {}", message.kind());
        match message {
            InboundMessage::IceCandidate { candidate } => self.on_remote_candidate(candidate),
            InboundMessage::Offer { offer } => self.on_offer(offer),
            InboundMessage::Answer { answer } => self.on_answer(answer),
            InboundMessage::Message { message } => match message.command() {
                Ok(LobbyCommand::Start) => self.set_lobby_started(true),
                Ok(LobbyCommand::Stop) => self.set_lobby_started(false),
                Ok(LobbyCommand::ReportError(text)) => {
                    self.notify(NetworkEvent::Error(SessionError::Server(text)))
                }
                Ok(LobbyCommand::ReportSuccess(text)) => self.notify(NetworkEvent::Success(text)),
                Err(e) => self.surface(e.into()),
            },
            InboundMessage::ColorChange { color } => {
                self.notify(NetworkEvent::PlayerColor(color));
            }
            InboundMessage::Error { message } => self.fail(SessionError::Server(message)),
        }
    }

    /// Apply now if a remote description exists, otherwise queue
    fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        let candidate = normalize_candidate(candidate);
        if self.transport.has_remote_description() {
            self.apply_candidate(&candidate);
        } else {
            debug!("Queueing ICE candidate until remote description is set");
            self.candidates.push(candidate);
        }
    }

    fn apply_candidate(&mut self, candidate: &IceCandidateInit) {
        match self.transport.add_remote_candidate(candidate) {
            Ok(()) => debug!("Applied remote candidate {}", candidate.candidate),
            Err(e) => self.surface(protocol_error(e).into()),
        }
    }

    fn drain_candidates(&mut self) {
        let queued = self.candidates.drain();
        if !queued.is_empty() {
            debug!("Replaying {} queued ICE candidates", queued.len());
        }
        for candidate in &queued {
            self.apply_candidate(candidate);
        }
    }

    fn on_offer(&mut self, offer: SessionDescription) {
        if self.role == Role::Offerer {
            self.surface(ProtocolError::Unexpected("offer".to_string()).into());
            return;
        }

        match self.transport.accept_offer(&offer) {
            Ok(answer) => {
                info!("Offer accepted, sending answer");
                self.signal(OutboundMessage::Answer { answer });
                self.trickle_local_candidates();
                self.drain_candidates();
                if self.phase != Phase::Connected {
                    self.phase = Phase::Negotiated;
                }
            }
            Err(e) => self.surface(protocol_error(e).into()),
        }
    }

    fn on_answer(&mut self, answer: SessionDescription) {
        if self.role == Role::Answerer || self.phase != Phase::AwaitingAnswer {
            self.surface(ProtocolError::Unexpected("answer".to_string()).into());
            return;
        }

        match self.transport.accept_answer(&answer) {
            Ok(()) => {
                info!("Answer accepted");
                self.drain_candidates();
                self.phase = Phase::Negotiated;
            }
            Err(e) => self.surface(protocol_error(e).into()),
        }
    }

    fn trickle_local_candidates(&mut self) {
        for candidate in self.transport.take_local_candidates() {
            debug!("Sending local candidate {}", candidate.candidate);
            self.signal(OutboundMessage::IceCandidateClient { candidate });
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelOpen => {
                info!("Data channel open");
                self.phase = Phase::Connected;
                self.transition(ConnectionState::Connected);
                self.notify(NetworkEvent::Success("Connected!".to_string()));
                self.update_gate(|gate| gate.channel_open = true);
            }
            TransportEvent::ChannelClosed => {
                self.fail(SessionError::Peer("Connection closed".to_string()))
            }
            TransportEvent::ChannelData(text) => match decode_direction(&text) {
                Ok(direction) => self.notify(NetworkEvent::ReceivedDirection(direction)),
                Err(e) => self.surface(e.into()),
            },
            TransportEvent::Failed(reason) => self.fail(SessionError::Peer(reason)),
        }
    }

    fn on_edge(&mut self, control: Control, pressed: bool) {
        if !self.gate.is_open() {
            debug!("Input not accepted, ignoring {:?} edge", control);
            return;
        }
        if let Some(direction) = self.reducer.set(control, pressed) {
            if let Err(e) = self.send_direction(direction) {
                self.surface(e);
            }
        }
    }

    fn set_lobby_started(&mut self, started: bool) {
        info!("Lobby {}", if started { "started" } else { "stopped" });
        self.update_gate(|gate| gate.lobby_started = started);
    }

    /// Apply a gate change and react to forwarding turning on or off
    fn update_gate(&mut self, change: impl FnOnce(&mut InputGate)) {
        let was_open = self.gate.is_open();
        change(&mut self.gate);
        let is_open = self.gate.is_open();

        if is_open == was_open {
            return;
        }

        self.notify(NetworkEvent::AcceptingInputChanged(is_open));
        if is_open {
            let direction = self.reducer.current();
            if let Err(e) = self.send_direction(direction) {
                self.surface(e);
            }
            if matches!(self.options.policy, SendPolicy::Retransmit { .. }) && !self.retransmitting {
                self.retransmitting = true;
                self.effects.push(Effect::Retransmit(true));
            }
        } else {
            self.reducer.reset();
            self.stop_retransmit();
        }
    }

    fn stop_retransmit(&mut self) {
        if self.retransmitting {
            self.retransmitting = false;
            self.effects.push(Effect::Retransmit(false));
        }
    }

    /// Report an error; terminal ones end the session
    fn surface(&mut self, error: SessionError) {
        if error.is_terminal() {
            self.fail(error);
        } else {
            warn!("{}", error);
            self.notify(NetworkEvent::Error(error));
        }
    }

    fn fail(&mut self, error: SessionError) {
        if self.phase == Phase::Disconnected {
            return;
        }
        warn!("Session failed: {}", error);
        self.notify(NetworkEvent::Error(error));
        self.phase = Phase::Disconnected;
        self.transition(ConnectionState::Disconnected);
        self.update_gate(|gate| *gate = InputGate::default());
        self.stop_retransmit();
        self.candidates.clear();
        self.transport.close();
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.connection.can_transition_to(next) {
            self.connection = next;
            self.notify(NetworkEvent::ConnectionStateChanged(next));
        } else if self.connection != next {
            warn!("Illegal connection transition {:?} -> {:?}", self.connection, next);
        }
    }

    fn signal(&mut self, message: OutboundMessage) {
        self.effects.push(Effect::Signal(message));
    }

    fn notify(&mut self, event: NetworkEvent) {
        self.effects.push(Effect::Notify(event));
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

fn protocol_error(error: TransportError) -> ProtocolError {
    match error {
        TransportError::Candidate(reason) => ProtocolError::Candidate(reason),
        other => ProtocolError::Sdp(other.to_string()),
    }
}
