// Peer connection transport
// `PeerTransport` is the seam the session state machine drives; `Str0mTransport`
// implements it with str0m's Sans-I/O WebRTC over a single UDP socket

use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelConfig, ChannelId, Reliability};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};

use super::error::TransportError;
use super::protocol::{IceCandidateInit, SessionDescription};
use crate::config::ChannelSettings;

/// Operations the session needs from a peer connection
pub trait PeerTransport {
    /// Whether a remote description (offer or answer) has been applied
    fn has_remote_description(&self) -> bool;

    /// Set the remote offer, then create and set the local answer
    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Create the data channel and a local offer for it
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Apply the remote answer to our pending offer
    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError>;

    /// Local candidates gathered since the last call (empty until a local description exists)
    fn take_local_candidates(&mut self) -> Vec<IceCandidateInit>;

    /// Data channel ready state is "open"
    fn is_channel_open(&self) -> bool;

    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the data channel and the peer connection
    fn close(&mut self);
}

/// Peer connection events surfaced to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ChannelOpen,
    ChannelClosed,
    ChannelData(String),
    /// Connection reached a failed/terminal state
    Failed(String),
}

/// str0m-backed peer connection
pub struct Str0mTransport {
    rtc: Rtc,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    channel: ChannelSettings,
    channel_id: Option<ChannelId>,
    channel_open: bool,
    pending_offer: Option<SdpPendingOffer>,
    has_remote: bool,
    has_local: bool,
    untrickled: Vec<Candidate>,
    failed: bool,
}

impl Str0mTransport {
    /// Bind the ICE socket and gather host + server reflexive candidates
    pub async fn gather(stun_server: &str, channel: ChannelSettings) -> Result<Self> {
        let local_ip = discover_local_ip().unwrap_or_else(|e| {
            warn!("Local IP discovery failed ({}), using loopback", e);
            IpAddr::from([127, 0, 0, 1])
        });

        // Bind to the specific interface so local_addr() matches the host candidate
        let std_socket = StdUdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        info!("Bound ICE socket: {}", std_socket.local_addr()?);

        let public_addr = match query_stun_server(&std_socket, stun_server).await {
            Ok(public_addr) => {
                info!("Public address from STUN: {}", public_addr);
                Some(public_addr)
            }
            // Host candidate alone still works on the same network
            Err(e) => {
                warn!("STUN query failed, using host candidate only: {}", e);
                None
            }
        };

        Self::from_socket(std_socket, public_addr, channel)
    }

    /// Wrap an already bound socket: host candidate, plus a server reflexive
    /// one when the public address is known. Needs a tokio runtime.
    pub fn from_socket(
        std_socket: StdUdpSocket,
        public_addr: Option<SocketAddr>,
        channel: ChannelSettings,
    ) -> Result<Self> {
        let mut rtc = Rtc::builder()
            .set_rtp_mode(false) // Data channels only, no RTP media
            .build();

        let host_addr = std_socket.local_addr()?;
        let mut untrickled = Vec::new();

        let host = Candidate::host(host_addr, "udp")
            .map_err(|e| anyhow!("Failed to create host candidate: {}", e))?;
        if rtc.add_local_candidate(host.clone()).is_some() {
            untrickled.push(host);
        }

        if let Some(public_addr) = public_addr {
            match Candidate::server_reflexive(public_addr, host_addr, "udp") {
                Ok(srflx) => {
                    if rtc.add_local_candidate(srflx.clone()).is_some() {
                        untrickled.push(srflx);
                    } else {
                        warn!("str0m rejected server reflexive candidate");
                    }
                }
                Err(e) => warn!("Failed to create server reflexive candidate: {}", e),
            }
        }

        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            rtc,
            socket: Arc::new(socket),
            local_addr: host_addr,
            channel,
            channel_id: None,
            channel_open: false,
            pending_offer: None,
            has_remote: false,
            has_local: false,
            untrickled,
            failed: false,
        })
    }

    /// Shared handle for the runtime's receive loop
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Feed one received datagram into str0m
    pub fn handle_receive(&mut self, source: SocketAddr, data: &[u8]) -> Result<(), TransportError> {
        let contents = data
            .try_into()
            .map_err(|e| TransportError::Channel(format!("Bad datagram from {}: {}", source, e)))?;
        let receive = Receive {
            proto: Protocol::Udp,
            source,
            destination: self.local_addr,
            contents,
        };
        self.rtc
            .handle_input(Input::Receive(Instant::now(), receive))
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    /// Notify str0m that its requested deadline has passed
    pub fn handle_timeout(&mut self) -> Result<(), TransportError> {
        self.rtc
            .handle_input(Input::Timeout(Instant::now()))
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    /// Drain str0m outputs: transmit packets, collect events, return next deadline
    pub fn poll(&mut self, events: &mut Vec<TransportEvent>) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                self.fail(events, "Peer connection closed".to_string());
                return Instant::now() + Duration::from_secs(1);
            }

            let output = match self.rtc.poll_output() {
                Ok(output) => output,
                Err(e) => {
                    self.fail(events, e.to_string());
                    return Instant::now() + Duration::from_secs(1);
                }
            };

            match output {
                Output::Transmit(transmit) => {
                    if let Err(e) = self.socket.try_send_to(&transmit.contents, transmit.destination) {
                        warn!("Failed to send UDP packet to {}: {}", transmit.destination, e);
                    }
                }
                Output::Timeout(deadline) => return deadline,
                Output::Event(event) => self.handle_event(event, events),
            }
        }
    }

    fn fail(&mut self, events: &mut Vec<TransportEvent>, reason: String) {
        if !self.failed {
            self.failed = true;
            self.channel_open = false;
            events.push(TransportEvent::Failed(reason));
        }
    }

    fn handle_event(&mut self, event: Event, events: &mut Vec<TransportEvent>) {
        match event {
            Event::Connected => {
                info!("WebRTC connection established (ICE + DTLS)");
            }
            Event::IceConnectionStateChange(state) => {
                debug!("ICE state: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    self.fail(events, "ICE connection lost".to_string());
                }
            }
            Event::ChannelOpen(cid, label) => {
                info!("Data channel opened: {}", label);
                self.channel_id = Some(cid);
                self.channel_open = true;
                events.push(TransportEvent::ChannelOpen);
            }
            Event::ChannelData(data) => match String::from_utf8(data.data) {
                Ok(text) => events.push(TransportEvent::ChannelData(text)),
                Err(_) => warn!("Dropping non UTF-8 data channel payload"),
            },
            Event::ChannelClose(cid) => {
                if self.channel_id == Some(cid) {
                    info!("Data channel closed");
                    self.channel_open = false;
                    events.push(TransportEvent::ChannelClosed);
                }
            }
            _ => {}
        }
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            label: self.channel.label.clone(),
            ordered: self.channel.ordered,
            reliability: match self.channel.max_retransmits {
                Some(retransmits) => Reliability::MaxRetransmits { retransmits },
                None => Reliability::Reliable,
            },
            negotiated: None,
            protocol: String::new(),
        }
    }
}

impl PeerTransport for Str0mTransport {
    fn has_remote_description(&self) -> bool {
        self.has_remote
    }

    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let offer = SdpOffer::from_sdp_string(&offer.sdp)
            .map_err(|e| TransportError::Sdp(format!("Failed to parse offer: {}", e)))?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| TransportError::Sdp(format!("Failed to accept offer: {}", e)))?;

        self.has_remote = true;
        self.has_local = true;
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let config = self.channel_config();
        let mut change = self.rtc.sdp_api();
        let channel_id = change.add_channel_with_config(config);
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| TransportError::Sdp("Failed to apply SDP changes".to_string()))?;

        debug!("Created data channel {:?}", channel_id);
        self.channel_id = Some(channel_id);
        self.pending_offer = Some(pending);
        self.has_local = true;
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        // A bad answer must leave the pending offer in place for a retry
        let answer = SdpAnswer::from_sdp_string(&answer.sdp)
            .map_err(|e| TransportError::Sdp(format!("Failed to parse answer: {}", e)))?;
        let pending = self
            .pending_offer
            .take()
            .ok_or_else(|| TransportError::Sdp("No pending offer".to_string()))?;
        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| TransportError::Sdp(format!("Failed to accept answer: {}", e)))?;

        self.has_remote = true;
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| TransportError::Candidate(e.to_string()))?;
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn take_local_candidates(&mut self) -> Vec<IceCandidateInit> {
        if !self.has_local {
            return Vec::new();
        }
        self.untrickled
            .drain(..)
            .map(|candidate| {
                let line = candidate.to_sdp_string();
                let mut init = IceCandidateInit::new(line.trim().trim_start_matches("a="));
                // Data-only sessions have a single m-line
                init.sdp_m_line_index = Some(0);
                init
            })
            .collect()
    }

    fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let cid = self
            .channel_id
            .filter(|_| self.channel_open)
            .ok_or_else(|| TransportError::Channel("Data channel is not open".to_string()))?;
        let mut channel = self
            .rtc
            .channel(cid)
            .ok_or_else(|| TransportError::Channel("Data channel is gone".to_string()))?;
        channel
            .write(false, text.as_bytes())
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        self.channel_open = false;
        self.channel_id = None;
        self.pending_offer = None;
        self.rtc.disconnect();
    }
}

/// Pick the local IPv4 address most likely to reach the other peer.
/// Home networks (192.168/16) win, then other RFC 1918 ranges.
fn discover_local_ip() -> Result<IpAddr> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;

    let mut candidates: Vec<(String, std::net::Ipv4Addr)> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some((iface.name, ipv4)),
            _ => None,
        })
        .collect();

    debug!(
        "IPv4 interfaces: {:?}",
        candidates
            .iter()
            .map(|(name, ip)| format!("{}={}", name, ip))
            .collect::<Vec<_>>()
    );

    candidates.sort_by_key(|(_, ip)| {
        let octets = ip.octets();
        match octets {
            [192, 168, ..] => 0,
            [172, b, ..] if (16..=31).contains(&b) => 1,
            [10, ..] => 2,
            _ => 3,
        }
    });

    let (name, ip) = candidates
        .first()
        .ok_or_else(|| anyhow!("No suitable network interfaces found"))?;
    debug!("Selected interface {} with IP {}", name, ip);
    Ok(IpAddr::V4(*ip))
}

/// Query the STUN server for our public address.
/// Must use the ICE socket itself so the NAT mapping matches.
async fn query_stun_server(udp_socket: &StdUdpSocket, stun_server: &str) -> Result<SocketAddr> {
    let stun_addr = tokio::net::lookup_host(stun_server)
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("Failed to resolve STUN server to IPv4 address"))?;
    debug!("STUN server {} resolved to {}", stun_server, stun_addr);

    let socket_clone = udp_socket.try_clone()?;
    let client = stunclient::StunClient::new(stun_addr);
    let public_addr = tokio::task::spawn_blocking(
        move || -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
            socket_clone.set_read_timeout(Some(Duration::from_secs(5)))?;
            let result = client.query_external_address(&socket_clone)?;
            socket_clone.set_read_timeout(None)?;
            Ok(result)
        },
    )
    .await?
    .map_err(|e| anyhow!("STUN query failed: {}", e))?;

    Ok(public_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(channel: ChannelSettings) -> Str0mTransport {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        Str0mTransport::from_socket(socket, None, channel).unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_and_candidates_in_process() {
        let mut offerer = loopback(ChannelSettings::default());
        let mut answerer = loopback(ChannelSettings::default());

        // Nothing trickles before a local description exists
        assert!(offerer.take_local_candidates().is_empty());
        assert!(answerer.take_local_candidates().is_empty());

        let offer = offerer.create_offer().unwrap();
        assert_eq!(offer.kind.as_deref(), Some("offer"));
        assert!(offer.sdp.starts_with("v=0"));
        let offer_candidates = offerer.take_local_candidates();
        assert_eq!(offer_candidates.len(), 1);

        assert!(!answerer.has_remote_description());
        let answer = answerer.accept_offer(&offer).unwrap();
        assert!(answerer.has_remote_description());
        assert_eq!(answer.kind.as_deref(), Some("answer"));
        assert!(answer.sdp.starts_with("v=0"));

        offerer.accept_answer(&answer).unwrap();
        assert!(offerer.has_remote_description());

        let answer_candidates = answerer.take_local_candidates();
        assert_eq!(answer_candidates.len(), 1);
        for candidate in offer_candidates.iter().chain(answer_candidates.iter()) {
            assert!(candidate.candidate.starts_with("candidate:"), "{}", candidate.candidate);
            assert!(candidate.candidate.contains("127.0.0.1"));
            assert_eq!(candidate.sdp_m_line_index, Some(0));
        }

        offerer.add_remote_candidate(&answer_candidates[0]).unwrap();
        answerer.add_remote_candidate(&offer_candidates[0]).unwrap();

        // Each candidate is handed out once
        assert!(offerer.take_local_candidates().is_empty());
        assert!(answerer.take_local_candidates().is_empty());
        assert!(!offerer.is_channel_open());
    }

    #[tokio::test]
    async fn test_bad_answer_keeps_pending_offer() {
        let mut offerer = loopback(ChannelSettings::default());
        let mut answerer = loopback(ChannelSettings::default());

        let offer = offerer.create_offer().unwrap();
        let garbage = SessionDescription::answer("garbage");
        assert!(matches!(
            offerer.accept_answer(&garbage),
            Err(TransportError::Sdp(_))
        ));
        assert!(!offerer.has_remote_description());

        let answer = answerer.accept_offer(&offer).unwrap();
        offerer.accept_answer(&answer).unwrap();
        assert!(offerer.has_remote_description());
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let mut transport = loopback(ChannelSettings::default());
        let mut other = loopback(ChannelSettings::default());
        let offer = other.create_offer().unwrap();
        let answer = loopback(ChannelSettings::default()).accept_offer(&offer).unwrap();

        assert!(matches!(
            transport.accept_answer(&answer),
            Err(TransportError::Sdp(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_remote_candidate_is_candidate_error() {
        let mut transport = loopback(ChannelSettings::default());
        assert!(matches!(
            transport.add_remote_candidate(&IceCandidateInit::new("candidate:nonsense")),
            Err(TransportError::Candidate(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let mut transport = loopback(ChannelSettings::default());
        transport.create_offer().unwrap();
        assert!(matches!(
            transport.send_text("LEFT"),
            Err(TransportError::Channel(_))
        ));
    }

    #[test]
    fn test_channel_reliability_from_settings() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let reliable = loopback(ChannelSettings::default()).channel_config();
        assert_eq!(reliable.label, "controls");
        assert!(reliable.ordered);
        assert!(matches!(reliable.reliability, Reliability::Reliable));

        let lossy = loopback(ChannelSettings {
            label: "steer".to_string(),
            ordered: false,
            max_retransmits: Some(0),
        })
        .channel_config();
        assert_eq!(lossy.label, "steer");
        assert!(!lossy.ordered);
        assert!(matches!(
            lossy.reliability,
            Reliability::MaxRetransmits { retransmits: 0 }
        ));
    }
}
