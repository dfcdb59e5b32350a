// Signaling client against a local mock lobby server

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use steerlink::network::protocol::{IceCandidateInit, InboundMessage, OutboundMessage, SessionDescription};
use steerlink::network::session::SessionInput;
use steerlink::network::signaling::{SignalingClient, SignalingEvent};
use steerlink::network::{ClientSession, ProtocolError, SessionError};

/// Accept one client; forward every text frame it sends to `seen`
/// and push each frame of `script` to it once the first frame arrives
async fn mock_server(script: Vec<String>) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut scripted = false;

        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                let _ = seen_tx.send(value);
                if !scripted {
                    scripted = true;
                    for frame in &script {
                        ws.send(Message::Text(frame.clone())).await.unwrap();
                    }
                }
            }
        }
    });

    (url, seen_rx)
}

fn session() -> ClientSession {
    ClientSession::new("0123456789abc", "ABCD")
}

#[tokio::test]
async fn registers_on_connect() {
    let (url, mut seen) = mock_server(Vec::new()).await;
    let _client = SignalingClient::connect(&url, session()).await.unwrap();

    let register = seen.recv().await.unwrap();
    assert_eq!(register["type"], "register-client");
    assert_eq!(register["clientId"], "0123456789abc");
    assert_eq!(register["lobbyCode"], "ABCD");
}

#[tokio::test]
async fn stamps_outbound_frames() {
    let (url, mut seen) = mock_server(Vec::new()).await;
    let mut client = SignalingClient::connect(&url, session()).await.unwrap();
    seen.recv().await.unwrap();

    let mut candidate = IceCandidateInit::new("candidate:1 1 udp 2122260223 192.168.1.2 5000 typ host");
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_m_line_index = Some(0);
    client
        .send(&OutboundMessage::IceCandidateClient { candidate })
        .await
        .unwrap();
    client
        .send(&OutboundMessage::Answer {
            answer: SessionDescription::answer("v=0\r\n"),
        })
        .await
        .unwrap();

    let trickle = seen.recv().await.unwrap();
    assert_eq!(trickle["type"], "ice-candidate-client");
    assert_eq!(trickle["clientId"], "0123456789abc");
    assert_eq!(trickle["lobbyCode"], "ABCD");
    assert_eq!(trickle["candidate"]["sdpMid"], "0");
    assert_eq!(trickle["candidate"]["sdpMLineIndex"], 0);

    let answer = seen.recv().await.unwrap();
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["answer"]["type"], "answer");
    assert_eq!(answer["answer"]["sdp"], "v=0\r\n");
    assert_eq!(answer["clientId"], "0123456789abc");
}

#[tokio::test]
async fn dispatches_inbound_by_type() {
    let script = vec![
        json!({"type": "offer", "offer": {"type": "offer", "sdp": "v=0\r\n"}}).to_string(),
        json!({"type": "ice-candidate", "candidate": {"candidate": "1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0"}}).to_string(),
        json!({"type": "message", "message": "start"}).to_string(),
        json!({"type": "color-change", "color": "rgba(0, 128, 255, 1)"}).to_string(),
        json!({"type": "error", "message": "Lobby closed"}).to_string(),
    ];
    let (url, _seen) = mock_server(script).await;
    let mut client = SignalingClient::connect(&url, session()).await.unwrap();

    match client.next_event().await {
        SignalingEvent::Message(InboundMessage::Offer { offer }) => assert_eq!(offer.sdp, "v=0\r\n"),
        other => panic!("expected offer, got {:?}", other),
    }
    match client.next_event().await {
        SignalingEvent::Message(InboundMessage::IceCandidate { candidate }) => {
            assert_eq!(candidate.candidate, "1 1 udp 1 10.0.0.1 5000 typ host");
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        }
        other => panic!("expected ice-candidate, got {:?}", other),
    }
    assert!(matches!(
        client.next_event().await,
        SignalingEvent::Message(InboundMessage::Message { .. })
    ));
    assert_eq!(
        client.next_event().await,
        SignalingEvent::Message(InboundMessage::ColorChange {
            color: "rgba(0, 128, 255, 1)".to_string()
        })
    );
    assert_eq!(
        client.next_event().await,
        SignalingEvent::Message(InboundMessage::Error {
            message: "Lobby closed".to_string()
        })
    );
}

#[tokio::test]
async fn unsupported_and_invalid_frames_are_reported() {
    let script = vec![
        json!({"type": "ping"}).to_string(),
        "not json".to_string(),
        json!({"color": "red"}).to_string(),
        json!({"type": "color-change", "color": "red"}).to_string(),
    ];
    let (url, _seen) = mock_server(script).await;
    let mut client = SignalingClient::connect(&url, session()).await.unwrap();

    assert_eq!(
        client.next_event().await,
        SignalingEvent::Invalid(ProtocolError::UnsupportedType("ping".to_string()))
    );
    assert!(matches!(
        client.next_event().await,
        SignalingEvent::Invalid(ProtocolError::InvalidJson(_))
    ));
    assert_eq!(
        client.next_event().await,
        SignalingEvent::Invalid(ProtocolError::MissingType)
    );

    // The client keeps going after bad frames
    let event = client.next_event().await;
    assert!(matches!(event, SignalingEvent::Message(InboundMessage::ColorChange { .. })));
    assert!(client.is_open());

    // Bad frames map to non-terminal session input
    let input: SessionInput = SignalingEvent::Invalid(ProtocolError::MissingType).into();
    assert_eq!(input, SessionInput::Protocol(ProtocolError::MissingType));
}

#[tokio::test]
async fn connect_failure_is_signaling_error() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    match SignalingClient::connect(&url, session()).await {
        Err(e @ SessionError::Signaling(_)) => assert!(e.is_terminal()),
        Err(other) => panic!("expected signaling error, got {}", other),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn send_after_close_fails() {
    let (url, _seen) = mock_server(Vec::new()).await;
    let mut client = SignalingClient::connect(&url, session()).await.unwrap();
    client.close().await;

    assert!(!client.is_open());
    let result = client.send(&OutboundMessage::RegisterClient {}).await;
    assert!(matches!(result, Err(SessionError::Signaling(_))));
    assert_eq!(client.next_event().await, SignalingEvent::Closed);
}
