use anyhow::{anyhow, Result};
use crossterm::{
    event::{KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement},
};
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use steerlink::config::{self, Config};
use steerlink::debug;
use steerlink::input::{poll_input, InputAction, KeyMap};
use steerlink::network::{
    self, ClientSession, ConnectionState, ManagerOptions, NetworkClient, NetworkEvent, Role,
    RuntimeOptions,
};

const INPUT_POLL: Duration = Duration::from_millis(20);

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    lobby: String,
    role: Role,
    server: Option<String>,
    debug: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            print_usage(&args[0]);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    debug::init(cli.debug)?;
    if cli.debug {
        eprintln!("Debug logging to {}", debug::log_path().display());
    }

    let mut config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}", e);
        Config::default()
    });
    if let Some(server) = &cli.server {
        config.network.signaling_server = server.clone();
    }

    let session = ClientSession::from_path(&cli.lobby)
        .ok_or_else(|| anyhow!("Lobby code must not be empty"))?;
    info!("Starting session {:?} as {:?}", session, cli.role);

    let options = RuntimeOptions {
        signaling_server: config.network.signaling_server.clone(),
        stun_server: config.network.stun_server.clone(),
        role: cli.role,
        channel: config.channel.clone(),
        manager: ManagerOptions {
            policy: config.controls.policy(),
            wire_format: config.controls.wire_format,
        },
    };

    let client = network::start_network(session, options)?;

    let timeout = Duration::from_secs(config.network.connection_timeout_secs);
    if !wait_for_connection(&client, timeout)? {
        client.disconnect()?;
        std::process::exit(1);
    }

    let keymap = KeyMap::from_bindings(&config.keybindings);
    let result = run_controller(&client, &keymap, cli.role);
    // Runtime may already have exited
    let _ = client.disconnect();
    result
}

/// Parse command line arguments. Ok(None) means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Cli>> {
    let mut lobby = None;
    let mut role = Role::Answerer;
    let mut server = None;
    let mut debug = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--offer" => role = Role::Offerer,
            "--debug" | "-d" => debug = true,
            "--server" | "-s" => {
                let url = iter
                    .next()
                    .ok_or_else(|| anyhow!("--server requires a WebSocket URL"))?;
                server = Some(url.clone());
            }
            other if other.starts_with('-') => return Err(anyhow!("Unknown argument: {}", other)),
            other => {
                if lobby.is_some() {
                    return Err(anyhow!("Unexpected extra argument: {}", other));
                }
                lobby = Some(other.to_string());
            }
        }
    }

    let lobby = lobby.ok_or_else(|| anyhow!("Missing lobby code"))?;
    Ok(Some(Cli {
        lobby,
        role,
        server,
        debug,
    }))
}

fn print_usage(program: &str) {
    println!("Steerlink - remote steering over a WebRTC data channel");
    println!();
    println!("Usage:");
    println!("  {} <lobby-code>                # Join a lobby as the controller", program);
    println!("  {} <lobby-code> --offer        # Join as the steered peer", program);
    println!();
    println!("Options:");
    println!("  --server <url>   Signaling server (overrides config and {})", config::SIGNALING_SERVER_ENV);
    println!("  --debug          Write a debug log to {}", debug::log_path().display());
    println!("  --help           Show this message");
    println!();
    println!("Examples:");
    println!("  {} ABCD", program);
    println!("  {} /ABCD --server wss://lobby.example.com", program);
}

/// Wait until the data channel is open. Shows a braille spinner on stderr.
/// Returns false on disconnect or timeout.
fn wait_for_connection(client: &NetworkClient, timeout: Duration) -> io::Result<bool> {
    let spinner = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let started = Instant::now();
    let mut frame = 0;

    loop {
        while let Some(event) = client.try_recv_event() {
            match event {
                NetworkEvent::SessionReady {
                    client_id,
                    lobby_code,
                } => {
                    eprint!("\r\x1b[K");
                    eprintln!("Joining lobby {} as {}", lobby_code, client_id);
                }
                NetworkEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                    eprint!("\r\x1b[K");
                    eprintln!("Connected!");
                    return Ok(true);
                }
                NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected) => {
                    eprint!("\r\x1b[K");
                    eprintln!("Disconnected");
                    return Ok(false);
                }
                NetworkEvent::Error(e) => {
                    eprint!("\r\x1b[K");
                    eprintln!("Error: {}", e);
                }
                NetworkEvent::PlayerColor(color) => {
                    eprint!("\r\x1b[K");
                    eprintln!("Assigned color: {}", color);
                }
                _ => {}
            }
        }

        if started.elapsed() >= timeout {
            eprint!("\r\x1b[K");
            eprintln!("Timed out after {}s waiting for the peer", timeout.as_secs());
            return Ok(false);
        }

        eprint!("\r{} Connecting... ", spinner[frame % spinner.len()]);
        io::stderr().flush()?;

        frame += 1;
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Forward key edges until quit or disconnect
fn run_controller(client: &NetworkClient, keymap: &KeyMap, role: Role) -> Result<()> {
    enable_raw_mode()?;
    let mut stderr = io::stderr();

    let reports_release = supports_keyboard_enhancement().unwrap_or(false)
        && execute!(
            stderr,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )
        .is_ok();
    info!("Key release events available: {}", reports_release);

    status(match role {
        Role::Answerer => "Waiting for the lobby to start. Steer with the arrow keys, Q quits.",
        Role::Offerer => "Receiving directions. Q quits.",
    });
    if !reports_release && role == Role::Answerer {
        status("Terminal does not report key releases: Space or Down releases both sides.");
    }

    let result = controller_loop(client, keymap, reports_release);

    if reports_release {
        let _ = execute!(stderr, PopKeyboardEnhancementFlags);
    }
    disable_raw_mode()?;
    result
}

fn controller_loop(client: &NetworkClient, keymap: &KeyMap, reports_release: bool) -> Result<()> {
    loop {
        for action in poll_input(keymap, INPUT_POLL, reports_release)? {
            match action {
                InputAction::Press(control) => client.press(control)?,
                InputAction::Release(control) => client.release(control)?,
                InputAction::Quit => return Ok(()),
            }
        }

        while let Some(event) = client.try_recv_event() {
            match event {
                NetworkEvent::AcceptingInputChanged(true) => status("Lobby started, steering is live"),
                NetworkEvent::AcceptingInputChanged(false) => status("Steering paused"),
                NetworkEvent::ReceivedDirection(direction) => status(&format!("Direction: {}", direction)),
                NetworkEvent::PlayerColor(color) => status(&format!("Assigned color: {}", color)),
                NetworkEvent::Success(message) => status(&message),
                NetworkEvent::Error(e) => status(&format!("Error: {}", e)),
                NetworkEvent::ConnectionStateChanged(ConnectionState::Disconnected) => {
                    status("Disconnected");
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

/// One status line; raw mode needs the explicit carriage return
fn status(message: &str) {
    eprint!("\r\x1b[K{}\r\n", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("steerlink")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_lobby_and_flags() {
        let cli = parse_args(&args(&["/ABCD", "--offer", "--server", "ws://host:9000", "--debug"]))
            .unwrap()
            .unwrap();
        assert_eq!(cli.lobby, "/ABCD");
        assert_eq!(cli.role, Role::Offerer);
        assert_eq!(cli.server.as_deref(), Some("ws://host:9000"));
        assert!(cli.debug);
    }

    #[test]
    fn test_defaults_to_answerer() {
        let cli = parse_args(&args(&["ABCD"])).unwrap().unwrap();
        assert_eq!(cli.role, Role::Answerer);
        assert_eq!(cli.server, None);
        assert!(!cli.debug);
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["ABCD", "--server"])).is_err());
        assert!(parse_args(&args(&["ABCD", "--bogus"])).is_err());
        assert!(parse_args(&args(&["ABCD", "EFGH"])).is_err());
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
    }
}
