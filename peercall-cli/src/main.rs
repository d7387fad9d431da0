//! PeerCall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use peercall_core::prelude::*;
use peercall_core::ControlsAutoHide;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Call configuration file (JSON)
    #[arg(short, long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a call through a WebSocket relay
    Join {
        /// Relay base URL (ws://, wss://, http:// or https://)
        #[arg(long, env = "PEERCALL_URL", default_value = "ws://localhost:8000")]
        url: String,

        /// Session id shared by both participants
        #[arg(long)]
        session: String,

        /// Send the offer instead of waiting for one
        #[arg(long)]
        initiator: bool,
    },

    /// Run a call between two in-process participants
    Loopback {
        /// Session id (random if omitted)
        #[arg(long)]
        session: Option<String>,

        /// Seconds to wait for the call to connect
        #[arg(long, default_value = "20")]
        timeout: u64,
    },

    /// Show configuration and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(default_config_path);
    let config = load_config(config_path.as_ref())?;

    match cli.command {
        Commands::Join {
            url,
            session,
            initiator,
        } => {
            handle_join(config, &url, &session, initiator).await?;
        }
        Commands::Loopback { session, timeout } => {
            handle_loopback(config, session, Duration::from_secs(timeout)).await?;
        }
        Commands::Status => {
            handle_status(&config, config_path.as_ref())?;
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "peercall", "peercall").map(|dirs| dirs.config_dir().join("config.json"))
}

fn load_config(path: Option<&PathBuf>) -> Result<CallConfig> {
    let config = match path {
        Some(path) if path.exists() => CallConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        _ => CallConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn handle_join(config: CallConfig, url: &str, session: &str, initiator: bool) -> Result<()> {
    let role = if initiator {
        CallRole::Initiator
    } else {
        CallRole::Responder
    };
    println!("📞 Joining session {session} as {role:?}");
    println!("   Relay: {url}");

    let backends = CallBackends {
        signaling: Arc::new(WebSocketChannel::new(url)),
        media: Arc::new(SyntheticDevices::new()),
        peers: Arc::new(WebRtcEngineFactory::new()),
    };
    let manager = CallSessionManager::new(SessionId::new(session), role, config.clone(), backends);
    let controller = manager.controller();
    let mut events = manager.subscribe_events();
    let call = tokio::spawn(manager.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut controls = ControlsAutoHide::new(config.controls_auto_hide(), Instant::now());
    let mut hint_shown = false;
    let mut connected = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if let CallEvent::ConnectionStateChanged { state } = event {
                        connected = state == ConnectionState::Connected;
                        if state.is_terminal() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    controls.record_activity(Instant::now());
                    dispatch_line(&controller, line.trim());
                }
                None => {
                    stdin_open = false;
                    controller.end();
                }
            },
            _ = ticker.tick() => {
                let visible = controls.visible(Instant::now(), connected);
                if visible && !hint_shown {
                    println!("💡 /mute  /video  /share  /quit  (anything else is sent as chat)");
                }
                hint_shown = visible;
            }
            _ = tokio::signal::ctrl_c() => controller.end(),
        }
    }

    let final_state = call.await?;
    println!("📞 Call ended ({final_state})");
    Ok(())
}

fn dispatch_line(controller: &CallController, line: &str) {
    match line {
        "" => {}
        "/mute" => {
            controller.toggle_audio();
        }
        "/video" => {
            controller.toggle_video();
        }
        "/share" => {
            controller.toggle_screen_share();
        }
        "/quit" | "/end" => controller.end(),
        text => {
            controller.send_chat(text);
        }
    }
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::ConnectionStateChanged { state } => match state {
            ConnectionState::Connected => println!("✅ Connected"),
            ConnectionState::Failed => println!("❌ Call failed"),
            ConnectionState::Disconnected => println!("👋 Disconnected"),
            other => println!("⏳ {other}"),
        },
        CallEvent::ChatMessageReceived { entry } => {
            println!("💬 {}: {}", entry.sender_label, entry.text);
        }
        CallEvent::RemoteStreamAvailable { stream } => {
            println!("📺 Remote stream {} ({} tracks)", stream.id, stream.tracks.len());
        }
        CallEvent::PeerJoined { username } => {
            println!("🙋 {} joined", username.as_deref().unwrap_or("Participant"));
        }
        CallEvent::ScreenShareChanged { active } => {
            if *active {
                println!("🖥️  Sharing screen");
            } else {
                println!("📷 Camera restored");
            }
        }
        CallEvent::Error { kind, detail } => {
            println!("⚠️  {kind:?}: {detail}");
        }
    }
}

async fn wait_for_state(
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    target: ConnectionState,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(CallEvent::ConnectionStateChanged { state }) if state == target => return Ok(()),
            Ok(CallEvent::ConnectionStateChanged { state }) if state.is_terminal() => {
                bail!("call ended in state {state}")
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("call ended"),
        }
    }
}

async fn handle_loopback(
    config: CallConfig,
    session: Option<String>,
    timeout: Duration,
) -> Result<()> {
    let session_id = SessionId::new(session.unwrap_or_else(generate_session_id));
    println!("🔁 Loopback call in session {session_id}");

    let hub = SignalingHub::new();
    let participant = |name: &str, role: CallRole| {
        CallSessionManager::new(
            session_id.clone(),
            role,
            config.clone(),
            CallBackends {
                signaling: Arc::new(hub.channel(name)),
                media: Arc::new(SyntheticDevices::new()),
                peers: Arc::new(WebRtcEngineFactory::new()),
            },
        )
    };
    let responder = participant("responder", CallRole::Responder);
    let initiator = participant("initiator", CallRole::Initiator);

    let responder_ctl = responder.controller();
    let initiator_ctl = initiator.controller();
    let mut responder_events = responder.subscribe_events();
    let mut initiator_events = initiator.subscribe_events();

    let responder_task = tokio::spawn(responder.run());
    let initiator_task = tokio::spawn(initiator.run());

    let started = Instant::now();
    let connected = tokio::time::timeout(timeout, async {
        wait_for_state(&mut initiator_events, ConnectionState::Connected).await?;
        wait_for_state(&mut responder_events, ConnectionState::Connected).await
    })
    .await;

    let outcome = match connected {
        Ok(Ok(())) => {
            println!("✅ Both sides connected in {:?}", started.elapsed());
            initiator_ctl.send_chat("hello from the initiator");
            let chat = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    match responder_events.recv().await {
                        Ok(CallEvent::ChatMessageReceived { entry }) => return Some(entry),
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return None,
                    }
                }
            })
            .await;
            match chat {
                Ok(Some(entry)) => println!("💬 Responder received: {}", entry.text),
                _ => println!("⚠️  Chat was not delivered"),
            }
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("call did not connect within {timeout:?}")),
    };

    initiator_ctl.end();
    responder_ctl.end();
    let initiator_state = initiator_task.await?;
    let responder_state = responder_task.await?;
    println!("📞 Initiator: {initiator_state}, responder: {responder_state}");

    outcome
}

fn handle_status(config: &CallConfig, config_path: Option<&PathBuf>) -> Result<()> {
    println!("📊 PeerCall CLI Status");
    println!("======================");
    match config_path {
        Some(path) if path.exists() => println!("✅ Config: {}", path.display()),
        Some(path) => println!("⚠️  Config: {} (not found, using defaults)", path.display()),
        None => println!("⚠️  Config: no config directory, using defaults"),
    }
    println!("✅ WebRTC engine: webrtc-rs");
    println!("✅ Signaling: WebSocket relay, in-process hub");
    println!("⚠️  Capture devices: synthetic (silent audio, blank video)");
    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  peercall join --session <id> [--initiator]  - Join a call via the relay");
    println!("  peercall loopback [--session <id>]          - Call yourself in-process");
    println!("  peercall status                             - Show this status");
    println!();
    println!("Use 'peercall --help' for detailed options");

    Ok(())
}

fn generate_session_id() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "grove", "harbor", "iris", "juniper",
        "kestrel", "lagoon", "maple", "nimbus", "orchid", "pine", "quartz", "raven", "sierra",
        "tundra", "umber", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{:04}", rng.gen_range(0..10_000))
}
