use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use relaycall::{
    CallClient, CallClientBuilder, ClientConfig, MediaKind, PeerId, PeerInfo, RoomContext,
};
use std::time::Duration;

// Diagnostic client for the call relay.
//
// Usage:
//   callctl --room a1b2c3 roster                      # who is in a private room
//   callctl --room a1b2c3 call 7365 --video           # place a call
//   callctl --room a1b2c3 listen --auto-accept        # answer whoever calls
//   callctl --chat-id -100123 --init-data ... \
//           --self-id 42 history                      # group room call log

#[derive(Parser)]
#[command(name = "callctl", about = "Diagnostic client for the call relay")]
struct Cli {
    /// Relay origin, e.g. https://calls.example.org
    #[arg(long, default_value = "http://localhost:8000")]
    relay: String,

    /// Group chat id (requires --init-data and --self-id)
    #[arg(long, conflicts_with = "room")]
    chat_id: Option<String>,

    /// Platform init-data blob authenticating us in the group room
    #[arg(long, requires = "chat_id")]
    init_data: Option<String>,

    /// Our own numeric id in the group room
    #[arg(long, requires = "chat_id")]
    self_id: Option<i64>,

    /// Private room id
    #[arg(long)]
    room: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print who is in the room
    Roster,
    /// Call a peer and stay on until the call ends
    Call {
        /// Peer id (number in group rooms, string in private rooms)
        peer: String,
        #[arg(long)]
        video: bool,
    },
    /// Wait for calls and print what happens
    Listen {
        /// Answer incoming calls instead of just reporting them
        #[arg(long)]
        auto_accept: bool,
    },
    /// Print the room's call history
    History,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(cli))
}

fn room_context(cli: &Cli) -> anyhow::Result<RoomContext> {
    if let Some(chat_id) = &cli.chat_id {
        let init_data = cli
            .init_data
            .clone()
            .context("--init-data is required for group rooms")?;
        let self_id = cli
            .self_id
            .context("--self-id is required for group rooms")?;
        return Ok(RoomContext::Group {
            chat_id: chat_id.clone(),
            init_data,
            self_id: PeerId::Num(self_id),
        });
    }
    if let Some(room_id) = &cli.room {
        return Ok(RoomContext::Private {
            room_id: room_id.clone(),
        });
    }
    anyhow::bail!("pass either --chat-id with --init-data/--self-id, or --room")
}

fn parse_peer(raw: &str) -> PeerId {
    raw.parse::<i64>()
        .map(PeerId::Num)
        .unwrap_or_else(|_| PeerId::Str(raw.to_string()))
}

async fn wait_for_roster(client: &CallClient) -> anyhow::Result<Vec<PeerInfo>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let peers = client.roster().await?;
        if !peers.is_empty() {
            return Ok(peers);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("no roster snapshot within 10s; is the relay reachable?");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let room = room_context(&cli)?;
    let config = ClientConfig::new(cli.relay.clone(), room);
    let client = CallClientBuilder::new(config).connect();

    match cli.command {
        Cmd::Roster => {
            let peers = wait_for_roster(&client).await?;
            for peer in &peers {
                info!("{:<24} {:?} (id {})", peer.display_name(), peer.status, peer.id);
            }
        }
        Cmd::Call { peer, video } => {
            let media = if video {
                MediaKind::Video
            } else {
                MediaKind::Audio
            };
            let target = parse_peer(&peer);
            let mut state = client.events().call_state.subscribe();
            let mut concluded = client.events().call_concluded.subscribe();
            wait_for_roster(&client).await?;
            client.place_call(target, media).await?;
            loop {
                tokio::select! {
                    changed = state.recv() => match changed {
                        Ok(changed) => info!("Call phase: {:?}", changed.session.phase),
                        Err(_) => break,
                    },
                    done = concluded.recv() => match done {
                        Ok(done) => {
                            info!("Call ended: {:?} ({:?})", done.outcome, done.reason);
                            break;
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Hanging up");
                        if let Err(e) = client.hangup().await {
                            warn!("Hangup failed: {e}");
                            break;
                        }
                    }
                }
            }
        }
        Cmd::Listen { auto_accept } => {
            let mut ring = client.events().incoming_ring.subscribe();
            let mut roster = client.events().roster.subscribe();
            let mut concluded = client.events().call_concluded.subscribe();
            info!("Listening for calls (ctrl-c to quit)");
            loop {
                tokio::select! {
                    update = roster.recv() => {
                        if let Ok(update) = update {
                            info!("Roster: {} peer(s) online", update.peers.len());
                        }
                    }
                    incoming = ring.recv() => {
                        if let Ok(incoming) = incoming {
                            info!(
                                "Incoming {:?} call from {}",
                                incoming.media,
                                incoming.peer.display_name()
                            );
                            if auto_accept {
                                match client.accept().await {
                                    Ok(()) => info!("Accepted"),
                                    Err(e) => warn!("Could not accept: {e}"),
                                }
                            } else {
                                info!("Run with --auto-accept to answer calls");
                            }
                        }
                    }
                    done = concluded.recv() => {
                        if let Ok(done) = done {
                            info!("Call ended: {:?} ({:?})", done.outcome, done.reason);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Cmd::History => {
            let entries = client.call_history().await?;
            if entries.is_empty() {
                info!("No recorded calls");
            }
            for entry in &entries {
                let duration = entry
                    .duration
                    .map(|secs| format!(", {}:{:02}", secs / 60, secs % 60))
                    .unwrap_or_default();
                info!(
                    "{} {:?} {:?} call with {} ({:?}{duration})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.direction,
                    entry.media,
                    entry.peer.display_name(),
                    entry.outcome,
                );
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
