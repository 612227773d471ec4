//! Unison - synchronized listening rooms
//!
//! `unison serve` shares a directory of audio files as listening rooms;
//! `unison join` follows a room from another machine, starting and stopping
//! in step with everyone else.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unison_core::{ClockedPlayer, RoomCode, RoomStore, TrackIndex};
use unison_net::{Broadcaster, ClientEvent, Server, Session};

mod commands;
mod config;
mod error;

use commands::Command;
use config::{ClientConfig, Config, ServerConfig};
use error::{AppError, Result};

#[derive(Parser)]
#[command(name = "unison", about = "Synchronized listening rooms", version)]
struct Cli {
    /// Config file (default: unison.toml in the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory of audio files
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory of audio files
        #[arg(short, long)]
        audio_dir: Option<PathBuf>,
        /// Directory for durable room state
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Join a room and play along
    Join {
        /// Server address (host:port)
        #[arg(short, long)]
        server: Option<String>,
        /// Room code
        #[arg(short, long)]
        room: Option<String>,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Keep fetched tracks in memory only
        #[arg(long)]
        no_cache: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match Config::load(cli.config.as_deref()) {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Serve {
            port,
            audio_dir,
            state_dir,
        } => {
            let mut server = config.server;
            server.port = port.unwrap_or(server.port);
            server.audio_dir = audio_dir.unwrap_or(server.audio_dir);
            server.state_dir = state_dir.unwrap_or(server.state_dir);
            serve(server).await
        }
        Commands::Join {
            server,
            room,
            name,
            no_cache,
        } => {
            let mut client = config.client;
            client.server = server.unwrap_or(client.server);
            client.room = room.or(client.room);
            client.name = name.unwrap_or(client.name);
            join(client, no_cache).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let index = TrackIndex::scan_dir(&config.audio_dir)?;
    if index.is_empty() {
        warn!(dir = %config.audio_dir.display(), "No audio files found");
    }

    let broadcaster = Arc::new(Broadcaster::new());
    let store = Arc::new(
        RoomStore::open(&config.state_dir, index)?.with_observer(broadcaster.clone()),
    );
    let server = Server::start(config.port, store.clone(), broadcaster, &config.audio_dir).await?;

    for room in store.rooms() {
        info!(
            room = %room,
            "Join with: unison join --server <this host>:{} --room {}",
            server.addr().port(),
            room
        );
    }

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| AppError::Config(format!("Could not resolve {}", server)))
}

async fn join(config: ClientConfig, no_cache: bool) -> Result<()> {
    let room = config
        .room
        .map(RoomCode::new)
        .ok_or_else(|| AppError::Config("No room given (--room or [client] room)".into()))?;
    let addr = resolve(&config.server).await?;

    let player = Arc::new(Mutex::new(ClockedPlayer::new()));
    let cache_db = (!no_cache).then_some(config.cache_db.as_path());
    let (session, mut events) = Session::start(addr, room, config.name, player, cache_db).await?;
    println!("{}", commands::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match commands::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => execute(&session, command).await,
                    Ok(None) => {}
                    Err(message) => println!("{}", message),
                }
            }
            event = events.recv() => match event {
                Some(ClientEvent::Notice(text)) => println!("{}", text),
                Some(ClientEvent::CacheDisabled(reason)) => {
                    warn!(reason = %reason, "Track cache disabled");
                }
                Some(ClientEvent::Disconnected) | None => {
                    warn!("Lost connection to server");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn execute(session: &Session, command: Command) {
    let client = session.client();
    let action = match command {
        Command::Control(action) => action,
        Command::Nudge(query) => {
            let snapshot = client.snapshot();
            match commands::resolve_track(&snapshot.index, &query) {
                Some(track) => unison_core::Action::Nudge { track },
                None => {
                    println!("No track matches {:?}", query);
                    return;
                }
            }
        }
        Command::Status => {
            println!("{}", session.status_line());
            return;
        }
        Command::Help => {
            println!("{}", commands::HELP);
            return;
        }
        Command::Quit => return,
    };

    match client.control(action).await {
        Ok(_) => println!("{}", session.status_line()),
        // The out-of-sync notice arrives on the event stream
        Err(unison_net::Error::Conflict(_)) => {}
        Err(e) => println!("Request failed: {}", e),
    }
}
