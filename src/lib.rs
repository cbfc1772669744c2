pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod monitor;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

use anyhow::Context;
use clap::Parser;
use config::ClientConfig;
use media::SampleMediaSource;
use peer::RtcTransportFactory;
use session::{Collaborators, SessionController};
use signaling::{Role, RoomDirectory, WsConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub use error::{Result, SessionError};

#[derive(Debug, Parser)]
#[command(name = "roomlink", version, about = "Join a WebRTC room through a signaling relay")]
pub struct CliArgs {
    /// Room to join or create
    #[arg(long, env = "ROOMLINK_ROOM")]
    pub room: Option<String>,

    #[arg(long, value_enum, default_value_t = Role::Join)]
    pub role: Role,

    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the rooms known to the relay and exit
    #[arg(long)]
    pub list_rooms: bool,
}

pub fn run() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    logger::init_logging();

    let config = ClientConfig::load(args.config.as_deref()).context("loading config")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(args, config))
}

async fn serve(args: CliArgs, config: ClientConfig) -> anyhow::Result<()> {
    if args.list_rooms || args.room.is_none() {
        let rooms = RoomDirectory::new(config.rooms_url.clone())?
            .list()
            .await
            .context("listing rooms")?;
        if rooms.is_empty() {
            println!("No rooms");
        }
        for room in &rooms {
            println!("{}\t{}", room.name, room.created_at.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    let Some(room) = args.room else {
        return Ok(());
    };

    let deps = Collaborators::new(
        Arc::new(SampleMediaSource),
        Arc::new(RtcTransportFactory::new(&config)),
        Arc::new(WsConnector),
        Arc::new(logger::LogStatusSink),
    );
    let controller = SessionController::new(config, deps);
    controller
        .join(&room, args.role)
        .await
        .with_context(|| format!("joining room '{room}'"))?;

    info!("In room '{room}', press Ctrl+C to leave");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {e}");
    }
    controller.leave().await;
    Ok(())
}
