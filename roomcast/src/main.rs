mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use roomcast_api::AppState;
use roomcast_core::{logging, Config};
use roomcast_sfu::{rtc::{RtcPeerFactory, RtcSettings}, RoomDirectory, SfuConfig};

use server::RoomcastServer;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "Roomcast WebRTC room coordinator", long_about = None)]
struct Args {
    /// Path to a YAML/TOML/JSON config file
    #[arg(long, env = "ROOMCAST_CONFIG")]
    config: Option<String>,
}

fn sfu_config(config: &Config) -> SfuConfig {
    let rooms = &config.rooms;
    SfuConfig {
        keyframe_interval_ms: rooms.keyframe_interval_ms,
        max_sync_attempts: rooms.max_sync_attempts,
        retry_delay_ms: rooms.retry_delay_ms,
        disconnect_grace_secs: rooms.disconnect_grace_secs,
        max_rooms: rooms.max_rooms,
        max_participants_per_room: rooms.max_participants_per_room,
    }
}

fn rtc_settings(config: &Config) -> RtcSettings {
    let webrtc = &config.webrtc;
    RtcSettings {
        stun_servers: webrtc.stun_servers.clone(),
        udp_port_min: webrtc.udp_port_min,
        udp_port_max: webrtc.udp_port_max,
        nat_1to1_ips: webrtc.nat_1to1_ips.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Roomcast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Build the coordinator
    let peer_factory = Arc::new(RtcPeerFactory::new(rtc_settings(&config))?);
    let directory = RoomDirectory::new(sfu_config(&config));
    info!(
        stun_servers = config.webrtc.stun_servers.len(),
        max_rooms = config.rooms.max_rooms,
        max_participants_per_room = config.rooms.max_participants_per_room,
        "Room directory initialized"
    );

    // 5. Serve until shutdown
    let state = AppState {
        directory: Arc::clone(&directory),
        peer_factory,
        max_message_size: config.server.max_message_size,
    };
    RoomcastServer::new(config, directory, roomcast_api::create_router(state))
        .run()
        .await
}
