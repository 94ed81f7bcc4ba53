// CLI entry point for the Kipukas relay.
//
// Starts a standalone relay that browser and native clients connect to over
// WebSocket. The relay pairs clients by room code and forwards their
// messages; it never sees game rules. See `server.rs` for the networking
// architecture and `registry.rs` for room state.
//
// Usage:
//   relay [OPTIONS]
//     --bind <ADDR>        Listen address (default: 127.0.0.1)
//     --port <PORT>        Listen port (default: 8787)
//     --grace-secs <N>     Seconds a room survives a dropped peer (default: 30)
//
// Every option can also come from the environment (`KIPUKAS_RELAY_BIND`,
// `KIPUKAS_RELAY_PORT`, `KIPUKAS_RELAY_GRACE_SECS`). Log output is controlled
// by `RUST_LOG` and defaults to `kipukas_relay=info`.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use kipukas_relay::server::{RelayConfig, start_relay};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Room relay for two-player Kipukas sessions")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "KIPUKAS_RELAY_BIND", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "KIPUKAS_RELAY_PORT", default_value_t = 8787)]
    port: u16,

    /// Seconds an abandoned room is kept for a reconnecting peer
    #[arg(long, env = "KIPUKAS_RELAY_GRACE_SECS", default_value_t = 30)]
    grace_secs: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kipukas_relay=info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        bind_addr: args.bind,
        port: args.port,
        grace_period: Duration::from_secs(args.grace_secs),
        ..RelayConfig::default()
    };

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    println!("Relay listening on ws://{addr}/");
    // Runs until the process is killed; SIGINT/SIGTERM end it directly.
    handle.wait();
}
