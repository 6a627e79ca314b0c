/*!
 * emberd Server Entry Point
 *
 * Parses the command line, initializes logging, loads the configuration,
 * wires the command engine into a shared server context, and runs the
 * worker reactors until the process is killed.
 */

use anyhow::Result;
use clap::Parser;
use emberd::{spawn_aof_writer, Config, RespEngine, Server, ServerContext};
use log::{info, warn};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[clap(name = "emberd", version, about = "Multi-reactor Redis-protocol server")]
struct Cli {
    /// Path to the TOML config file; defaults apply when omitted
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Override the configured listen port
    #[clap(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let aof = match &config.aof_file {
        Some(path) => match spawn_aof_writer(path) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("[server] running without aof: {e}");
                None
            }
        },
        None => None,
    };

    let engine = Arc::new(RespEngine::new(aof));
    let ctx = ServerContext::new(config, engine);
    let mut server = Server::new(ctx)?;
    server.start();
    info!(
        "[server] emberd listening on {:?}",
        server.local_addrs()
    );
    server.join();
    Ok(())
}
