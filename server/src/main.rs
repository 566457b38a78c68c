use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use umbra_common::{config::socket_path, HelperCertPath, SOCKET_NAME};
use umbra_helper::HelperServer;

#[derive(Parser)]
#[command(name = "umbra-helper")]
#[command(about = "Umbra privileged helper: key storage and crypto operations")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Socket path (defaults to $UMBRA_SOCKET_DIR/umbra-helper.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Require mutual TLS using certificates under $UMBRA_CERTS_DIR
    #[arg(long)]
    tls: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Starting umbra helper...");
    // SAFETY: getuid has no preconditions
    if unsafe { libc::getuid() } != 0 {
        tracing::warn!("Helper not running as root - some operations may fail");
    }

    let path = args.socket.unwrap_or_else(|| socket_path(SOCKET_NAME));
    let mut server = HelperServer::new(path);
    if args.tls {
        server = server
            .with_tls(&HelperCertPath::new())
            .context("Failed to load helper certificates")?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal, stopping helper...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    server.run_with_shutdown(running).context("Helper error")?;
    tracing::info!("Helper stopped");
    Ok(())
}
