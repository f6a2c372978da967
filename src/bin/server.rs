//! Runs the tank module behind a TCP listener.
//!
//! Configuration comes from `TABLESYNC_*` environment variables. The server
//! stops when standard input reaches end-of-file or reads `quit`.

use std::io::BufRead;
use std::net::TcpListener;
use std::thread;
use tablesync::transport::tcp;
use tablesync::{CancellationToken, Host, HostConfig, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = HostConfig::from_env()?;
    info!(
        module = %config.module_name,
        listen_addr = %config.listen_addr,
        seed_parts = config.seed_parts,
        "starting tablesync server"
    );

    let host = Host::tank(&config);
    let listener = TcpListener::bind(&config.listen_addr)?;
    let cancel = CancellationToken::new();

    let stop = cancel.clone();
    thread::Builder::new()
        .name("tablesync-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "quit" => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            stop.cancel();
        })?;

    tcp::serve(host, listener, cancel)
}
