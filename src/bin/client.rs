//! Interactive console client.
//!
//! Type `/name <new name>` to rename yourself. Presence and rename notices
//! from every connected user are printed as they arrive. End-of-input exits.

use std::io::BufRead;
use tablesync::client::notices;
use tablesync::{
    command_queue, parse_input_line, CancellationToken, ClientConfig, CredentialStore,
    DbConnection, ProcessingLoop, Result,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = ClientConfig::from_env()?;
    let credentials = CredentialStore::new(&config.credentials_path);
    let token = credentials.load().unwrap_or_else(|e| {
        warn!(path = %credentials.path().display(), error = %e, "ignoring unreadable credentials");
        None
    });

    let save_to = credentials.clone();
    let mut conn = DbConnection::builder()
        .with_uri(&config.host)
        .with_module_name(&config.module_name)
        .with_token(token)
        .on_connect(move |conn, _identity, token| {
            if let Err(e) = save_to.save(token) {
                warn!(error = %e, "could not save credentials");
            }
            let subscribed = conn
                .subscription_builder()
                .on_applied(|ctx| notices::applied_notices(ctx).iter().for_each(|l| println!("{}", l)))
                .subscribe_to_all_tables();
            if let Err(e) = subscribed {
                error!(error = %e, "subscription request failed");
            }
        })
        .on_connect_error(|e| println!("{}", notices::connect_error_notice(e)))
        .on_disconnect(|_, e| println!("{}", notices::disconnect_notice(e)))
        .build()?;

    notices::register(&mut conn, |line| println!("{}", line));

    let (commands, queue) = command_queue();
    let cancel = CancellationToken::new();
    let worker = ProcessingLoop::new(conn, queue, cancel.clone(), config.tick_interval).spawn()?;

    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if let Some(command) = parse_input_line(&line) {
            commands.enqueue(command);
        }
    }

    cancel.cancel();
    if worker.join().is_err() {
        error!("processing thread panicked");
    }
    Ok(())
}
