//! The processing loop: pump the connection, then drain commands.

use crate::client::DbConnection;
use crate::commands::{Command, CommandReceiver, NAME_COMMAND};
use crate::error::Result;
use crate::types::CancellationToken;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the loop hands back when it stops.
pub struct LoopExit {
    /// The connection, already disconnected.
    pub connection: DbConnection,
    /// Completed iterations.
    pub iterations: u64,
    /// Commands turned into reducer calls.
    pub commands: u64,
}

/// Drives one connection until cancelled.
///
/// Every iteration first applies what the host sent, then issues the queued
/// commands in order, then sleeps for `interval`. Cancellation is checked
/// before each iteration, so at most one more iteration runs after it is
/// raised. The connection is always disconnected on exit.
pub struct ProcessingLoop {
    conn: DbConnection,
    commands: CommandReceiver,
    cancel: CancellationToken,
    interval: Duration,
}

impl ProcessingLoop {
    pub fn new(
        conn: DbConnection,
        commands: CommandReceiver,
        cancel: CancellationToken,
        interval: Duration,
    ) -> Self {
        Self {
            conn,
            commands,
            cancel,
            interval,
        }
    }

    pub fn run(mut self) -> LoopExit {
        let mut iterations = 0u64;
        let mut issued = 0u64;

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.conn.frame_tick() {
                warn!(target: "tablesync::processing", error = %e, "frame tick failed");
            }
            for command in self.commands.drain() {
                if self.execute(&command) {
                    issued += 1;
                }
            }
            iterations += 1;
            thread::sleep(self.interval);
        }

        info!(target: "tablesync::processing", iterations, commands = issued, "processing loop stopped");
        self.conn.disconnect();
        LoopExit {
            connection: self.conn,
            iterations,
            commands: issued,
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<LoopExit>> {
        let handle = thread::Builder::new()
            .name("tablesync-processing".into())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn execute(&mut self, command: &Command) -> bool {
        let result = match command.name.as_str() {
            NAME_COMMAND => self.conn.set_user_name(command.args.clone()),
            other => {
                warn!(target: "tablesync::processing", command = other, "unknown command dropped");
                return false;
            }
        };
        match result {
            Ok(request) => {
                debug!(target: "tablesync::processing", command = %command.name, request = request.0, "command issued");
                true
            }
            Err(e) => {
                warn!(target: "tablesync::processing", command = %command.name, error = %e, "command not issued");
                false
            }
        }
    }
}
