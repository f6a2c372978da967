//! Command queue between the interactive thread and the processing loop.
//!
//! Any number of threads may enqueue; only the processing loop drains.
//! Commands come out in the order they went in.

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Rename the local user.
pub const NAME_COMMAND: &str = "name";

const NAME_PREFIX: &str = "/name ";

/// A pending request from the interactive thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: String,
}

impl Command {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }
}

/// Producer half. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    /// Enqueue without blocking. Returns false once the consumer is gone.
    pub fn enqueue(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
}

/// Consumer half, owned by the processing loop.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: Receiver<Command>,
}

impl CommandReceiver {
    /// Take every queued command, oldest first.
    pub fn drain(&self) -> Vec<Command> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn command_queue() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = unbounded();
    (CommandSender { tx }, CommandReceiver { rx })
}

/// Turn a line of console input into a command. Only `/name <text>` is
/// recognized; every other line yields `None`.
pub fn parse_input_line(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    line.strip_prefix(NAME_PREFIX)
        .map(|name| Command::new(NAME_COMMAND, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_drain_is_fifo_and_empties_queue() {
        let (tx, rx) = command_queue();
        assert!(tx.enqueue(Command::new("name", "Alice")));
        assert!(tx.enqueue(Command::new("name", "Bob")));
        assert_eq!(rx.len(), 2);

        let drained = rx.drain();
        assert_eq!(
            drained,
            vec![Command::new("name", "Alice"), Command::new("name", "Bob")]
        );
        assert!(rx.is_empty());
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let (tx, rx) = command_queue();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        tx.enqueue(Command::new("name", format!("{}-{}", p, i)));
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.extend(rx.drain());
            thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        seen.extend(rx.drain());
        assert_eq!(seen.len(), 1000);

        // Per-producer order survives interleaving.
        for p in 0..4 {
            let prefix = format!("{}-", p);
            let order: Vec<u32> = seen
                .iter()
                .filter_map(|c| c.args.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(order, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_enqueue_after_consumer_dropped() {
        let (tx, rx) = command_queue();
        drop(rx);
        assert!(!tx.enqueue(Command::new("name", "late")));
    }

    #[test]
    fn test_parse_input_line() {
        assert_eq!(
            parse_input_line("/name Alice Smith\n"),
            Some(Command::new("name", "Alice Smith"))
        );
        assert_eq!(parse_input_line("hello there"), None);
        assert_eq!(parse_input_line("/name"), None);
        assert_eq!(parse_input_line("/nick Bob"), None);
    }
}
