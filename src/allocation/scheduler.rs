use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use util::Conn;

use super::allocation_manager::Manager;
use super::five_tuple::FiveTuple;

/// A moment the [`Manager`] has to act on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Deadline {
    /// End of life of allocation `id`, registered under `five_tuple`.
    Allocation { five_tuple: FiveTuple, id: u64 },
    /// Expiry of reservation `id`, registered under `token`.
    Reservation { token: String, id: u64 },
    /// End of the claim window of a waiting connection id.
    ConnectionClaim(u32),
}

pub(crate) enum Command {
    /// Arms `Deadline` to fire after the given delay, re-arming it when it is
    /// already pending.
    Schedule(Deadline, Duration),
    Cancel(Deadline),
    /// A stream relay accepted a permitted peer connection.
    PeerAccepted {
        five_tuple: FiveTuple,
        allocation_id: u64,
        peer: SocketAddr,
        conn: Arc<dyn Conn + Send + Sync>,
    },
    /// A bound peer connection stopped relaying.
    ConnectionClosed(u32),
}

/// Handle used by the manager, its allocations and their peer connections to
/// reach the manager's event loop.
#[derive(Clone)]
pub(crate) struct Scheduler {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Scheduler { command_tx }, command_rx)
    }

    pub(crate) fn schedule(&self, deadline: Deadline, after: Duration) {
        self.send(Command::Schedule(deadline, after));
    }

    pub(crate) fn cancel(&self, deadline: Deadline) {
        self.send(Command::Cancel(deadline));
    }

    pub(crate) fn send(&self, command: Command) {
        if self.command_tx.send(command).is_err() {
            log::trace!("allocation manager has stopped, dropping command");
        }
    }
}

/// Runs the manager's event loop: a single timer wheel holding every pending
/// [`Deadline`], plus the commands coming from relay tasks. Expired deadlines
/// and relay commands are handled on their own tasks, so a slow notification
/// consumer never holds the wheel back.
pub(crate) async fn run(
    manager: Weak<Manager>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    close_notify: CancellationToken,
) {
    let mut queue: DelayQueue<Deadline> = DelayQueue::new();
    let mut keys: HashMap<Deadline, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            _ = close_notify.cancelled() => break,
            command = command_rx.recv() => {
                let command = match command {
                    Some(command) => command,
                    None => break,
                };

                match command {
                    Command::Schedule(deadline, after) => {
                        if let Some(key) = keys.get(&deadline) {
                            queue.reset(key, after);
                        } else {
                            let key = queue.insert(deadline.clone(), after);
                            keys.insert(deadline, key);
                        }
                    }
                    Command::Cancel(deadline) => {
                        if let Some(key) = keys.remove(&deadline) {
                            queue.remove(&key);
                        }
                    }
                    command => match manager.upgrade() {
                        Some(m) => {
                            tokio::spawn(async move { m.handle_command(command).await });
                        }
                        None => break,
                    },
                }
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let deadline = expired.into_inner();
                keys.remove(&deadline);

                match manager.upgrade() {
                    Some(m) => {
                        tokio::spawn(async move { m.on_deadline(deadline).await });
                    }
                    None => break,
                }
            }
        }
    }

    log::trace!("allocation manager event loop stopped");
}
