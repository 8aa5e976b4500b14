//! Live-subscriber broadcast hub
//!
//! A single dispatch task owns every subscriber list; workers publish over a
//! channel instead of calling subscriber code from their own task. A failed
//! delivery removes that subscriber without affecting others or the caller.
//! If the dispatch task is gone, publishes are silently dropped; ring
//! buffers still serve late subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use el_core::types::{Event, JobId, RunId};

/// Event stream a subscriber can attach to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Job(JobId),
    Run(RunId),
}

/// A live attachment to a job's or run's event stream.
///
/// `backlog` holds the ring buffer snapshot followed by the current status;
/// callers replay it before consuming `rx`.
pub struct Subscription {
    pub id: u64,
    pub backlog: Vec<Event>,
    pub rx: mpsc::UnboundedReceiver<Event>,
}

enum HubCommand {
    Publish {
        target: Target,
        event: Event,
    },
    Attach {
        target: Target,
        id: u64,
        tx: mpsc::UnboundedSender<Event>,
    },
    Detach {
        target: Target,
        id: u64,
    },
    Remove {
        target: Target,
    },
}

/// Handle to the dispatch task
pub struct EventHub {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_id: AtomicU64,
}

impl EventHub {
    /// Spawn the dispatch task and return its handle.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Best-effort fan-out of `event` to the target's subscribers.
    pub(crate) fn publish(&self, target: Target, event: Event) {
        let _ = self.tx.send(HubCommand::Publish { target, event });
    }

    /// Register a new subscriber, returning its id and live receiver.
    pub(crate) fn attach(&self, target: Target) -> (u64, mpsc::UnboundedReceiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(HubCommand::Attach { target, id, tx });
        (id, rx)
    }

    /// Drop one subscriber.
    pub fn detach(&self, target: Target, id: u64) {
        let _ = self.tx.send(HubCommand::Detach { target, id });
    }

    /// Drop every subscriber of a target (record evicted or removed).
    pub(crate) fn remove_target(&self, target: Target) {
        let _ = self.tx.send(HubCommand::Remove { target });
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut subscribers: HashMap<Target, Vec<(u64, mpsc::UnboundedSender<Event>)>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Publish { target, event } => {
                let drained = match subscribers.get_mut(&target) {
                    Some(list) => {
                        list.retain(|(id, tx)| {
                            if tx.send(event.clone()).is_ok() {
                                true
                            } else {
                                tracing::debug!("Dropping dead subscriber {} of {:?}", id, target);
                                false
                            }
                        });
                        list.is_empty()
                    }
                    None => false,
                };
                if drained {
                    subscribers.remove(&target);
                }
            }
            HubCommand::Attach { target, id, tx } => {
                subscribers.entry(target).or_default().push((id, tx));
            }
            HubCommand::Detach { target, id } => {
                let drained = match subscribers.get_mut(&target) {
                    Some(list) => {
                        list.retain(|(sub_id, _)| *sub_id != id);
                        list.is_empty()
                    }
                    None => false,
                };
                if drained {
                    subscribers.remove(&target);
                }
            }
            HubCommand::Remove { target } => {
                subscribers.remove(&target);
            }
        }
    }
}
