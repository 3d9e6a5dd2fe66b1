//! Pending-request table owned by a single task.
//!
//! Outgoing requests register a correlation id and receive a oneshot for
//! the outcome. Replies and timeouts are both commands to the owner task, so
//! for every id exactly one of {reply, timeout} completes the caller.
//!
//! Ids handed out by [`Correlator::issue_id`] carry a per-table prefix, so a
//! reply to one of them is recognised as ours however late it arrives.
//! Other ids that timed out are remembered for a multiple of their timeout.

use courier_types::envelope::correlation_id;
use courier_types::{CourierError, CourierResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// An expired id is remembered for this many times its timeout.
const EXPIRED_RETENTION_FACTOR: u32 = 10;

/// Retention used when a timeout is too large to scale.
const MAX_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the owner task forgets expired ids past their retention.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to a reply handed to [`Correlator::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A pending request was waiting and has been completed.
    Resolved,
    /// The id belonged to a request that already timed out or was dropped.
    Late,
    /// The id is not ours.
    Unknown,
}

enum Command {
    Register {
        id: String,
        timeout: Duration,
        reply: oneshot::Sender<CourierResult<Value>>,
    },
    Complete {
        id: String,
        outcome: CourierResult<Value>,
        ack: oneshot::Sender<Completion>,
    },
    Expire {
        id: String,
        timeout: Duration,
    },
    Cancel {
        id: String,
    },
}

struct Pending {
    reply: oneshot::Sender<CourierResult<Value>>,
    timer: AbortHandle,
}

/// Handle to a pending-request table.
///
/// The owner task is spawned on first use and stops when the handle is
/// dropped and every outstanding timer has fired.
pub struct Correlator {
    prefix: String,
    seq: AtomicU64,
    tx: OnceLock<mpsc::UnboundedSender<Command>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self {
            prefix: correlation_id(),
            seq: AtomicU64::new(0),
            tx: OnceLock::new(),
        }
    }
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Command> {
        self.tx.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_owner(tx.clone(), rx));
            tx
        })
    }

    /// A fresh correlation id owned by this table.
    pub fn issue_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.prefix)
    }

    /// Whether `id` was handed out by [`Correlator::issue_id`].
    pub fn issued(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|seq| seq.parse::<u64>().is_ok())
    }

    /// Register `id` and return the receiver for its outcome. The receiver
    /// yields [`CourierError::Timeout`] when nothing completes it in time.
    pub fn register(
        &self,
        id: impl Into<String>,
        timeout: Duration,
    ) -> oneshot::Receiver<CourierResult<Value>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender().send(Command::Register {
            id: id.into(),
            timeout,
            reply,
        });
        rx
    }

    /// Complete `id` with `outcome`.
    pub async fn complete(&self, id: &str, outcome: CourierResult<Value>) -> Completion {
        let (ack, rx) = oneshot::channel();
        let sent = self.sender().send(Command::Complete {
            id: id.to_string(),
            outcome,
            ack,
        });
        let completion = match sent {
            Ok(()) => rx.await.unwrap_or(Completion::Unknown),
            Err(_) => Completion::Unknown,
        };
        match completion {
            Completion::Unknown if self.issued(id) => Completion::Late,
            other => other,
        }
    }

    /// Drop `id` without completing it, e.g. when the request could not be
    /// sent at all.
    pub fn cancel(&self, id: &str) {
        let _ = self.sender().send(Command::Cancel { id: id.to_string() });
    }

    /// Wait for the outcome registered under a receiver from
    /// [`Correlator::register`].
    pub async fn wait(rx: oneshot::Receiver<CourierResult<Value>>) -> CourierResult<Value> {
        rx.await.unwrap_or(Err(CourierError::ConnectionClosed))
    }
}

async fn run_owner(tx: mpsc::UnboundedSender<Command>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let weak = tx.downgrade();
    drop(tx);

    let mut pending: HashMap<String, Pending> = HashMap::new();
    // Expired id -> instant after which it is forgotten.
    let mut expired: HashMap<String, Instant> = HashMap::new();
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let command = tokio::select! {
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = prune.tick() => {
                let now = Instant::now();
                expired.retain(|_, forget_at| *forget_at > now);
                continue;
            }
        };

        match command {
            Command::Register { id, timeout, reply } => {
                let Some(timer_tx) = weak.upgrade() else {
                    break;
                };
                let timer_id = id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = timer_tx.send(Command::Expire {
                        id: timer_id,
                        timeout,
                    });
                })
                .abort_handle();
                expired.remove(&id);
                if let Some(previous) = pending.insert(id.clone(), Pending { reply, timer }) {
                    debug!(id = %id, "Correlation id reused, dropping earlier request");
                    previous.timer.abort();
                }
            }
            Command::Complete { id, outcome, ack } => {
                let completion = match pending.remove(&id) {
                    Some(entry) => {
                        entry.timer.abort();
                        let _ = entry.reply.send(outcome);
                        Completion::Resolved
                    }
                    None => match expired.get(&id) {
                        Some(forget_at) if *forget_at > Instant::now() => Completion::Late,
                        _ => Completion::Unknown,
                    },
                };
                let _ = ack.send(completion);
            }
            Command::Expire { id, timeout } => {
                if let Some(entry) = pending.remove(&id) {
                    debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    let _ = entry.reply.send(Err(CourierError::Timeout(timeout)));
                    let now = Instant::now();
                    let forget_at = now
                        .checked_add(timeout.saturating_mul(EXPIRED_RETENTION_FACTOR))
                        .unwrap_or(now + MAX_RETENTION);
                    expired.insert(id, forget_at);
                }
            }
            Command::Cancel { id } => {
                if let Some(entry) = pending.remove(&id) {
                    entry.timer.abort();
                }
            }
        }
    }

    for (_, entry) in pending.drain() {
        entry.timer.abort();
    }
}
