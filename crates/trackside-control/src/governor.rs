//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Async driver that runs a throttle against a command sink."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use trackside_proto::{Ack, Command};

use crate::throttle::{Outcome, Throttle, ThrottlePolicy};
use crate::ControlError;

/// Destination for commands released by a [`Governor`].
#[async_trait]
pub trait CommandSink: Send + Sync + 'static {
    /// Write one command to the device.
    async fn send(&self, command: Command) -> Result<(), ControlError>;
}

#[derive(Debug)]
enum Input {
    Submit(Command),
    Preempt(Command),
    Ack(bool),
    CancelPending,
    Reset,
    Shutdown,
}

/// Owns one throttled command stream. Acknowledgements are routed in with
/// [`Governor::observe_ack`]; every transition is broadcast as an [`Outcome`].
pub struct Governor {
    name: &'static str,
    tx: mpsc::UnboundedSender<Input>,
    outcomes: broadcast::Sender<Outcome<Command>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor").field("name", &self.name).finish()
    }
}

impl Governor {
    /// Spawn a governor for commands named `name` (e.g. `"pid"`).
    pub fn spawn(name: &'static str, policy: ThrottlePolicy, sink: Arc<dyn CommandSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(64);
        let task = tokio::spawn(run(name, Throttle::new(policy), sink, rx, outcomes.clone()));
        Self {
            name,
            tx,
            outcomes,
            task: Mutex::new(Some(task)),
        }
    }

    /// Command name this governor tracks.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue an edit; it replaces any edit not yet transmitted.
    pub fn submit(&self, command: Command) -> Result<(), ControlError> {
        self.send(Input::Submit(command))
    }

    /// Feed an acknowledgement. Returns `true` when it was for this stream.
    pub fn observe_ack(&self, ack: &Ack) -> bool {
        if ack.cmd != self.name {
            return false;
        }
        self.send(Input::Ack(ack.ok)).is_ok()
    }

    /// Discard any pending edit and write `command` in its place. The task
    /// does both in one step, so no flush of the dropped edit can follow.
    pub fn preempt(&self, command: Command) -> Result<(), ControlError> {
        self.send(Input::Preempt(command))
    }

    /// Discard a pending edit that has not gone out yet.
    pub fn cancel_pending(&self) -> Result<(), ControlError> {
        self.send(Input::CancelPending)
    }

    /// Drop all state, used when the link closes.
    pub fn reset(&self) -> Result<(), ControlError> {
        self.send(Input::Reset)
    }

    /// Receive every outcome from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Outcome<Command>> {
        self.outcomes.subscribe()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, input: Input) -> Result<(), ControlError> {
        self.tx.send(input).map_err(|_| ControlError::ChannelClosed)
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Outcome<Command> {
    /// Error form of a terminal failure.
    pub fn as_error(&self) -> Option<ControlError> {
        match self {
            Outcome::Exhausted { command, attempts } => Some(ControlError::CommandTimeout {
                cmd: command.name().to_string(),
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

async fn run(
    name: &'static str,
    mut throttle: Throttle<Command>,
    sink: Arc<dyn CommandSink>,
    mut rx: mpsc::UnboundedReceiver<Input>,
    outcomes: broadcast::Sender<Outcome<Command>>,
) {
    loop {
        let deadline = throttle.next_deadline();
        let produced = tokio::select! {
            biased;
            input = rx.recv() => {
                let now = Instant::now();
                match input {
                    Some(Input::Submit(command)) => throttle.submit(now, command),
                    Some(Input::Preempt(command)) => throttle.preempt(now, command),
                    Some(Input::Ack(ok)) => throttle.on_ack(now, ok),
                    Some(Input::CancelPending) => {
                        throttle.cancel_pending();
                        Vec::new()
                    }
                    Some(Input::Reset) => {
                        throttle.reset();
                        Vec::new()
                    }
                    Some(Input::Shutdown) | None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                throttle.on_timer(Instant::now())
            }
        };

        for outcome in produced {
            match &outcome {
                Outcome::Sent { command, attempt } => {
                    debug!(stream = name, attempt, "transmitting command");
                    if let Err(err) = sink.send(command.clone()).await {
                        warn!(stream = name, error = %err, "command sink rejected write");
                    }
                }
                Outcome::Rejected { attempt, .. } => {
                    debug!(stream = name, attempt, "device rejected command");
                }
                Outcome::TimedOut { attempt, .. } => {
                    debug!(stream = name, attempt, "acknowledgement timed out");
                }
                Outcome::Exhausted { attempts, .. } => {
                    warn!(stream = name, attempts, "giving up on command");
                }
                Outcome::Acknowledged { .. } => {}
            }
            let _ = outcomes.send(outcome);
        }
    }
    debug!(stream = name, "governor stopped");
}
