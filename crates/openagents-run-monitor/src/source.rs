//! Messages from the active event source to the controller's monitor task.

use tokio::sync::{mpsc, oneshot};

use crate::types::{RunEvent, RunSnapshotPayload};

#[derive(Debug)]
pub(crate) enum SourceSignal {
    /// One decoded stream event.
    Event(RunEvent),
    /// The stream stopped; sent at most once per connection.
    StreamFailed { reason: String },
    /// Full-state replacement from a poll tick.
    Snapshot(Box<RunSnapshotPayload>),
    /// The poll loop saw a terminal status and stopped its timer.
    PollTerminal,
}

#[derive(Debug)]
pub(crate) enum ControlCommand {
    MarkCancelling { ack: oneshot::Sender<bool> },
    Shutdown,
}

/// Everything the monitor task consumes arrives through one channel.
#[derive(Debug)]
pub(crate) enum MonitorInput {
    Source { generation: u64, signal: SourceSignal },
    Control(ControlCommand),
}

/// Sending half handed to a source, tagged with the source's generation so
/// signals from a retired source can be told apart.
#[derive(Debug, Clone)]
pub(crate) struct SignalSink {
    generation: u64,
    tx: mpsc::Sender<MonitorInput>,
}

impl SignalSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<MonitorInput>) -> Self {
        Self { generation, tx }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the monitor has gone away.
    pub(crate) async fn send(&self, signal: SourceSignal) -> bool {
        self.tx
            .send(MonitorInput::Source {
                generation: self.generation,
                signal,
            })
            .await
            .is_ok()
    }
}
