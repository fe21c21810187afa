//! Snapshot polling used while the live stream is unavailable.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::schedule::{ScheduledTask, TickControl};
use crate::source::{SignalSink, SourceSignal};
use crate::transport::RunTransport;
use crate::types::RunId;

pub(crate) struct PollFallback;

impl PollFallback {
    /// Fetches `GET /runs/{id}` now and then every `interval`, emitting each
    /// snapshot wholesale. Stops on its own after a terminal snapshot; fetch
    /// errors are logged and the next tick tries again.
    pub(crate) fn start(
        transport: Arc<dyn RunTransport>,
        run_id: RunId,
        interval: Duration,
        sink: SignalSink,
    ) -> PollHandle {
        let task = ScheduledTask::spawn_repeating(interval, move || {
            let transport = Arc::clone(&transport);
            let run_id = run_id.clone();
            let sink = sink.clone();
            async move { poll_once(transport.as_ref(), &run_id, &sink).await }
        });
        PollHandle { task }
    }
}

async fn poll_once(transport: &dyn RunTransport, run_id: &RunId, sink: &SignalSink) -> TickControl {
    let snapshot = match transport.fetch_snapshot(run_id).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(run_id = %run_id, error = %error, "run snapshot poll failed");
            return TickControl::Continue;
        }
    };

    let status = snapshot.coarse_status();
    debug!(run_id = %run_id, status = %status, events = snapshot.events.len(), "run snapshot polled");
    if !sink.send(SourceSignal::Snapshot(Box::new(snapshot))).await {
        return TickControl::Stop;
    }
    if status.is_terminal() {
        let _ = sink.send(SourceSignal::PollTerminal).await;
        return TickControl::Stop;
    }
    TickControl::Continue
}

#[derive(Debug)]
pub(crate) struct PollHandle {
    task: ScheduledTask,
}

impl PollHandle {
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) async fn stop(&mut self) {
        self.task.cancel().await;
    }
}
