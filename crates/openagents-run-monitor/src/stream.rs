//! Live stream consumer for one run.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::source::{SignalSink, SourceSignal};
use crate::transport::RunTransport;
use crate::types::RunId;
use crate::wire::WireCodec;

pub(crate) struct StreamConsumer;

impl StreamConsumer {
    /// Connects and forwards decoded events to `sink` from a background task.
    ///
    /// Any read error, non-2xx response, or remote close ends the task after a
    /// single [`SourceSignal::StreamFailed`]. Retrying is the controller's call.
    pub(crate) fn open(transport: Arc<dyn RunTransport>, run_id: RunId, sink: SignalSink) -> StreamHandle {
        let task = tokio::spawn(async move {
            let Some(reason) = consume(transport.as_ref(), &run_id, &sink).await else {
                return;
            };
            warn!(run_id = %run_id, generation = sink.generation(), reason = %reason, "run stream failed");
            let _ = sink.send(SourceSignal::StreamFailed { reason }).await;
        });
        StreamHandle { task: Some(task) }
    }
}

/// Returns the failure reason, or `None` when the monitor stopped listening.
async fn consume(transport: &dyn RunTransport, run_id: &RunId, sink: &SignalSink) -> Option<String> {
    let mut body = match transport.open_stream(run_id).await {
        Ok(body) => body,
        Err(error) => return Some(error.to_string()),
    };
    let mut codec = WireCodec::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => return Some(error.to_string()),
        };
        for event in codec.feed(&chunk) {
            if !sink.send(SourceSignal::Event(event)).await {
                return None;
            }
        }
    }

    if let Some(event) = codec.finish()
        && !sink.send(SourceSignal::Event(event)).await
    {
        return None;
    }
    debug!(run_id = %run_id, discarded = codec.discarded(), "run stream ended by remote");
    Some("stream closed by remote".to_string())
}

#[derive(Debug)]
pub(crate) struct StreamHandle {
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the read and waits for the task to unwind. Safe to repeat.
    pub(crate) async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
