//! Scripted transport shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::error::MonitorError;
use crate::transport::{EventByteStream, RunTransport};
use crate::types::{LaunchResponse, RunId, RunRequest, RunSnapshotPayload};

pub(crate) fn sse_record(kind: &str, message: &str, ts: &str) -> Vec<u8> {
    let payload = json!({"type": kind, "message": message, "ts": ts});
    format!("data: {payload}\n\n").into_bytes()
}

pub(crate) fn snapshot_payload(value: Value) -> RunSnapshotPayload {
    serde_json::from_value(value).expect("snapshot payload")
}

pub(crate) type StreamFeed = futures::channel::mpsc::UnboundedSender<Result<Vec<u8>, MonitorError>>;

pub(crate) struct ScriptedStream {
    body: EventByteStream,
}

impl ScriptedStream {
    /// Delivers the chunks, then the remote closes the connection.
    pub(crate) fn closing(chunks: Vec<Result<Vec<u8>, MonitorError>>) -> Self {
        Self {
            body: Box::pin(futures::stream::iter(chunks)),
        }
    }

    /// Delivers the chunks, then never sends anything again.
    pub(crate) fn open_ended(chunks: Vec<Result<Vec<u8>, MonitorError>>) -> Self {
        Self {
            body: Box::pin(futures::stream::iter(chunks).chain(futures::stream::pending())),
        }
    }

    /// Chunks are pushed by the test through the returned feed; dropping the
    /// feed closes the stream.
    pub(crate) fn live() -> (Self, StreamFeed) {
        let (feed, body) = futures::channel::mpsc::unbounded();
        (
            Self {
                body: Box::pin(body),
            },
            feed,
        )
    }
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    launch: Mutex<Option<Result<LaunchResponse, MonitorError>>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    snapshots: Mutex<VecDeque<Result<RunSnapshotPayload, MonitorError>>>,
    cancel_result: Mutex<Option<MonitorError>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn launch_ok(&self, run_id: &str) {
        *self.launch.lock().expect("launch script") = Some(Ok(LaunchResponse {
            run_id: run_id.to_string(),
            status: "running".to_string(),
        }));
    }

    pub(crate) fn launch_err(&self, error: MonitorError) {
        *self.launch.lock().expect("launch script") = Some(Err(error));
    }

    pub(crate) fn push_stream(&self, stream: ScriptedStream) {
        self.streams.lock().expect("stream script").push_back(stream);
    }

    /// Snapshots are served in order; the last one repeats.
    pub(crate) fn push_snapshot(&self, snapshot: Result<RunSnapshotPayload, MonitorError>) {
        self.snapshots
            .lock()
            .expect("snapshot script")
            .push_back(snapshot);
    }

    pub(crate) fn fail_cancel(&self, error: MonitorError) {
        *self.cancel_result.lock().expect("cancel script") = Some(error);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

#[async_trait]
impl RunTransport for ScriptedTransport {
    async fn launch(&self, request: &RunRequest) -> Result<LaunchResponse, MonitorError> {
        self.record(format!("launch:{}", request.instruction));
        self.launch
            .lock()
            .expect("launch script")
            .clone()
            .unwrap_or_else(|| Err(MonitorError::connection("no launch scripted")))
    }

    async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshotPayload, MonitorError> {
        self.record(format!("snapshot:{run_id}"));
        let mut snapshots = self.snapshots.lock().expect("snapshot script");
        if snapshots.len() > 1 {
            return snapshots
                .pop_front()
                .unwrap_or_else(|| Err(MonitorError::connection("no snapshot scripted")));
        }
        snapshots
            .front()
            .cloned()
            .unwrap_or_else(|| Err(MonitorError::connection("no snapshot scripted")))
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), MonitorError> {
        self.record(format!("cancel:{run_id}"));
        match self.cancel_result.lock().expect("cancel script").clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn open_stream(&self, run_id: &RunId) -> Result<EventByteStream, MonitorError> {
        self.record(format!("stream:{run_id}"));
        let Some(script) = self.streams.lock().expect("stream script").pop_front() else {
            return Err(MonitorError::connection("stream unavailable"));
        };
        Ok(script.body)
    }
}
