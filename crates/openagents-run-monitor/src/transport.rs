use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::MonitorError;
use crate::types::{LaunchResponse, RunId, RunRequest, RunSnapshotPayload};

/// Raw body chunks of a live run stream, in receive order.
pub type EventByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, MonitorError>> + Send>>;

/// The remote operations the monitor depends on.
///
/// [`crate::RunApiClient`] is the HTTP implementation; the controller only sees
/// this trait so it can be driven by scripted transports as well.
#[async_trait]
pub trait RunTransport: Send + Sync {
    async fn launch(&self, request: &RunRequest) -> Result<LaunchResponse, MonitorError>;

    async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshotPayload, MonitorError>;

    async fn cancel(&self, run_id: &RunId) -> Result<(), MonitorError>;

    async fn open_stream(&self, run_id: &RunId) -> Result<EventByteStream, MonitorError>;
}
