#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

//! Launch remote agent runs and follow them to completion.
//!
//! [`RunController`] starts (or attaches to) one run, follows its live event
//! stream, falls back to polling `GET /runs/{id}` when the stream drops, and
//! publishes a single ordered [`RunSnapshot`] to observers.

pub mod cancel;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
mod poll;
pub mod schedule;
mod source;
pub mod status;
mod stream;
pub mod transcript;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
mod testing;

pub use cancel::{CancelOutcome, CancellationCoordinator};
pub use client::{DEFAULT_LIST_LIMIT, RunApiClient};
pub use config::{ConfigError, MonitorConfig};
pub use controller::{ControllerOptions, RunController, SubscriptionId};
pub use error::{MonitorError, format_http_error};
pub use schedule::{ScheduledTask, TickControl};
pub use status::{CoarseStatus, ConnectionState};
pub use transcript::{Applied, Reconciler, Transcript};
pub use transport::{EventByteStream, RunTransport};
pub use types::{
    EVENT_KIND_ERROR, EVENT_KIND_LOG, EVENT_KIND_STATUS, EVENT_KIND_USER_PROMPT, LaunchResponse,
    RunEvent, RunId, RunKind, RunMeta, RunRequest, RunSnapshot, RunSnapshotPayload, RunSummary,
};
pub use wire::{MAX_RECORD_BYTES, WireCodec};
