//! Cancellation requests.
//!
//! The remote acknowledgement is not awaited past the request itself: the run
//! only counts as cancelled once the stream or a poll reports it.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::MonitorError;
use crate::transport::RunTransport;
use crate::types::RunId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The remote accepted the request.
    Requested,
    /// The request failed; the run keeps going.
    Ignored(MonitorError),
}

impl CancelOutcome {
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

#[derive(Clone)]
pub struct CancellationCoordinator {
    transport: Arc<dyn RunTransport>,
}

impl CancellationCoordinator {
    pub fn new(transport: Arc<dyn RunTransport>) -> Self {
        Self { transport }
    }

    pub async fn request_cancel(&self, run_id: &RunId) -> CancelOutcome {
        match self.transport.cancel(run_id).await {
            Ok(()) => {
                info!(run_id = %run_id, "run cancellation requested");
                CancelOutcome::Requested
            }
            Err(error) => {
                warn!(run_id = %run_id, error = %error, "run cancellation request failed");
                CancelOutcome::Ignored(MonitorError::CancellationIgnored {
                    message: error.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn accepted_request_is_reported() {
        let transport = Arc::new(ScriptedTransport::default());
        let coordinator = CancellationCoordinator::new(transport.clone());

        let outcome = coordinator
            .request_cancel(&RunId::new("r-9").expect("run id"))
            .await;
        assert!(outcome.is_requested());
        assert_eq!(transport.calls(), vec!["cancel:r-9".to_string()]);
    }

    #[tokio::test]
    async fn failed_request_is_swallowed_as_ignored() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_cancel(MonitorError::connection("refused"));
        let coordinator = CancellationCoordinator::new(transport);

        let outcome = coordinator
            .request_cancel(&RunId::new("r-9").expect("run id"))
            .await;
        match outcome {
            CancelOutcome::Ignored(MonitorError::CancellationIgnored { message }) => {
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
