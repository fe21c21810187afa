//! Monitor error taxonomy.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("run_monitor_base_url_missing")]
    BaseUrlMissing,
    #[error("run_monitor_invalid_path")]
    InvalidPath,
    /// Transport unreachable, connect/read failure, or remote hang-up.
    #[error("run_monitor_connection_failed:{message}")]
    Connection { message: String },
    /// 401/403 from the remote, kept apart from connectivity failures.
    #[error("run_monitor_unauthorized_{status}:{body}")]
    Unauthorized { status: StatusCode, body: String },
    /// Malformed record, payload, or response body.
    #[error("run_monitor_protocol_error:{message}")]
    Protocol { message: String },
    /// Any other non-2xx response.
    #[error("run_monitor_http_{status}:{body}")]
    Remote { status: StatusCode, body: String },
    #[error("run_monitor_cancellation_ignored:{message}")]
    CancellationIgnored { message: String },
    #[error("run_monitor_invalid_state:{message}")]
    InvalidState { message: String },
    #[error("run_monitor_disposed")]
    Disposed,
}

impl MonitorError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Classifies a non-2xx response, splitting out authorization failures.
pub fn format_http_error(status: StatusCode, body: &[u8]) -> MonitorError {
    let body = non_empty_string(String::from_utf8_lossy(body).as_ref())
        .unwrap_or_else(|| "<empty>".to_string());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        MonitorError::Unauthorized { status, body }
    } else {
        MonitorError::Remote { status, body }
    }
}

fn non_empty_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
