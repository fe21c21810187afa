//! Coarse run status and connection state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseStatus {
    Idle,
    Initiating,
    Planning,
    Executing,
    Reviewing,
    Auditing,
    Running,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl CoarseStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reviewing => "reviewing",
            Self::Auditing => "auditing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// One of the sub-phases a run moves freely between while it works.
    #[must_use]
    pub const fn is_phase(self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Executing | Self::Reviewing | Self::Auditing | Self::Running
        )
    }

    /// Maps a remote status name (a `status` event message or `meta.status`).
    ///
    /// Only the first word counts, case-insensitively, so "Planning..." and
    /// "planning step 2" both land on `Planning`. Unknown names are `Running`.
    #[must_use]
    pub fn from_phase_name(raw: &str) -> Self {
        let word = raw
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .to_ascii_lowercase();
        match word.as_str() {
            "idle" => Self::Idle,
            "initiating" | "queued" | "pending" | "starting" | "created" => Self::Initiating,
            "planning" => Self::Planning,
            "executing" => Self::Executing,
            "reviewing" => Self::Reviewing,
            "auditing" => Self::Auditing,
            "completed" | "complete" | "succeeded" | "success" | "done" => Self::Completed,
            "failed" | "error" | "errored" => Self::Failed,
            "cancelling" | "canceling" => Self::Cancelling,
            "cancelled" | "canceled" | "aborted" => Self::Cancelled,
            _ => Self::Running,
        }
    }

    /// Next status after observing `observed` from the remote side.
    ///
    /// Terminal states absorb everything. Cancelling holds until a terminal
    /// status arrives. Nothing moves a started run back to Idle or Initiating.
    #[must_use]
    pub fn advance(self, observed: Self) -> Self {
        if self.is_terminal() {
            return self;
        }
        if observed.is_terminal() {
            return observed;
        }
        if self == Self::Cancelling {
            return self;
        }
        match observed {
            Self::Idle => self,
            Self::Initiating => {
                if self == Self::Idle {
                    Self::Initiating
                } else {
                    self
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for CoarseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which source currently feeds the monitor. Owned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Streaming,
    Polling,
    Closed,
}

impl ConnectionState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Streaming => "streaming",
            Self::Polling => "polling",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Streaming | Self::Polling)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
