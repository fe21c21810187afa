use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::MonitorError;
use crate::status::{CoarseStatus, ConnectionState};

pub const EVENT_KIND_STATUS: &str = "status";
pub const EVENT_KIND_USER_PROMPT: &str = "user_prompt";
pub const EVENT_KIND_LOG: &str = "log";
pub const EVENT_KIND_ERROR: &str = "error";

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Remote-assigned run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(raw: impl Into<String>) -> Result<Self, MonitorError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MonitorError::protocol("empty run id"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Single,
    Iterative,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub kind: RunKind,
    pub instruction: String,
    pub executor_name: String,
    pub working_dir: Option<String>,
    /// Only sent for iterative runs.
    pub max_retries: Option<u32>,
    pub dry_run: bool,
}

impl RunRequest {
    #[must_use]
    pub fn single(instruction: impl Into<String>, executor_name: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Single,
            instruction: instruction.into(),
            executor_name: executor_name.into(),
            working_dir: None,
            max_retries: None,
            dry_run: false,
        }
    }

    #[must_use]
    pub fn iterative(
        task: impl Into<String>,
        executor_name: impl Into<String>,
        max_retries: Option<u32>,
    ) -> Self {
        Self {
            kind: RunKind::Iterative,
            instruction: task.into(),
            executor_name: executor_name.into(),
            working_dir: None,
            max_retries,
            dry_run: false,
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Body of `POST /run`.
#[derive(Debug, Serialize)]
pub struct SingleRunBody<'a> {
    pub prompt: &'a str,
    pub executor: &'a str,
    pub workdir: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    pub dry_run: bool,
}

/// Body of `POST /loop`.
#[derive(Debug, Serialize)]
pub struct LoopRunBody<'a> {
    pub task: &'a str,
    pub executor: &'a str,
    pub max_retries: u32,
    pub workdir: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    pub dry_run: bool,
}

impl<'a> From<&'a RunRequest> for SingleRunBody<'a> {
    fn from(request: &'a RunRequest) -> Self {
        Self {
            prompt: request.instruction.as_str(),
            executor: request.executor_name.as_str(),
            workdir: request.working_dir.as_deref(),
            dry_run: request.dry_run,
        }
    }
}

impl<'a> From<&'a RunRequest> for LoopRunBody<'a> {
    fn from(request: &'a RunRequest) -> Self {
        Self {
            task: request.instruction.as_str(),
            executor: request.executor_name.as_str(),
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            workdir: request.working_dir.as_deref(),
            dry_run: request.dry_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchResponse {
    pub run_id: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type", default, deserialize_with = "deserialize_text")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub message: String,
    #[serde(rename = "ts", default, deserialize_with = "deserialize_text")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RunEvent {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp: timestamp.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_status(&self) -> bool {
        self.kind == EVENT_KIND_STATUS
    }

    pub fn is_user_prompt(&self) -> bool {
        self.kind == EVENT_KIND_USER_PROMPT
    }

    /// De-duplication key; timestamps are deliberately not part of it.
    pub fn same_entry(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RunMeta {
    #[serde(default, deserialize_with = "deserialize_text")]
    pub status: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RunMeta {
    /// The original instruction text, whichever run kind carried it.
    pub fn instruction(&self) -> Option<&str> {
        [self.prompt.as_deref(), self.task.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    pub fn coarse_status(&self) -> CoarseStatus {
        CoarseStatus::from_phase_name(&self.status)
    }
}

/// Body of `GET /runs/{id}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunSnapshotPayload {
    pub run_id: String,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub meta: RunMeta,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub events: Vec<RunEvent>,
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub result: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub error: Option<String>,
}

impl RunSnapshotPayload {
    pub fn coarse_status(&self) -> CoarseStatus {
        self.meta.coarse_status()
    }
}

/// Observer-facing view of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Option<RunId>,
    pub status: CoarseStatus,
    pub connection: ConnectionState,
    pub transcript: Vec<RunEvent>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            run_id: None,
            status: CoarseStatus::Idle,
            connection: ConnectionState::Disconnected,
            transcript: Vec::new(),
            result: None,
            error: None,
        }
    }
}

/// One row of `GET /runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub status: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl RunSummary {
    pub fn coarse_status(&self) -> CoarseStatus {
        CoarseStatus::from_phase_name(&self.status)
    }
}

/// `GET /runs` answers with either a bare array or `{ "runs": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RunSummaryList {
    Bare(Vec<RunSummary>),
    Wrapped { runs: Vec<RunSummary> },
}

impl RunSummaryList {
    pub(crate) fn into_runs(self) -> Vec<RunSummary> {
        match self {
            Self::Bare(runs) | Self::Wrapped { runs } => runs,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// Text field that also accepts `null` (as empty) and non-string values.
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_optional_text(deserializer).map(Option::unwrap_or_default)
}

fn deserialize_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
