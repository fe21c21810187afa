//! Transcript reconciliation and status derivation.
//!
//! The stream feeds events one at a time and the poll fallback replaces
//! everything at once; both go through [`Reconciler`] so observers see a
//! single ordered transcript and one coarse status.

use chrono::{SecondsFormat, Utc};

use crate::status::CoarseStatus;
use crate::types::{EVENT_KIND_USER_PROMPT, RunEvent, RunSnapshotPayload};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    events: Vec<RunEvent>,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends a streamed event.
    ///
    /// A `user_prompt` identical (kind + message) to the head entry is the
    /// server echo of the locally synthesized prompt and is dropped.
    pub fn append(&mut self, event: RunEvent) -> bool {
        if event.is_user_prompt()
            && self
                .events
                .first()
                .is_some_and(|head| head.same_entry(&event))
        {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Puts the caller's instruction at the head as a `user_prompt` entry.
    pub fn seed_prompt(&mut self, instruction: &str, timestamp: impl Into<String>) -> bool {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return false;
        }
        let prompt = RunEvent::new(EVENT_KIND_USER_PROMPT, instruction, timestamp);
        if self.events.first().is_some_and(|head| head.same_entry(&prompt)) {
            return false;
        }
        self.events.insert(0, prompt);
        true
    }

    /// Replaces everything with a polled transcript.
    ///
    /// When the snapshot has no `user_prompt` entry but the instruction is
    /// known, one is prepended, stamped with the first real event's time.
    pub fn replace(&mut self, events: Vec<RunEvent>, instruction: Option<&str>) -> bool {
        let mut next = events;
        if let Some(instruction) = instruction.map(str::trim).filter(|text| !text.is_empty())
            && !next.iter().any(RunEvent::is_user_prompt)
        {
            let timestamp = next
                .first()
                .map(|event| event.timestamp.clone())
                .filter(|ts| !ts.is_empty())
                .unwrap_or_else(now_timestamp);
            next.insert(0, RunEvent::new(EVENT_KIND_USER_PROMPT, instruction, timestamp));
        }
        if next == self.events {
            return false;
        }
        self.events = next;
        true
    }

    pub fn into_events(self) -> Vec<RunEvent> {
        self.events
    }
}

/// What one reconciliation step changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    pub transcript_changed: bool,
    pub status_changed: bool,
    pub outcome_changed: bool,
}

impl Applied {
    pub fn any(self) -> bool {
        self.transcript_changed || self.status_changed || self.outcome_changed
    }
}

/// Transcript, coarse status, and outcome of one run.
#[derive(Debug, Clone)]
pub struct Reconciler {
    status: CoarseStatus,
    transcript: Transcript,
    instruction: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl Reconciler {
    #[must_use]
    pub fn new(instruction: Option<String>) -> Self {
        Self {
            status: CoarseStatus::Idle,
            transcript: Transcript::new(),
            instruction: instruction.filter(|text| !text.trim().is_empty()),
            result: None,
            error: None,
        }
    }

    pub fn status(&self) -> CoarseStatus {
        self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Local lifecycle step taken by the controller (launch, cancel request).
    pub fn set_local_status(&mut self, status: CoarseStatus) -> bool {
        if self.status == status || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = CoarseStatus::Failed;
        self.error = Some(message.into());
    }

    /// Seeds the local `user_prompt` entry from the launch instruction.
    pub fn seed_prompt(&mut self) -> bool {
        match self.instruction.clone() {
            Some(instruction) => self.transcript.seed_prompt(&instruction, now_timestamp()),
            None => false,
        }
    }

    /// Incremental (stream) reconciliation.
    pub fn apply_event(&mut self, event: RunEvent) -> Applied {
        let mut applied = Applied::default();
        if event.is_status() {
            let next = self
                .status
                .advance(CoarseStatus::from_phase_name(&event.message));
            if next != self.status {
                self.status = next;
                applied.status_changed = true;
            }
        }
        applied.transcript_changed = self.transcript.append(event);
        applied
    }

    /// Wholesale (poll) reconciliation.
    pub fn apply_snapshot(&mut self, snapshot: RunSnapshotPayload) -> Applied {
        let mut applied = Applied::default();
        let observed = snapshot.coarse_status();
        if self.instruction.is_none() {
            self.instruction = snapshot.meta.instruction().map(str::to_string);
        }

        let next = self.status.advance(observed);
        if next != self.status {
            self.status = next;
            applied.status_changed = true;
        }
        applied.transcript_changed = self
            .transcript
            .replace(snapshot.events, self.instruction.as_deref());
        applied.outcome_changed = self.merge_outcome(snapshot.result, snapshot.error);
        applied
    }

    /// Takes result/error from a snapshot without touching the transcript.
    pub fn apply_outcome(&mut self, snapshot: RunSnapshotPayload) -> Applied {
        let mut applied = Applied::default();
        let next = self.status.advance(snapshot.coarse_status());
        if next != self.status {
            self.status = next;
            applied.status_changed = true;
        }
        applied.outcome_changed = self.merge_outcome(snapshot.result, snapshot.error);
        applied
    }

    fn merge_outcome(&mut self, result: Option<String>, error: Option<String>) -> bool {
        let mut changed = false;
        if result.is_some() && result != self.result {
            self.result = result;
            changed = true;
        }
        if error.is_some() && error != self.error {
            self.error = error;
            changed = true;
        }
        changed
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
