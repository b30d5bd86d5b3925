use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::sink::AssetIdentity;
use crate::spec::GenerationSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Building,
    Sending,
    Decoding,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Building => 1,
            Self::Sending => 2,
            Self::Decoding => 3,
            Self::Committing => 4,
            Self::Completed | Self::Failed | Self::Cancelled => 5,
        }
    }

    /// Holding network or sink resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sending | Self::Decoding | Self::Committing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal, forward-only transition.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Completed => *self == Self::Committing,
            Self::Failed => true,
            // a commit in progress always runs to completion
            Self::Cancelled => *self != Self::Committing,
            _ => next.rank() == self.rank() + 1,
        }
    }

    pub fn icon(&self) -> &str {
        match self {
            Self::Created => "⏳",
            Self::Building => "🧱",
            Self::Sending => "📤",
            Self::Decoding => "🖼",
            Self::Committing => "💾",
            Self::Completed => "✅",
            Self::Failed => "❌",
            Self::Cancelled => "🚫",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Registry record for one request. Only the orchestrator mutates it.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: JobId,
    pub spec: GenerationSpec,
    pub slot: String,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<JobError>,
    pub asset: Option<AssetIdentity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, spec: GenerationSpec, slot: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            slot,
            state: JobState::Created,
            attempts: 0,
            error: None,
            asset: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if legal. Terminal jobs never change again.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            slot: self.slot.clone(),
            prompt: self.spec.prompt.clone(),
            state: self.state,
            attempts: self.attempts,
            error: self.error.clone(),
            asset: self.asset.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of a job handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub slot: String,
    pub prompt: String,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<JobError>,
    pub asset: Option<AssetIdentity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Broadcast on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub id: JobId,
    pub state: JobState,
    pub at: DateTime<Utc>,
}
