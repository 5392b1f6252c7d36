use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerRole {
    Supervisor,
    Reader,
}

impl MarkerRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supervisor" => Some(Self::Supervisor),
            "reader" => Some(Self::Reader),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Reader => "reader",
        }
    }
}

impl fmt::Display for MarkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per (student, unit, marker role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Closed,
    Open,
    Draft,
    Submitted,
}

impl SubmissionStatus {
    /// `submission_draft` is `None` when no submission row exists yet.
    pub fn compute(unit_open: bool, submission_draft: Option<bool>) -> Self {
        if !unit_open {
            return Self::Closed;
        }
        match submission_draft {
            None => Self::Open,
            Some(true) => Self::Draft,
            Some(false) => Self::Submitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("unit of assessment is closed for marking")]
    UnitClosed,
    #[error("submission is already final")]
    AlreadySubmitted,
    #[error("no draft to discard")]
    NoDraft,
}

impl LifecycleError {
    pub fn code(self) -> &'static str {
        match self {
            LifecycleError::UnitClosed => "unit_closed",
            LifecycleError::AlreadySubmitted => "already_submitted",
            LifecycleError::NoDraft => "no_draft",
        }
    }
}

/// Guard for a marker write. Drafts may be saved repeatedly; a final
/// submission is one-way for the marker.
pub fn check_marker_write(current: SubmissionStatus) -> Result<(), LifecycleError> {
    match current {
        SubmissionStatus::Closed => Err(LifecycleError::UnitClosed),
        SubmissionStatus::Submitted => Err(LifecycleError::AlreadySubmitted),
        SubmissionStatus::Open | SubmissionStatus::Draft => Ok(()),
    }
}

/// Discarding a draft returns the marker to OPEN. Only a draft qualifies.
pub fn check_discard(current: SubmissionStatus) -> Result<(), LifecycleError> {
    match current {
        SubmissionStatus::Draft => Ok(()),
        SubmissionStatus::Closed => Err(LifecycleError::UnitClosed),
        SubmissionStatus::Submitted => Err(LifecycleError::AlreadySubmitted),
        SubmissionStatus::Open => Err(LifecycleError::NoDraft),
    }
}

/// Resolution may only run when every required role has submitted.
pub fn ready_for_resolution(statuses: &[(MarkerRole, SubmissionStatus)]) -> bool {
    !statuses.is_empty()
        && statuses
            .iter()
            .all(|(_, s)| *s == SubmissionStatus::Submitted)
}
