use crate::grade::{average, GradeLabel};
use serde::{Deserialize, Serialize};

/// Recomputed from the two current submissions on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionOutcome {
    AutoResolved { grade: GradeLabel },
    /// Supervisor negotiates directly with the reader.
    Negotiate1,
    /// Gap too wide for peer negotiation alone; both markers are contacted.
    Negotiate2,
    /// One or both grades are missing. Not an error: retry once both exist.
    Insufficient,
}

impl ResolutionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ResolutionOutcome::AutoResolved { .. } => "AUTO_RESOLVED",
            ResolutionOutcome::Negotiate1 => "NEGOTIATE1",
            ResolutionOutcome::Negotiate2 => "NEGOTIATE2",
            ResolutionOutcome::Insufficient => "INSUFFICIENT",
        }
    }
}

pub fn auto_resolve(
    supervisor: Option<GradeLabel>,
    reader: Option<GradeLabel>,
) -> ResolutionOutcome {
    let (Some(supervisor), Some(reader)) = (supervisor, reader) else {
        return ResolutionOutcome::Insufficient;
    };

    let diff = (supervisor.points() - reader.points()).abs();
    if diff <= 1 {
        return ResolutionOutcome::AutoResolved { grade: supervisor };
    }
    if diff == 2 {
        // A two-step gap inside one band escalates; across bands it is split.
        if supervisor.band() == reader.band() {
            return ResolutionOutcome::Negotiate1;
        }
        return ResolutionOutcome::AutoResolved {
            grade: average(supervisor, reader),
        };
    }
    ResolutionOutcome::Negotiate2
}

/// Top and bottom grades always get a second human look.
pub fn boundary_check(grade: GradeLabel) -> ResolutionOutcome {
    if grade.is_boundary() {
        ResolutionOutcome::Negotiate2
    } else {
        ResolutionOutcome::AutoResolved { grade }
    }
}

/// Re-check an automatically resolved outcome before it is finalized.
pub fn guard(outcome: ResolutionOutcome) -> ResolutionOutcome {
    match outcome {
        ResolutionOutcome::AutoResolved { grade } => boundary_check(grade),
        other => other,
    }
}
