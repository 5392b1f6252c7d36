//! Maps resolution outcomes and marking events to notification intents.
//!
//! Nothing here sends anything. Intents are handed to the outbox, and the
//! host application's transport delivers them.

use crate::grade::GradeLabel;
use crate::lifecycle::MarkerRole;
use crate::resolve::ResolutionOutcome;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateKind {
    Negotiate1Supervisor,
    Negotiate2Supervisor,
    Negotiate2Reader,
    NegotiationCoordinator,
    MarkingSubmitted,
    MarkingComplete,
    NegotiationResolved,
    Moderation,
    MarkingOverdue,
    NegotiationOverdue,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negotiate1Supervisor => "NEGOTIATE1_SUPERVISOR",
            Self::Negotiate2Supervisor => "NEGOTIATE2_SUPERVISOR",
            Self::Negotiate2Reader => "NEGOTIATE2_READER",
            Self::NegotiationCoordinator => "NEGOTIATION_COORDINATOR",
            Self::MarkingSubmitted => "MARKING_SUBMITTED",
            Self::MarkingComplete => "MARKING_COMPLETE",
            Self::NegotiationResolved => "NEGOTIATION_RESOLVED",
            Self::Moderation => "MODERATION",
            Self::MarkingOverdue => "MARKING_OVERDUE",
            Self::NegotiationOverdue => "NEGOTIATION_OVERDUE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationIntent {
    pub kind: TemplateKind,
    pub recipients: Vec<Contact>,
    pub data: serde_json::Value,
    /// Stable identity of the event; repeated evaluations produce the same key.
    #[serde(skip)]
    pub dedup_scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionDigest {
    pub id: String,
    pub title: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreLine {
    pub criterion_id: String,
    pub grade: Option<GradeLabel>,
    pub justification: String,
}

/// One marker's final submission as the negotiation templates show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDigest {
    pub role: MarkerRole,
    pub marker_id: String,
    pub grade: Option<GradeLabel>,
    pub final_comment: String,
    pub recommendation: bool,
    pub criterion_scores: Vec<ScoreLine>,
}

/// Everything the templates need to know about one student's case in one unit.
#[derive(Debug, Clone)]
pub struct CaseContext {
    pub student_id: String,
    pub student_name: String,
    pub project_id: String,
    pub project_title: String,
    pub unit_id: String,
    pub unit_title: String,
    pub supervisor: Contact,
    pub reader: Option<Contact>,
    pub supervisor_grade: Option<GradeLabel>,
    pub reader_grade: Option<GradeLabel>,
    pub deadline: Option<String>,
    /// Filled only for intents that ask a human to compare the two markings.
    pub submissions: Vec<SubmissionDigest>,
    pub criteria: Vec<CriterionDigest>,
}

impl CaseContext {
    fn base_data(&self) -> serde_json::Value {
        json!({
            "student": { "id": self.student_id, "name": self.student_name },
            "project": { "id": self.project_id, "title": self.project_title },
            "unit": { "id": self.unit_id, "title": self.unit_title },
            "supervisor": self.supervisor,
            "reader": self.reader,
            "supervisorGrade": self.supervisor_grade,
            "readerGrade": self.reader_grade,
            "deadline": self.deadline,
        })
    }

    fn review_data(&self) -> serde_json::Value {
        with_fields(
            self.base_data(),
            json!({ "submissions": self.submissions, "criteria": self.criteria }),
        )
    }

    fn scope(&self, kind: TemplateKind, extra: &str) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            kind.as_str(),
            self.student_id,
            self.unit_id,
            self.supervisor_grade.map(|g| g.as_str()).unwrap_or("-"),
            self.reader_grade.map(|g| g.as_str()).unwrap_or("-"),
            extra
        )
    }

    fn intent(
        &self,
        kind: TemplateKind,
        recipients: Vec<Contact>,
        data: serde_json::Value,
        extra: &str,
    ) -> NotificationIntent {
        NotificationIntent {
            kind,
            recipients,
            data,
            dedup_scope: self.scope(kind, extra),
        }
    }
}

fn with_fields(mut data: serde_json::Value, fields: serde_json::Value) -> serde_json::Value {
    if let (Some(obj), Some(extra)) = (data.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    data
}

/// Escalation intents for a resolution outcome. The coordinator, when
/// configured, gets a summary of every escalation.
pub fn dispatch(
    outcome: &ResolutionOutcome,
    ctx: &CaseContext,
    coordinator: Option<&Contact>,
) -> Vec<NotificationIntent> {
    let (level, mut out) = match outcome {
        ResolutionOutcome::AutoResolved { .. } | ResolutionOutcome::Insufficient => {
            return Vec::new()
        }
        ResolutionOutcome::Negotiate1 => {
            let data = with_fields(
                ctx.review_data(),
                json!({
                    "instruction": "Contact the reader, agree a grade, and submit the resolution."
                }),
            );
            (
                1,
                vec![ctx.intent(
                    TemplateKind::Negotiate1Supervisor,
                    vec![ctx.supervisor.clone()],
                    data,
                    &ctx.supervisor.id,
                )],
            )
        }
        ResolutionOutcome::Negotiate2 => {
            let mut out = vec![ctx.intent(
                TemplateKind::Negotiate2Supervisor,
                vec![ctx.supervisor.clone()],
                with_fields(
                    ctx.review_data(),
                    json!({
                        "instruction": "Negotiate with the reader and submit the agreed outcome."
                    }),
                ),
                &ctx.supervisor.id,
            )];
            if let Some(reader) = &ctx.reader {
                out.push(ctx.intent(
                    TemplateKind::Negotiate2Reader,
                    vec![reader.clone()],
                    with_fields(
                        ctx.review_data(),
                        json!({
                            "instruction": "Negotiate with the supervisor, who will submit the agreed outcome."
                        }),
                    ),
                    &reader.id,
                ));
            }
            (2, out)
        }
    };
    if let Some(c) = coordinator {
        out.push(ctx.intent(
            TemplateKind::NegotiationCoordinator,
            vec![c.clone()],
            with_fields(ctx.base_data(), json!({ "negotiationLevel": level })),
            &format!("{}:{}", c.id, level),
        ));
    }
    out
}

/// Receipt for a final submission, to the marker and the coordinator.
pub fn marking_submitted(
    ctx: &CaseContext,
    marker: &Contact,
    grade: GradeLabel,
    coordinator: Option<&Contact>,
) -> NotificationIntent {
    let mut recipients = vec![marker.clone()];
    recipients.extend(coordinator.cloned());
    ctx.intent(
        TemplateKind::MarkingSubmitted,
        recipients,
        with_fields(
            ctx.base_data(),
            json!({ "marker": marker, "grade": grade }),
        ),
        &format!("{}:{}", marker.id, grade),
    )
}

fn markers_and_coordinator(ctx: &CaseContext, coordinator: Option<&Contact>) -> Vec<Contact> {
    let mut recipients = vec![ctx.supervisor.clone()];
    recipients.extend(ctx.reader.clone());
    recipients.extend(coordinator.cloned());
    recipients
}

pub fn marking_complete(
    ctx: &CaseContext,
    grade: GradeLabel,
    coordinator: Option<&Contact>,
) -> NotificationIntent {
    ctx.intent(
        TemplateKind::MarkingComplete,
        markers_and_coordinator(ctx, coordinator),
        with_fields(ctx.base_data(), json!({ "grade": grade })),
        grade.as_str(),
    )
}

pub fn negotiation_resolved(
    ctx: &CaseContext,
    grade: GradeLabel,
    coordinator: Option<&Contact>,
) -> NotificationIntent {
    ctx.intent(
        TemplateKind::NegotiationResolved,
        markers_and_coordinator(ctx, coordinator),
        with_fields(ctx.base_data(), json!({ "grade": grade })),
        grade.as_str(),
    )
}

/// A negotiated grade that tripped the boundary guard goes to the coordinator
/// together with both markings it was negotiated from.
pub fn moderation(
    ctx: &CaseContext,
    negotiated: GradeLabel,
    justification: &str,
    coordinator: &Contact,
) -> NotificationIntent {
    ctx.intent(
        TemplateKind::Moderation,
        vec![coordinator.clone()],
        with_fields(
            ctx.review_data(),
            json!({
                "negotiationResult": { "grade": negotiated, "justification": justification }
            }),
        ),
        negotiated.as_str(),
    )
}

/// Reminder to a marker who has not submitted by the unit's marker deadline.
/// One per marker per deadline.
pub fn marking_overdue(
    ctx: &CaseContext,
    marker: &Contact,
    role: MarkerRole,
    deadline: &str,
) -> NotificationIntent {
    ctx.intent(
        TemplateKind::MarkingOverdue,
        vec![marker.clone()],
        with_fields(ctx.base_data(), json!({ "role": role, "markerDeadline": deadline })),
        &format!("{}:{}", marker.id, deadline),
    )
}

/// Reminders to both markers once an escalated case passes its deadline.
pub fn negotiation_overdue(ctx: &CaseContext, deadline: &str) -> Vec<NotificationIntent> {
    let mut markers = vec![(MarkerRole::Supervisor, ctx.supervisor.clone())];
    if let Some(r) = &ctx.reader {
        markers.push((MarkerRole::Reader, r.clone()));
    }
    markers
        .into_iter()
        .map(|(role, marker)| {
            let extra = format!("{}:{}", marker.id, deadline);
            ctx.intent(
                TemplateKind::NegotiationOverdue,
                vec![marker],
                with_fields(ctx.base_data(), json!({ "role": role })),
                &extra,
            )
        })
        .collect()
}
