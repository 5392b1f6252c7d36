use crate::aggregate::{compute_from_scores, AggregateError, WeightedScore};
use crate::config::EngineConfig;
use crate::dispatch::{
    self, CaseContext, Contact, CriterionDigest, NotificationIntent, ScoreLine, SubmissionDigest,
};
use crate::grade::{self, GradeError, GradeLabel, Letter};
use crate::lifecycle::{
    check_discard, check_marker_write, ready_for_resolution, LifecycleError, MarkerRole,
    SubmissionStatus,
};
use crate::outbox;
use crate::resolve::{self, ResolutionOutcome};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

pub const AUTO_RESOLVED_COMMENT: &str = "Auto-resolved";

#[derive(Debug, Clone, Serialize)]
pub struct MarkingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl MarkingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<rusqlite::Error> for MarkingError {
    fn from(e: rusqlite::Error) -> Self {
        MarkingError::new("db_query_failed", e.to_string())
    }
}

impl From<GradeError> for MarkingError {
    fn from(e: GradeError) -> Self {
        MarkingError::new(e.code(), e.to_string())
    }
}

impl From<LifecycleError> for MarkingError {
    fn from(e: LifecycleError) -> Self {
        MarkingError::new(e.code(), e.to_string())
    }
}

impl From<AggregateError> for MarkingError {
    fn from(e: AggregateError) -> Self {
        MarkingError::new("degenerate_rubric", e.to_string())
    }
}

fn outbox_err(e: anyhow::Error) -> MarkingError {
    MarkingError::new("db_insert_failed", e.to_string())
        .with_details(json!({ "table": "notification_outbox" }))
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub id: String,
    pub title: String,
    pub weight: f64,
    pub open: bool,
    pub allowed_roles: Vec<MarkerRole>,
}

pub fn parse_allowed_roles(raw: &str) -> Vec<MarkerRole> {
    let mut roles = Vec::new();
    for part in raw.split(',') {
        match MarkerRole::parse(part) {
            Some(r) if !roles.contains(&r) => roles.push(r),
            Some(_) => {}
            None => tracing::warn!(role = part, "ignoring unknown marker role"),
        }
    }
    roles
}

pub fn load_unit(conn: &Connection, unit_id: &str) -> Result<Unit, MarkingError> {
    let row: Option<(String, f64, i64, String)> = conn
        .query_row(
            "SELECT title, weight, is_open, allowed_roles FROM units WHERE id = ?",
            [unit_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((title, weight, is_open, roles)) = row else {
        return Err(MarkingError::new("not_found", "unit of assessment not found")
            .with_details(json!({ "unitId": unit_id })));
    };
    Ok(Unit {
        id: unit_id.to_string(),
        title,
        weight,
        open: is_open != 0,
        allowed_roles: parse_allowed_roles(&roles),
    })
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub student_id: String,
    pub student_name: String,
    pub project_id: String,
    pub project_title: String,
    pub supervisor: Contact,
    pub reader: Option<Contact>,
}

impl Allocation {
    pub fn role_of(&self, marker_id: &str) -> Option<MarkerRole> {
        if self.supervisor.id == marker_id {
            Some(MarkerRole::Supervisor)
        } else if self.reader.as_ref().map(|r| r.id == marker_id).unwrap_or(false) {
            Some(MarkerRole::Reader)
        } else {
            None
        }
    }

    pub fn marker_for(&self, role: MarkerRole) -> Option<&Contact> {
        match role {
            MarkerRole::Supervisor => Some(&self.supervisor),
            MarkerRole::Reader => self.reader.as_ref(),
        }
    }
}

pub fn load_allocation(conn: &Connection, student_id: &str) -> Result<Allocation, MarkingError> {
    let row = conn
        .query_row(
            "SELECT a.student_name, a.project_id, a.project_title,
                    s.id, s.name, s.email,
                    r.id, r.name, r.email
             FROM allocations a
             JOIN markers s ON s.id = a.supervisor_id
             LEFT JOIN markers r ON r.id = a.reader_id
             WHERE a.student_id = ?",
            [student_id],
            |r| {
                let reader_id: Option<String> = r.get(6)?;
                let reader = match reader_id {
                    Some(id) => Some(Contact {
                        id,
                        name: r.get(7)?,
                        email: r.get(8)?,
                    }),
                    None => None,
                };
                Ok(Allocation {
                    student_id: student_id.to_string(),
                    student_name: r.get(0)?,
                    project_id: r.get(1)?,
                    project_title: r.get(2)?,
                    supervisor: Contact {
                        id: r.get(3)?,
                        name: r.get(4)?,
                        email: r.get(5)?,
                    },
                    reader,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| {
        MarkingError::new("not_found", "student allocation not found")
            .with_details(json!({ "studentId": student_id }))
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub id: String,
    pub title: String,
    pub description: String,
    pub weight: f64,
}

pub fn load_criteria(conn: &Connection, unit_id: &str) -> Result<Vec<Criterion>, MarkingError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, weight
         FROM assessment_criteria
         WHERE unit_id = ?
         ORDER BY layout_index",
    )?;
    let rows = stmt
        .query_map([unit_id], |r| {
            Ok(Criterion {
                id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                weight: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub criterion_id: String,
    pub mark: i64,
    #[serde(default)]
    pub justification: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub marker_id: String,
    pub student_id: String,
    pub unit_id: String,
    pub marker_role: MarkerRole,
    /// Scale points; -1 while a draft has no computed grade.
    pub grade: i64,
    pub final_comment: String,
    pub recommendation: bool,
    pub draft: bool,
    pub updated_at: Option<String>,
    pub criterion_scores: Vec<CriterionScore>,
}

impl Submission {
    pub fn grade_label(&self) -> Option<GradeLabel> {
        GradeLabel::from_points(self.grade)
    }
}

pub fn load_submission(
    conn: &Connection,
    marker_id: &str,
    student_id: &str,
    unit_id: &str,
) -> Result<Option<Submission>, MarkingError> {
    let row: Option<(String, String, i64, String, i64, i64, Option<String>)> = conn
        .query_row(
            "SELECT id, marker_role, grade, final_comment, recommendation, draft, updated_at
             FROM marking_submissions
             WHERE marker_id = ? AND student_id = ? AND unit_id = ?",
            (marker_id, student_id, unit_id),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, role_raw, grade, final_comment, recommendation, draft, updated_at)) = row else {
        return Ok(None);
    };
    let Some(marker_role) = MarkerRole::parse(&role_raw) else {
        return Err(MarkingError::new("bad_state", "stored marker role is invalid")
            .with_details(json!({ "submissionId": id, "role": role_raw })));
    };

    let mut stmt = conn.prepare(
        "SELECT cs.criterion_id, cs.mark, cs.justification
         FROM criterion_scores cs
         JOIN assessment_criteria ac ON ac.id = cs.criterion_id
         WHERE cs.submission_id = ?
         ORDER BY ac.layout_index",
    )?;
    let criterion_scores = stmt
        .query_map([&id], |r| {
            Ok(CriterionScore {
                criterion_id: r.get(0)?,
                mark: r.get(1)?,
                justification: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Submission {
        id,
        marker_id: marker_id.to_string(),
        student_id: student_id.to_string(),
        unit_id: unit_id.to_string(),
        marker_role,
        grade,
        final_comment,
        recommendation: recommendation != 0,
        draft: draft != 0,
        updated_at,
        criterion_scores,
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionMarkInput {
    pub criterion_id: String,
    pub mark: f64,
    #[serde(default)]
    pub justification: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionInput {
    pub marker_id: String,
    pub student_id: String,
    pub unit_id: String,
    #[serde(default)]
    pub marks: Vec<CriterionMarkInput>,
    #[serde(default)]
    pub final_comment: String,
    #[serde(default)]
    pub recommendation: bool,
}

/// Criterion marks are scale points. A fractional mark is a hard error; an
/// integer off the scale is rejected as a bad parameter.
fn validate_marks(
    criteria: &[Criterion],
    marks: &[CriterionMarkInput],
    require_all: bool,
) -> Result<Vec<(CriterionScore, f64)>, MarkingError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(marks.len());
    for m in marks {
        let Some(criterion) = criteria.iter().find(|c| c.id == m.criterion_id) else {
            return Err(MarkingError::new("bad_params", "criterion does not belong to unit")
                .with_details(json!({ "criterionId": m.criterion_id })));
        };
        if !seen.insert(criterion.id.as_str()) {
            return Err(MarkingError::new("bad_params", "criterion scored twice")
                .with_details(json!({ "criterionId": m.criterion_id })));
        }
        let letter = grade::to_letter(m.mark)?;
        let Letter::Grade(g) = letter else {
            return Err(MarkingError::new("bad_params", "mark is outside the grade scale")
                .with_details(json!({ "criterionId": m.criterion_id, "mark": m.mark })));
        };
        out.push((
            CriterionScore {
                criterion_id: criterion.id.clone(),
                mark: g.points(),
                justification: m.justification.clone(),
            },
            criterion.weight,
        ));
    }
    if require_all {
        let missing: Vec<&str> = criteria
            .iter()
            .filter(|c| !seen.contains(c.id.as_str()))
            .map(|c| c.id.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(MarkingError::new("bad_params", "every criterion must be scored")
                .with_details(json!({ "missingCriterionIds": missing })));
        }
    }
    Ok(out)
}

struct WriteRequest<'a> {
    input: &'a SubmissionInput,
    role: MarkerRole,
    grade: i64,
    draft: bool,
    scores: &'a [CriterionScore],
}

/// Summary upsert plus delete-and-recreate of the criterion scores. The caller
/// owns the transaction.
fn write_submission(conn: &Connection, w: &WriteRequest<'_>) -> Result<String, MarkingError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO marking_submissions(
            id, marker_id, student_id, unit_id, marker_role, grade,
            final_comment, recommendation, draft, updated_at
         )
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(marker_id, student_id, unit_id) DO UPDATE SET
           marker_role = excluded.marker_role,
           grade = excluded.grade,
           final_comment = excluded.final_comment,
           recommendation = excluded.recommendation,
           draft = excluded.draft,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &w.input.marker_id,
            &w.input.student_id,
            &w.input.unit_id,
            w.role.as_str(),
            w.grade,
            &w.input.final_comment,
            w.input.recommendation as i64,
            w.draft as i64,
            &now,
        ),
    )
    .map_err(|e| {
        MarkingError::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "marking_submissions" }))
    })?;

    let submission_id: String = conn.query_row(
        "SELECT id FROM marking_submissions WHERE marker_id = ? AND student_id = ? AND unit_id = ?",
        (&w.input.marker_id, &w.input.student_id, &w.input.unit_id),
        |r| r.get(0),
    )?;

    conn.execute(
        "DELETE FROM criterion_scores WHERE submission_id = ?",
        [&submission_id],
    )
    .map_err(|e| {
        MarkingError::new("db_delete_failed", e.to_string())
            .with_details(json!({ "table": "criterion_scores" }))
    })?;
    for s in w.scores {
        conn.execute(
            "INSERT INTO criterion_scores(id, submission_id, criterion_id, mark, justification)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &submission_id,
                &s.criterion_id,
                s.mark,
                &s.justification,
            ),
        )
        .map_err(|e| {
            MarkingError::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "criterion_scores" }))
        })?;
    }
    Ok(submission_id)
}

fn require_role(
    unit: &Unit,
    alloc: &Allocation,
    marker_id: &str,
) -> Result<MarkerRole, MarkingError> {
    let Some(role) = alloc.role_of(marker_id) else {
        return Err(MarkingError::new("not_allowed", "marker is not assigned to this student")
            .with_details(json!({ "markerId": marker_id, "studentId": alloc.student_id })));
    };
    if !unit.allowed_roles.contains(&role) {
        return Err(MarkingError::new("not_allowed", "marker role does not mark this unit")
            .with_details(json!({ "role": role, "unitId": unit.id })));
    }
    Ok(role)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSubmission {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub grade: Option<GradeLabel>,
    pub mark: Option<i64>,
}

fn begin(conn: &Connection) -> Result<rusqlite::Transaction<'_>, MarkingError> {
    conn.unchecked_transaction()
        .map_err(|e| MarkingError::new("db_tx_failed", e.to_string()))
}

fn commit(tx: rusqlite::Transaction<'_>) -> Result<(), MarkingError> {
    tx.commit()
        .map_err(|e| MarkingError::new("db_commit_failed", e.to_string()))
}

/// Validates and writes one marker's submission. The caller owns the
/// transaction.
fn save_in(
    conn: &Connection,
    input: &SubmissionInput,
    draft: bool,
) -> Result<(SavedSubmission, MarkerRole), MarkingError> {
    let unit = load_unit(conn, &input.unit_id)?;
    let alloc = load_allocation(conn, &input.student_id)?;
    let role = require_role(&unit, &alloc, &input.marker_id)?;

    let existing = load_submission(conn, &input.marker_id, &input.student_id, &input.unit_id)?;
    let current = SubmissionStatus::compute(unit.open, existing.as_ref().map(|s| s.draft));
    check_marker_write(current)?;

    let criteria = load_criteria(conn, &unit.id)?;
    if criteria.is_empty() {
        return Err(MarkingError::new("degenerate_rubric", "unit has no assessment criteria")
            .with_details(json!({ "unitId": unit.id })));
    }
    let scored = validate_marks(&criteria, &input.marks, !draft)?;
    let scores: Vec<CriterionScore> = scored.iter().map(|(s, _)| s.clone()).collect();

    let (grade, mark) = if draft {
        (None, None)
    } else {
        let weighted: Vec<WeightedScore> = scored
            .iter()
            .map(|(s, w)| WeightedScore {
                score: s.mark as f64,
                weight: *w,
            })
            .collect();
        let mark = compute_from_scores(&weighted)?;
        let Letter::Grade(g) = grade::to_letter(mark as f64)? else {
            return Err(MarkingError::new("bad_state", "aggregated mark is outside the grade scale")
                .with_details(json!({ "mark": mark })));
        };
        (Some(g), Some(mark))
    };

    let submission_id = write_submission(
        conn,
        &WriteRequest {
            input,
            role,
            grade: mark.unwrap_or(-1),
            draft,
            scores: &scores,
        },
    )?;

    let status = if draft {
        SubmissionStatus::Draft
    } else {
        SubmissionStatus::Submitted
    };
    Ok((
        SavedSubmission {
            submission_id,
            status,
            grade,
            mark,
        },
        role,
    ))
}

fn log_saved(input: &SubmissionInput, role: MarkerRole, saved: &SavedSubmission) {
    tracing::info!(
        marker_id = %input.marker_id,
        student_id = %input.student_id,
        unit_id = %input.unit_id,
        role = %role,
        status = ?saved.status,
        grade = ?saved.grade,
        "marking submission saved"
    );
}

pub fn save_draft(
    conn: &Connection,
    input: &SubmissionInput,
) -> Result<SavedSubmission, MarkingError> {
    let tx = begin(conn)?;
    let (saved, role) = save_in(&tx, input, true)?;
    commit(tx)?;
    log_saved(input, role, &saved);
    Ok(saved)
}

/// Removes a marker's draft so the role starts again from OPEN. Final
/// submissions are not discarded; they go through `reopen`.
pub fn discard_draft(
    conn: &Connection,
    marker_id: &str,
    student_id: &str,
    unit_id: &str,
) -> Result<(), MarkingError> {
    let tx = begin(conn)?;
    let unit = load_unit(&tx, unit_id)?;
    let alloc = load_allocation(&tx, student_id)?;
    require_role(&unit, &alloc, marker_id)?;

    let existing = load_submission(&tx, marker_id, student_id, unit_id)?;
    check_discard(SubmissionStatus::compute(
        unit.open,
        existing.as_ref().map(|s| s.draft),
    ))?;
    let Some(draft) = existing else {
        return Err(LifecycleError::NoDraft.into());
    };

    tx.execute(
        "DELETE FROM criterion_scores WHERE submission_id = ?",
        [&draft.id],
    )
    .map_err(|e| {
        MarkingError::new("db_delete_failed", e.to_string())
            .with_details(json!({ "table": "criterion_scores" }))
    })?;
    tx.execute("DELETE FROM marking_submissions WHERE id = ?", [&draft.id])
        .map_err(|e| {
            MarkingError::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "marking_submissions" }))
        })?;
    commit(tx)?;
    tracing::info!(marker_id, student_id, unit_id, "draft discarded");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    #[serde(flatten)]
    pub saved: SavedSubmission,
    pub resolution: Evaluation,
}

/// Final submission, its receipt, and the evaluation it triggers commit
/// together or not at all.
pub fn submit(
    conn: &Connection,
    cfg: &EngineConfig,
    input: &SubmissionInput,
) -> Result<SubmitResult, MarkingError> {
    let tx = begin(conn)?;
    let (saved, role) = save_in(&tx, input, false)?;

    if let Some(g) = saved.grade {
        let unit = load_unit(&tx, &input.unit_id)?;
        let alloc = load_allocation(&tx, &input.student_id)?;
        if let Some(marker) = alloc.marker_for(role) {
            let ctx = case_context(&unit, &alloc, None, None, None);
            let intent = dispatch::marking_submitted(&ctx, marker, g, cfg.coordinator().as_ref());
            outbox::enqueue(&tx, &alloc.student_id, &unit.id, &intent).map_err(outbox_err)?;
        }
    }

    let resolution = evaluate_in(&tx, cfg, &input.student_id, &input.unit_id)?;
    commit(tx)?;
    log_saved(input, role, &saved);
    Ok(SubmitResult { saved, resolution })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleState {
    pub role: MarkerRole,
    pub marker_id: Option<String>,
    pub status: SubmissionStatus,
    pub grade: Option<GradeLabel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalUnitGrade {
    pub grade: GradeLabel,
    pub comment: String,
    pub resolved_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseStatus {
    pub student_id: String,
    pub unit_id: String,
    pub roles: Vec<RoleState>,
    pub outcome: ResolutionOutcome,
    pub final_grade: Option<FinalUnitGrade>,
}

struct Case {
    unit: Unit,
    alloc: Allocation,
    status: CaseStatus,
    surplus_submissions: bool,
}

impl Case {
    fn grade_for(&self, role: MarkerRole) -> Option<GradeLabel> {
        self.status
            .roles
            .iter()
            .find(|r| r.role == role)
            .and_then(|r| r.grade)
    }
}

fn load_final_unit_grade(
    conn: &Connection,
    student_id: &str,
    unit_id: &str,
) -> Result<Option<FinalUnitGrade>, MarkingError> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT grade, comment, resolved_at FROM final_unit_grades
             WHERE student_id = ? AND unit_id = ?",
            (student_id, unit_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(row.and_then(|(points, comment, resolved_at)| {
        GradeLabel::from_points(points).map(|grade| FinalUnitGrade {
            grade,
            comment,
            resolved_at,
        })
    }))
}

fn load_case(
    conn: &Connection,
    cfg: &EngineConfig,
    student_id: &str,
    unit_id: &str,
) -> Result<Case, MarkingError> {
    let unit = load_unit(conn, unit_id)?;
    let alloc = load_allocation(conn, student_id)?;

    let mut roles = Vec::with_capacity(unit.allowed_roles.len());
    for role in &unit.allowed_roles {
        let marker = alloc.marker_for(*role);
        let submission = match marker {
            Some(m) => load_submission(conn, &m.id, student_id, unit_id)?,
            None => None,
        };
        roles.push(RoleState {
            role: *role,
            marker_id: marker.map(|m| m.id.clone()),
            status: SubmissionStatus::compute(unit.open, submission.as_ref().map(|s| s.draft)),
            grade: submission
                .as_ref()
                .filter(|s| !s.draft)
                .and_then(|s| s.grade_label()),
        });
    }

    let final_submissions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM marking_submissions WHERE student_id = ? AND unit_id = ? AND draft = 0",
        (student_id, unit_id),
        |r| r.get(0),
    )?;
    let surplus_submissions = final_submissions > roles.len() as i64;

    let pairs: Vec<(MarkerRole, SubmissionStatus)> =
        roles.iter().map(|r| (r.role, r.status)).collect();
    let outcome = if surplus_submissions || !ready_for_resolution(&pairs) {
        ResolutionOutcome::Insufficient
    } else {
        let grade_for = |role: MarkerRole| {
            roles
                .iter()
                .find(|r| r.role == role)
                .and_then(|r| r.grade)
        };
        if roles.len() == 1 {
            // Single-marker units take the one grade as final.
            match roles[0].grade {
                Some(grade) => ResolutionOutcome::AutoResolved { grade },
                None => ResolutionOutcome::Insufficient,
            }
        } else {
            let outcome = resolve::auto_resolve(
                grade_for(MarkerRole::Supervisor),
                grade_for(MarkerRole::Reader),
            );
            if cfg.guard_auto_resolved {
                resolve::guard(outcome)
            } else {
                outcome
            }
        }
    };

    let final_grade = load_final_unit_grade(conn, student_id, unit_id)?;
    Ok(Case {
        status: CaseStatus {
            student_id: student_id.to_string(),
            unit_id: unit_id.to_string(),
            roles,
            outcome,
            final_grade,
        },
        unit,
        alloc,
        surplus_submissions,
    })
}

/// Side-effect free view of a case: each role's state and the recomputed outcome.
pub fn case_status(
    conn: &Connection,
    cfg: &EngineConfig,
    student_id: &str,
    unit_id: &str,
) -> Result<CaseStatus, MarkingError> {
    Ok(load_case(conn, cfg, student_id, unit_id)?.status)
}

fn case_context(
    unit: &Unit,
    alloc: &Allocation,
    supervisor_grade: Option<GradeLabel>,
    reader_grade: Option<GradeLabel>,
    deadline: Option<String>,
) -> CaseContext {
    CaseContext {
        student_id: alloc.student_id.clone(),
        student_name: alloc.student_name.clone(),
        project_id: alloc.project_id.clone(),
        project_title: alloc.project_title.clone(),
        unit_id: unit.id.clone(),
        unit_title: unit.title.clone(),
        supervisor: alloc.supervisor.clone(),
        reader: alloc.reader.clone(),
        supervisor_grade,
        reader_grade,
        deadline,
        submissions: Vec::new(),
        criteria: Vec::new(),
    }
}

/// Adds both final markings and the unit rubric, for the intents that ask a
/// person to weigh one marking against the other.
fn attach_review(
    conn: &Connection,
    ctx: &mut CaseContext,
    unit: &Unit,
    alloc: &Allocation,
) -> Result<(), MarkingError> {
    for role in &unit.allowed_roles {
        let Some(marker) = alloc.marker_for(*role) else {
            continue;
        };
        let Some(sub) = load_submission(conn, &marker.id, &alloc.student_id, &unit.id)? else {
            continue;
        };
        if sub.draft {
            continue;
        }
        ctx.submissions.push(SubmissionDigest {
            role: *role,
            marker_id: sub.marker_id.clone(),
            grade: sub.grade_label(),
            final_comment: sub.final_comment.clone(),
            recommendation: sub.recommendation,
            criterion_scores: sub
                .criterion_scores
                .iter()
                .map(|s| ScoreLine {
                    criterion_id: s.criterion_id.clone(),
                    grade: GradeLabel::from_points(s.mark),
                    justification: s.justification.clone(),
                })
                .collect(),
        });
    }
    ctx.criteria = load_criteria(conn, &unit.id)?
        .into_iter()
        .map(|c| CriterionDigest {
            id: c.id,
            title: c.title,
            description: c.description,
            weight: c.weight,
        })
        .collect();
    Ok(())
}

fn deadline_in_days(days: i64) -> String {
    (Utc::now() + chrono::Duration::days(days)).to_rfc3339()
}

/// Records an open negotiation and returns its deadline. The deadline is set
/// when the case first reaches a negotiation level and kept while it stays
/// there.
fn record_escalation(
    conn: &Connection,
    student_id: &str,
    unit_id: &str,
    outcome: &ResolutionOutcome,
    deadline_days: i64,
) -> Result<String, MarkingError> {
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT status, deadline FROM escalations WHERE student_id = ? AND unit_id = ?",
            (student_id, unit_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((status, deadline)) = existing {
        if status == outcome.status() {
            return Ok(deadline);
        }
    }
    let deadline = deadline_in_days(deadline_days);
    conn.execute(
        "INSERT INTO escalations(student_id, unit_id, status, deadline, created_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, unit_id) DO UPDATE SET
           status = excluded.status,
           deadline = excluded.deadline,
           created_at = excluded.created_at",
        (
            student_id,
            unit_id,
            outcome.status(),
            &deadline,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        MarkingError::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "escalations" }))
    })?;
    Ok(deadline)
}

fn clear_escalation(conn: &Connection, student_id: &str, unit_id: &str) -> Result<(), MarkingError> {
    conn.execute(
        "DELETE FROM escalations WHERE student_id = ? AND unit_id = ?",
        (student_id, unit_id),
    )
    .map_err(|e| {
        MarkingError::new("db_delete_failed", e.to_string())
            .with_details(json!({ "table": "escalations" }))
    })?;
    Ok(())
}

fn write_final_unit_grade(
    conn: &Connection,
    student_id: &str,
    unit_id: &str,
    grade: GradeLabel,
    comment: &str,
) -> Result<(), MarkingError> {
    conn.execute(
        "INSERT INTO final_unit_grades(unit_id, student_id, grade, comment, resolved_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(unit_id, student_id) DO UPDATE SET
           grade = excluded.grade,
           comment = excluded.comment,
           resolved_at = excluded.resolved_at",
        (
            unit_id,
            student_id,
            grade.points(),
            comment,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        MarkingError::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "final_unit_grades" }))
    })?;
    clear_escalation(conn, student_id, unit_id)?;
    tracing::info!(student_id, unit_id, %grade, comment, "unit grade finalized");
    Ok(())
}

/// The overall grade is derived data. A unit grade stays final even when the
/// roll-up cannot be computed yet.
fn refresh_overall(conn: &Connection, student_id: &str) {
    if let Err(e) = rollup_final_grade(conn, student_id) {
        tracing::warn!(
            student_id,
            code = %e.code,
            error = %e.message,
            "overall grade not computed"
        );
    }
}

fn enqueue_all(
    conn: &Connection,
    student_id: &str,
    unit_id: &str,
    intents: &[NotificationIntent],
) -> Result<usize, MarkingError> {
    let mut queued = 0;
    for intent in intents {
        if outbox::enqueue(conn, student_id, unit_id, intent).map_err(outbox_err)? {
            queued += 1;
        }
    }
    Ok(queued)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub outcome: ResolutionOutcome,
    pub final_grade: Option<GradeLabel>,
    pub notifications_queued: usize,
}

/// Re-run resolution for one student in one unit. Safe to call repeatedly:
/// a finalized case is left alone and escalations are queued once.
pub fn evaluate(
    conn: &Connection,
    cfg: &EngineConfig,
    student_id: &str,
    unit_id: &str,
) -> Result<Evaluation, MarkingError> {
    let tx = begin(conn)?;
    let evaluation = evaluate_in(&tx, cfg, student_id, unit_id)?;
    commit(tx)?;
    Ok(evaluation)
}

fn evaluate_in(
    conn: &Connection,
    cfg: &EngineConfig,
    student_id: &str,
    unit_id: &str,
) -> Result<Evaluation, MarkingError> {
    let case = load_case(conn, cfg, student_id, unit_id)?;
    let outcome = case.status.outcome;

    if case.surplus_submissions {
        tracing::error!(student_id, unit_id, "more final submissions than marker roles");
    }
    if let Some(existing) = &case.status.final_grade {
        return Ok(Evaluation {
            outcome,
            final_grade: Some(existing.grade),
            notifications_queued: 0,
        });
    }

    let supervisor_grade = case.grade_for(MarkerRole::Supervisor);
    let reader_grade = case.grade_for(MarkerRole::Reader);
    let coordinator = cfg.coordinator();

    match outcome {
        ResolutionOutcome::Insufficient => Ok(Evaluation {
            outcome,
            final_grade: None,
            notifications_queued: 0,
        }),
        ResolutionOutcome::AutoResolved { grade } => {
            write_final_unit_grade(conn, student_id, unit_id, grade, AUTO_RESOLVED_COMMENT)?;
            let ctx = case_context(&case.unit, &case.alloc, supervisor_grade, reader_grade, None);
            let intent = dispatch::marking_complete(&ctx, grade, coordinator.as_ref());
            let queued = enqueue_all(conn, student_id, unit_id, &[intent])?;
            refresh_overall(conn, student_id);
            Ok(Evaluation {
                outcome,
                final_grade: Some(grade),
                notifications_queued: queued,
            })
        }
        ResolutionOutcome::Negotiate1 | ResolutionOutcome::Negotiate2 => {
            let deadline = record_escalation(
                conn,
                student_id,
                unit_id,
                &outcome,
                cfg.negotiation_deadline_days,
            )?;
            let mut ctx = case_context(
                &case.unit,
                &case.alloc,
                supervisor_grade,
                reader_grade,
                Some(deadline),
            );
            attach_review(conn, &mut ctx, &case.unit, &case.alloc)?;
            let intents = dispatch::dispatch(&outcome, &ctx, coordinator.as_ref());
            let queued = enqueue_all(conn, student_id, unit_id, &intents)?;
            tracing::info!(student_id, unit_id, status = outcome.status(), queued, "grades escalated");
            Ok(Evaluation {
                outcome,
                final_grade: None,
                notifications_queued: queued,
            })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionInput {
    pub marker_id: String,
    pub student_id: String,
    pub unit_id: String,
    pub grade: f64,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub outcome: ResolutionOutcome,
    pub final_grade: Option<GradeLabel>,
    pub moderation_required: bool,
    pub notifications_queued: usize,
}

/// The supervisor's negotiated grade. Boundary grades are not finalized here;
/// they go to the coordinator for moderation.
pub fn resolve_negotiation(
    conn: &Connection,
    cfg: &EngineConfig,
    input: &ResolutionInput,
) -> Result<ResolutionResult, MarkingError> {
    let tx = begin(conn)?;
    let result = resolve_in(&tx, cfg, input)?;
    commit(tx)?;
    Ok(result)
}

fn resolve_in(
    conn: &Connection,
    cfg: &EngineConfig,
    input: &ResolutionInput,
) -> Result<ResolutionResult, MarkingError> {
    let case = load_case(conn, cfg, &input.student_id, &input.unit_id)?;
    if case.alloc.role_of(&input.marker_id) != Some(MarkerRole::Supervisor) {
        return Err(MarkingError::new("not_allowed", "only the supervisor submits a negotiated grade")
            .with_details(json!({ "markerId": input.marker_id })));
    }
    let pairs: Vec<(MarkerRole, SubmissionStatus)> =
        case.status.roles.iter().map(|r| (r.role, r.status)).collect();
    if !ready_for_resolution(&pairs) {
        return Err(MarkingError::new("not_ready", "both markers must submit before resolution")
            .with_details(json!({ "roles": case.status.roles })));
    }
    if case.status.final_grade.is_some() {
        return Err(MarkingError::new("already_resolved", "unit grade is already final"));
    }
    let comment = input.comment.trim();
    if comment.is_empty() {
        return Err(MarkingError::new("bad_params", "comment must not be empty"));
    }
    let Letter::Grade(negotiated) = grade::to_letter(input.grade)? else {
        return Err(MarkingError::new("bad_params", "grade is outside the grade scale")
            .with_details(json!({ "grade": input.grade })));
    };

    let supervisor_grade = case.grade_for(MarkerRole::Supervisor);
    let reader_grade = case.grade_for(MarkerRole::Reader);
    let coordinator = cfg.coordinator();

    match resolve::boundary_check(negotiated) {
        ResolutionOutcome::AutoResolved { grade } => {
            write_final_unit_grade(conn, &input.student_id, &input.unit_id, grade, comment)?;
            let ctx = case_context(&case.unit, &case.alloc, supervisor_grade, reader_grade, None);
            let intent = dispatch::negotiation_resolved(&ctx, grade, coordinator.as_ref());
            let queued = enqueue_all(conn, &input.student_id, &input.unit_id, &[intent])?;
            refresh_overall(conn, &input.student_id);
            Ok(ResolutionResult {
                outcome: ResolutionOutcome::AutoResolved { grade },
                final_grade: Some(grade),
                moderation_required: false,
                notifications_queued: queued,
            })
        }
        outcome => {
            let queued = match &coordinator {
                Some(c) => {
                    let mut ctx = case_context(
                        &case.unit,
                        &case.alloc,
                        supervisor_grade,
                        reader_grade,
                        Some(deadline_in_days(cfg.moderation_deadline_days)),
                    );
                    attach_review(conn, &mut ctx, &case.unit, &case.alloc)?;
                    let intent = dispatch::moderation(&ctx, negotiated, comment, c);
                    enqueue_all(conn, &input.student_id, &input.unit_id, &[intent])?
                }
                None => {
                    tracing::warn!(
                        student_id = %input.student_id,
                        unit_id = %input.unit_id,
                        "moderation required but no coordinator is configured"
                    );
                    0
                }
            };
            tracing::info!(
                student_id = %input.student_id,
                unit_id = %input.unit_id,
                %negotiated,
                "negotiated grade sent to moderation"
            );
            Ok(ResolutionResult {
                outcome,
                final_grade: None,
                moderation_required: true,
                notifications_queued: queued,
            })
        }
    }
}

/// Administrative override: return a final submission to draft and drop the
/// grades derived from it.
pub fn reopen(
    conn: &Connection,
    marker_id: &str,
    student_id: &str,
    unit_id: &str,
) -> Result<(), MarkingError> {
    let tx = begin(conn)?;
    let changed = tx
        .execute(
            "UPDATE marking_submissions SET draft = 1, updated_at = ?
             WHERE marker_id = ? AND student_id = ? AND unit_id = ? AND draft = 0",
            (Utc::now().to_rfc3339(), marker_id, student_id, unit_id),
        )
        .map_err(|e| MarkingError::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(MarkingError::new("not_found", "no final submission to reopen")
            .with_details(json!({ "markerId": marker_id, "studentId": student_id, "unitId": unit_id })));
    }
    tx.execute(
        "DELETE FROM final_unit_grades WHERE student_id = ? AND unit_id = ?",
        (student_id, unit_id),
    )
    .map_err(|e| MarkingError::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM final_grades WHERE student_id = ?", [student_id])
        .map_err(|e| MarkingError::new("db_delete_failed", e.to_string()))?;
    clear_escalation(&tx, student_id, unit_id)?;
    commit(tx)?;
    tracing::info!(marker_id, student_id, unit_id, "submission reopened by administrator");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallGrade {
    Marked {
        grade: GradeLabel,
        #[serde(rename = "computedAt")]
        computed_at: String,
    },
    Pending {
        #[serde(rename = "missingUnitIds")]
        missing_unit_ids: Vec<String>,
    },
}

/// Weighted roll-up of final unit grades, stored once every unit is final.
pub fn rollup_final_grade(
    conn: &Connection,
    student_id: &str,
) -> Result<OverallGrade, MarkingError> {
    let stored: Option<(i64, String)> = conn
        .query_row(
            "SELECT grade, computed_at FROM final_grades WHERE student_id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((points, computed_at)) = stored {
        if let Some(grade) = GradeLabel::from_points(points) {
            return Ok(OverallGrade::Marked { grade, computed_at });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT u.id, u.weight, f.grade
         FROM units u
         LEFT JOIN final_unit_grades f ON f.unit_id = u.id AND f.student_id = ?
         ORDER BY u.sort_order, u.id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, Option<i64>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let missing_unit_ids: Vec<String> = rows
        .iter()
        .filter(|(_, _, g)| g.is_none())
        .map(|(id, _, _)| id.clone())
        .collect();
    if rows.is_empty() || !missing_unit_ids.is_empty() {
        return Ok(OverallGrade::Pending { missing_unit_ids });
    }

    let weighted: Vec<WeightedScore> = rows
        .iter()
        .filter_map(|(_, weight, g)| {
            g.map(|points| WeightedScore {
                score: points as f64,
                weight: *weight,
            })
        })
        .collect();
    let mark = compute_from_scores(&weighted)?;
    let Letter::Grade(grade) = grade::to_letter(mark as f64)? else {
        return Err(MarkingError::new("bad_state", "overall mark is outside the grade scale")
            .with_details(json!({ "mark": mark })));
    };
    let computed_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO final_grades(student_id, grade, computed_at) VALUES(?, ?, ?)
         ON CONFLICT(student_id) DO NOTHING",
        (student_id, grade.points(), &computed_at),
    )
    .map_err(|e| {
        MarkingError::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "final_grades" }))
    })?;
    tracing::info!(student_id, %grade, "overall grade computed");
    Ok(OverallGrade::Marked { grade, computed_at })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueReport {
    pub marking_reminders: usize,
    pub negotiation_reminders: usize,
    pub notifications_queued: usize,
}

fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(deadline = raw, error = %e, "ignoring unparseable deadline");
            None
        }
    }
}

/// Queues reminders for markers who missed an open unit's marker deadline and
/// for negotiations that ran past theirs. Reminders already queued for the
/// same deadline are not queued again.
pub fn remind_overdue(
    conn: &Connection,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<OverdueReport, MarkingError> {
    let tx = begin(conn)?;
    let mut report = OverdueReport::default();

    let units: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT id, marker_deadline FROM units
             WHERE is_open = 1 AND marker_deadline IS NOT NULL
             ORDER BY sort_order, id",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let students: Vec<String> = {
        let mut stmt = tx.prepare("SELECT student_id FROM allocations ORDER BY student_id")?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (unit_id, raw_deadline) in &units {
        match parse_deadline(raw_deadline) {
            Some(deadline) if deadline < now => {}
            _ => continue,
        }
        let unit = load_unit(&tx, unit_id)?;
        for student_id in &students {
            let alloc = load_allocation(&tx, student_id)?;
            let ctx = case_context(&unit, &alloc, None, None, None);
            for role in &unit.allowed_roles {
                let Some(marker) = alloc.marker_for(*role) else {
                    continue;
                };
                let submitted = load_submission(&tx, &marker.id, student_id, unit_id)?
                    .map(|s| !s.draft)
                    .unwrap_or(false);
                if submitted {
                    continue;
                }
                report.marking_reminders += 1;
                let intent = dispatch::marking_overdue(&ctx, marker, *role, raw_deadline);
                report.notifications_queued += enqueue_all(&tx, student_id, unit_id, &[intent])?;
            }
        }
    }

    let escalations: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT e.student_id, e.unit_id, e.deadline
             FROM escalations e
             WHERE NOT EXISTS (
               SELECT 1 FROM final_unit_grades f
               WHERE f.student_id = e.student_id AND f.unit_id = e.unit_id
             )
             ORDER BY e.student_id, e.unit_id",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (student_id, unit_id, raw_deadline) in &escalations {
        match parse_deadline(raw_deadline) {
            Some(deadline) if deadline < now => {}
            _ => continue,
        }
        let case = load_case(&tx, cfg, student_id, unit_id)?;
        if !matches!(
            case.status.outcome,
            ResolutionOutcome::Negotiate1 | ResolutionOutcome::Negotiate2
        ) {
            continue;
        }
        let ctx = case_context(
            &case.unit,
            &case.alloc,
            case.grade_for(MarkerRole::Supervisor),
            case.grade_for(MarkerRole::Reader),
            Some(raw_deadline.clone()),
        );
        let intents = dispatch::negotiation_overdue(&ctx, raw_deadline);
        report.negotiation_reminders += intents.len();
        report.notifications_queued += enqueue_all(&tx, student_id, unit_id, &intents)?;
    }

    commit(tx)?;
    tracing::info!(
        marking = report.marking_reminders,
        negotiation = report.negotiation_reminders,
        queued = report.notifications_queued,
        "overdue reminders checked"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> Vec<Criterion> {
        vec![
            Criterion {
                id: "c1".into(),
                title: "Analysis".into(),
                description: String::new(),
                weight: 2.0,
            },
            Criterion {
                id: "c2".into(),
                title: "Writing".into(),
                description: String::new(),
                weight: 1.0,
            },
        ]
    }

    fn mark(id: &str, mark: f64) -> CriterionMarkInput {
        CriterionMarkInput {
            criterion_id: id.into(),
            mark,
            justification: String::new(),
        }
    }

    #[test]
    fn deadlines_compare_in_utc() {
        let a = parse_deadline("2026-06-01T17:00:00Z").expect("utc deadline");
        let b = parse_deadline("2026-06-01T18:30:00+01:00").expect("offset deadline");
        assert!(a < b);
        assert!(parse_deadline("next tuesday").is_none());
    }

    #[test]
    fn allowed_roles_parse_and_dedupe() {
        assert_eq!(
            parse_allowed_roles("supervisor, reader,supervisor"),
            vec![MarkerRole::Supervisor, MarkerRole::Reader]
        );
        assert_eq!(parse_allowed_roles("reader,moderator"), vec![MarkerRole::Reader]);
    }

    #[test]
    fn final_submission_needs_every_criterion() {
        let err = validate_marks(&criteria(), &[mark("c1", 17.0)], true).unwrap_err();
        assert_eq!(err.code, "bad_params");
        assert!(validate_marks(&criteria(), &[mark("c1", 17.0)], false).is_ok());
    }

    #[test]
    fn fractional_criterion_mark_is_a_format_error() {
        let err = validate_marks(&criteria(), &[mark("c1", 16.5)], false).unwrap_err();
        assert_eq!(err.code, "invalid_mark_format");
    }

    #[test]
    fn off_scale_and_foreign_marks_are_rejected() {
        let err = validate_marks(&criteria(), &[mark("c1", 30.0)], false).unwrap_err();
        assert_eq!(err.code, "bad_params");
        let err = validate_marks(&criteria(), &[mark("zz", 10.0)], false).unwrap_err();
        assert_eq!(err.code, "bad_params");
        let err =
            validate_marks(&criteria(), &[mark("c1", 10.0), mark("c1", 11.0)], false).unwrap_err();
        assert_eq!(err.code, "bad_params");
    }

    #[test]
    fn validated_marks_carry_criterion_weight() {
        let out = validate_marks(&criteria(), &[mark("c2", 12.0), mark("c1", 18.0)], true)
            .expect("valid marks");
        let weights: Vec<f64> = out.iter().map(|(_, w)| *w).collect();
        assert_eq!(weights, vec![1.0, 2.0]);
        assert_eq!(out[1].0.mark, 18);
    }
}
