//! Stateless grade-scale and policy calls. None of these need a workspace.

use crate::aggregate::{compute_from_scores, WeightedScore};
use crate::grade::{self, GradeError, GradeLabel};
use crate::ipc::helpers::{get_required_f64, get_required_str, ok, parse_params, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use serde::Deserialize;
use serde_json::json;

fn grade_err(e: GradeError) -> HandlerErr {
    HandlerErr::new(e.code(), e.to_string())
}

fn parse_label(raw: &str) -> Result<GradeLabel, HandlerErr> {
    GradeLabel::parse(raw).ok_or_else(|| grade_err(GradeError::InvalidGrade(raw.to_string())))
}

/// Absent or null means "not submitted yet".
fn optional_label(params: &serde_json::Value, key: &str) -> Result<Option<GradeLabel>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be a grade label or null", key)));
            };
            parse_label(s).map(Some)
        }
    }
}

fn to_letter(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mark = get_required_f64(params, "mark")?;
    let letter = grade::to_letter(mark).map_err(grade_err)?;
    Ok(json!({
        "letter": letter.to_string(),
        "valid": letter.grade().is_some(),
    }))
}

/// Soft lookup: the label is taken verbatim and anything unknown maps to -1.
fn to_int(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(label) = params.get("label").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("label must be a string"));
    };
    Ok(json!({ "value": grade::to_int(label) }))
}

fn band(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let label = get_required_str(params, "label")?;
    let band = grade::get_band(&label).map_err(grade_err)?;
    Ok(json!({ "band": band.to_string(), "boundary": grade::is_boundary(&label) }))
}

fn average(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let a = parse_label(&get_required_str(params, "a")?)?;
    let b = parse_label(&get_required_str(params, "b")?)?;
    Ok(json!({
        "grade": grade::average(a, b),
        "sameBand": grade::same_band(a.as_str(), b.as_str()).map_err(grade_err)?,
    }))
}

#[derive(Deserialize)]
struct ScoresParams {
    scores: Vec<WeightedScore>,
}

fn compute(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let parsed: ScoresParams = parse_params(params)?;
    let mark = compute_from_scores(&parsed.scores)
        .map_err(|e| HandlerErr::new("degenerate_rubric", e.to_string()))?;
    let letter = grade::to_letter(mark as f64).map_err(grade_err)?;
    Ok(json!({ "mark": mark, "letter": letter.to_string() }))
}

fn auto_resolve(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let supervisor = optional_label(params, "supervisorGrade")?;
    let reader = optional_label(params, "readerGrade")?;
    let outcome = resolve::auto_resolve(supervisor, reader);
    Ok(json!(outcome))
}

fn boundary_check(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let g = parse_label(&get_required_str(params, "grade")?)?;
    Ok(json!(resolve::boundary_check(g)))
}

fn scale() -> serde_json::Value {
    let rows: Vec<serde_json::Value> = GradeLabel::all()
        .map(|g| json!({ "label": g, "value": g.points(), "band": g.band().to_string() }))
        .collect();
    json!({ "grades": rows })
}

fn respond<F>(req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    match f(&req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.scale" => Some(ok(&req.id, scale())),
        "grades.toLetter" => Some(respond(req, to_letter)),
        "grades.toInt" => Some(respond(req, to_int)),
        "grades.band" => Some(respond(req, band)),
        "grades.average" => Some(respond(req, average)),
        "grades.computeFromScores" => Some(respond(req, compute)),
        "grades.autoResolve" => Some(respond(req, auto_resolve)),
        "grades.boundaryCheck" => Some(respond(req, boundary_check)),
        _ => None,
    }
}
