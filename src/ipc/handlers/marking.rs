use crate::config::{self, EngineConfig};
use crate::ipc::helpers::{get_required_str, parse_params, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::marking::{self, ResolutionInput, SubmissionInput};
use rusqlite::Connection;
use serde_json::json;

fn engine_config(conn: &Connection) -> Result<EngineConfig, HandlerErr> {
    config::load(conn).map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn case_key(params: &serde_json::Value) -> Result<(String, String), HandlerErr> {
    Ok((
        get_required_str(params, "studentId")?,
        get_required_str(params, "unitId")?,
    ))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("serialize_failed", e.to_string()))
}

fn save_draft(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input: SubmissionInput = parse_params(params)?;
    let saved = marking::save_draft(conn, &input)?;
    to_value(&saved)
}

fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input: SubmissionInput = parse_params(params)?;
    let cfg = engine_config(conn)?;
    let result = marking::submit(conn, &cfg, &input)?;
    to_value(&result)
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let marker_id = get_required_str(params, "markerId")?;
    let (student_id, unit_id) = case_key(params)?;
    let unit = marking::load_unit(conn, &unit_id)?;
    let criteria = marking::load_criteria(conn, &unit_id)?;
    let submission = marking::load_submission(conn, &marker_id, &student_id, &unit_id)?;
    Ok(json!({
        "unitId": unit.id,
        "unitTitle": unit.title,
        "weight": unit.weight,
        "open": unit.open,
        "criteria": criteria,
        "submission": submission,
    }))
}

fn status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, unit_id) = case_key(params)?;
    let cfg = engine_config(conn)?;
    let status = marking::case_status(conn, &cfg, &student_id, &unit_id)?;
    to_value(&status)
}

fn evaluate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (student_id, unit_id) = case_key(params)?;
    let cfg = engine_config(conn)?;
    let evaluation = marking::evaluate(conn, &cfg, &student_id, &unit_id)?;
    to_value(&evaluation)
}

fn resolve(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input: ResolutionInput = parse_params(params)?;
    let cfg = engine_config(conn)?;
    let result = marking::resolve_negotiation(conn, &cfg, &input)?;
    to_value(&result)
}

fn reopen(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let marker_id = get_required_str(params, "markerId")?;
    let (student_id, unit_id) = case_key(params)?;
    marking::reopen(conn, &marker_id, &student_id, &unit_id)?;
    Ok(json!({ "ok": true }))
}

fn discard_draft(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let marker_id = get_required_str(params, "markerId")?;
    let (student_id, unit_id) = case_key(params)?;
    marking::discard_draft(conn, &marker_id, &student_id, &unit_id)?;
    Ok(json!({ "ok": true }))
}

/// `now` defaults to the wall clock; callers pass it to replay a reminder run.
fn remind_overdue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let now = match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => chrono::DateTime::parse_from_rfc3339(raw)
            .map_err(|_| HandlerErr::bad_params("now must be an RFC 3339 timestamp"))?
            .with_timezone(&chrono::Utc),
        None => chrono::Utc::now(),
    };
    let cfg = engine_config(conn)?;
    let report = marking::remind_overdue(conn, &cfg, now)?;
    to_value(&report)
}

fn final_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    marking::load_allocation(conn, &student_id)?;
    let overall = marking::rollup_final_grade(conn, &student_id)?;
    Ok(json!({ "studentId": student_id, "overall": to_value(&overall)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marking.saveDraft" => Some(with_conn(state, req, save_draft)),
        "marking.submit" => Some(with_conn(state, req, submit)),
        "marking.get" => Some(with_conn(state, req, get)),
        "marking.status" => Some(with_conn(state, req, status)),
        "marking.evaluate" => Some(with_conn(state, req, evaluate)),
        "marking.resolve" => Some(with_conn(state, req, resolve)),
        "marking.reopen" => Some(with_conn(state, req, reopen)),
        "marking.discardDraft" => Some(with_conn(state, req, discard_draft)),
        "marking.remindOverdue" => Some(with_conn(state, req, remind_overdue)),
        "marking.finalGrade" => Some(with_conn(state, req, final_grade)),
        _ => None,
    }
}
