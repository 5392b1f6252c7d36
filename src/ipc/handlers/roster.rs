//! Minimal collaborator data the engine reads: marker identities, student
//! allocations, units of assessment and their rubrics.

use crate::ipc::helpers::{get_required_str, parse_params, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::MarkerRole;
use crate::marking::{self, parse_allowed_roles};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

fn markers_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must be an email address"));
    }
    conn.execute(
        "INSERT INTO markers(id, name, email) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
        (&id, &name, &email),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "markerId": id }))
}

fn marker_exists(conn: &Connection, id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM markers WHERE id = ?", [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocationParams {
    student_id: String,
    student_name: String,
    project_id: String,
    project_title: String,
    supervisor_id: String,
    #[serde(default)]
    reader_id: Option<String>,
}

fn allocations_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p: AllocationParams = parse_params(params)?;
    if p.student_id.trim().is_empty() {
        return Err(HandlerErr::bad_params("missing studentId"));
    }
    if p.reader_id.as_deref() == Some(p.supervisor_id.as_str()) {
        return Err(HandlerErr::bad_params("supervisor and reader must differ"));
    }
    for id in std::iter::once(&p.supervisor_id).chain(p.reader_id.iter()) {
        if !marker_exists(conn, id)? {
            let mut e = HandlerErr::new("not_found", "marker not found");
            e.details = Some(json!({ "markerId": id }));
            return Err(e);
        }
    }
    conn.execute(
        "INSERT INTO allocations(student_id, student_name, project_id, project_title, supervisor_id, reader_id)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           student_name = excluded.student_name,
           project_id = excluded.project_id,
           project_title = excluded.project_title,
           supervisor_id = excluded.supervisor_id,
           reader_id = excluded.reader_id",
        (
            &p.student_id,
            &p.student_name,
            &p.project_id,
            &p.project_title,
            &p.supervisor_id,
            &p.reader_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "studentId": p.student_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitParams {
    #[serde(default)]
    id: Option<String>,
    title: String,
    weight: f64,
    #[serde(default)]
    student_deadline: Option<String>,
    #[serde(default)]
    marker_deadline: Option<String>,
    #[serde(default)]
    allowed_roles: Vec<String>,
    #[serde(default)]
    open: bool,
    #[serde(default)]
    sort_order: i64,
}

fn validate_deadline(key: &str, raw: &Option<String>) -> Result<(), HandlerErr> {
    if let Some(s) = raw {
        chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| HandlerErr::bad_params(format!("{} must be RFC 3339: {}", key, e)))?;
    }
    Ok(())
}

fn units_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: UnitParams = parse_params(params)?;
    if p.title.trim().is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    if !p.weight.is_finite() || p.weight <= 0.0 {
        return Err(HandlerErr::bad_params("unit weight must be positive"));
    }
    validate_deadline("studentDeadline", &p.student_deadline)?;
    validate_deadline("markerDeadline", &p.marker_deadline)?;

    let roles = if p.allowed_roles.is_empty() {
        vec![MarkerRole::Supervisor, MarkerRole::Reader]
    } else {
        let mut roles = Vec::new();
        for raw in &p.allowed_roles {
            let Some(role) = MarkerRole::parse(raw) else {
                return Err(HandlerErr::bad_params(format!("unknown marker role: {}", raw)));
            };
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        roles
    };
    let roles_raw = roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let id = p.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO units(id, title, weight, student_deadline, marker_deadline, is_open, allowed_roles, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            p.title.trim(),
            p.weight,
            &p.student_deadline,
            &p.marker_deadline,
            p.open as i64,
            &roles_raw,
            p.sort_order,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "unitId": id, "allowedRoles": roles }))
}

fn units_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, title, weight, student_deadline, marker_deadline, is_open, allowed_roles
         FROM units
         ORDER BY sort_order, id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let roles: String = r.get(6)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "weight": r.get::<_, f64>(2)?,
                "studentDeadline": r.get::<_, Option<String>>(3)?,
                "markerDeadline": r.get::<_, Option<String>>(4)?,
                "open": r.get::<_, i64>(5)? != 0,
                "allowedRoles": parse_allowed_roles(&roles),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "units": rows }))
}

fn units_set_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let unit_id = get_required_str(params, "unitId")?;
    let Some(open) = params.get("open").and_then(|v| v.as_bool()) else {
        return Err(HandlerErr::bad_params("open must be boolean"));
    };
    let changed = conn
        .execute(
            "UPDATE units SET is_open = ? WHERE id = ?",
            (open as i64, &unit_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "unit of assessment not found"));
    }
    tracing::info!(unit_id = %unit_id, open, "unit open flag changed");
    Ok(json!({ "unitId": unit_id, "open": open }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CriterionParams {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    description: String,
    weight: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CriteriaSetParams {
    unit_id: String,
    criteria: Vec<CriterionParams>,
}

/// Replaces the whole rubric. Refused once any marker has scored against it.
fn criteria_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p: CriteriaSetParams = parse_params(params)?;
    if p.criteria.is_empty() {
        return Err(HandlerErr::bad_params("a rubric needs at least one criterion"));
    }
    let mut total = 0.0_f64;
    for c in &p.criteria {
        if !c.weight.is_finite() || c.weight <= 0.0 {
            return Err(HandlerErr::bad_params("criterion weight must be positive"));
        }
        total += c.weight;
    }
    if total <= 0.0 {
        return Err(HandlerErr::bad_params("criterion weights sum to zero"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    marking::load_unit(&tx, &p.unit_id)?;
    let scored: i64 = tx.query_row(
        "SELECT COUNT(*)
         FROM criterion_scores cs
         JOIN assessment_criteria ac ON ac.id = cs.criterion_id
         WHERE ac.unit_id = ?",
        [&p.unit_id],
        |r| r.get(0),
    )?;
    if scored > 0 {
        return Err(HandlerErr::new(
            "rubric_locked",
            "rubric already has criterion scores",
        ));
    }
    tx.execute(
        "DELETE FROM assessment_criteria WHERE unit_id = ?",
        [&p.unit_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    let mut ids = Vec::with_capacity(p.criteria.len());
    for (idx, c) in p.criteria.iter().enumerate() {
        let id = c.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        tx.execute(
            "INSERT INTO assessment_criteria(id, unit_id, title, description, weight, layout_index)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, &p.unit_id, c.title.trim(), &c.description, c.weight, idx as i64),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        ids.push(id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "unitId": p.unit_id, "criterionIds": ids }))
}

fn criteria_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let unit_id = get_required_str(params, "unitId")?;
    marking::load_unit(conn, &unit_id)?;
    let criteria = marking::load_criteria(conn, &unit_id)?;
    Ok(json!({ "unitId": unit_id, "criteria": criteria }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "markers.upsert" => Some(with_conn(state, req, markers_upsert)),
        "allocations.upsert" => Some(with_conn(state, req, allocations_upsert)),
        "units.create" => Some(with_conn(state, req, units_create)),
        "units.list" => Some(with_conn(state, req, |conn, _| units_list(conn))),
        "units.setOpen" => Some(with_conn(state, req, units_set_open)),
        "criteria.set" => Some(with_conn(state, req, criteria_set)),
        "criteria.list" => Some(with_conn(state, req, criteria_list)),
        _ => None,
    }
}
