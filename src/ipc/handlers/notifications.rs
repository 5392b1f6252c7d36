use crate::ipc::helpers::{with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::outbox;
use rusqlite::Connection;
use serde_json::json;

const DEFAULT_PENDING_LIMIT: i64 = 100;
const MAX_PENDING_LIMIT: i64 = 1000;

fn pending(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let limit = match params.get("limit") {
        None => DEFAULT_PENDING_LIMIT,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=MAX_PENDING_LIMIT).contains(&n) => n,
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "limit must be an integer between 1 and {}",
                    MAX_PENDING_LIMIT
                )))
            }
        },
    };
    let entries = outbox::pending(conn, limit).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "notifications": entries }))
}

fn mark_delivered(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(raw) = params.get("ids").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("ids must be an array"));
    };
    let mut ids = Vec::with_capacity(raw.len());
    for v in raw {
        let Some(id) = v.as_str() else {
            return Err(HandlerErr::bad_params("ids must contain strings"));
        };
        ids.push(id.to_string());
    }
    let delivered =
        outbox::mark_delivered(conn, &ids).map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "delivered": delivered }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.pending" => Some(with_conn(state, req, pending)),
        "notifications.markDelivered" => Some(with_conn(state, req, mark_delivered)),
        _ => None,
    }
}
