use crate::config;
use crate::ipc::helpers::{with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn setup_get(conn: &rusqlite::Connection) -> Result<serde_json::Value, HandlerErr> {
    let cfg = config::load(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "engine": cfg.to_json() }))
}

fn setup_update(
    conn: &rusqlite::Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let mut cfg = config::load(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    cfg.apply_patch(patch).map_err(HandlerErr::bad_params)?;
    config::save(conn, &cfg).map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tracing::info!(fields = patch.len(), "engine settings updated");
    Ok(json!({ "engine": cfg.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_conn(state, req, |conn, _| setup_get(conn))),
        "setup.update" => Some(with_conn(state, req, setup_update)),
        _ => None,
    }
}
