use crate::db;
use crate::grading::{GradeBand, GradingScale};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{require_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const REGULATION_CODE_MAX_LEN: usize = 32;

/// `scale` param as bands; absent means the built-in 10-point scale.
fn parse_scale(raw: Option<&serde_json::Value>) -> Result<Option<GradingScale>, HandlerErr> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let bands: Vec<GradeBand> = serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::bad_params(format!(
            "scale must be an array of {{minPercentage, maxPercentage, grade, gradePoint, description}}: {}",
            e
        ))
    })?;
    let scale = GradingScale::new(bands);
    scale.validate().map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    Ok(Some(scale))
}

fn regulations_list(state: &mut AppState) -> HandlerResult {
    let conn = require_conn(state)?;
    let default_id =
        setup::default_regulation_id(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut stmt = conn
        .prepare(
            "SELECT
               r.id,
               r.code,
               r.name,
               (SELECT COUNT(*) FROM grade_bands b WHERE b.regulation_id = r.id) AS band_count
             FROM regulations r
             ORDER BY r.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let regulations = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let band_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "bandCount": band_count,
                "isDefault": default_id.as_deref() == Some(id.as_str()),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "regulations": regulations }))
}

fn regulations_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let code = required_str(req, "code")?.to_ascii_uppercase();
    if code.len() > REGULATION_CODE_MAX_LEN {
        return Err(HandlerErr::bad_params(format!(
            "code length must be <= {}",
            REGULATION_CODE_MAX_LEN
        )));
    }
    let name = required_str(req, "name")?;
    let scale = parse_scale(req.params.get("scale"))?.unwrap_or_else(GradingScale::ten_point);

    let existing: Option<String> = conn
        .query_row("SELECT id FROM regulations WHERE code = ?", [&code], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr::new("conflict", "regulation code already exists")
            .with_details(json!({ "code": code, "regulationId": existing_id })));
    }

    let regulation_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO regulations(id, code, name, created_at) VALUES(?, ?, ?, ?)",
        (&regulation_id, &code, &name, db::now_timestamp()),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "regulations" }))
    })?;
    db::replace_regulation_bands(&tx, &regulation_id, &scale).map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "grade_bands" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let coverage = scale.coverage_issues();
    tracing::info!(
        regulation_id = %regulation_id,
        code = %code,
        bands = scale.bands().len(),
        coverage_issues = coverage.len(),
        "regulation created"
    );
    Ok(json!({
        "regulationId": regulation_id,
        "code": code,
        "name": name,
        "bandCount": scale.bands().len(),
        "coverageIssues": coverage,
    }))
}

fn regulations_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let regulation_id = required_str(req, "regulationId")?;

    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT code, name, created_at FROM regulations WHERE id = ?",
            [&regulation_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((code, name, created_at)) = row else {
        return Err(HandlerErr::not_found("regulation not found"));
    };
    let scale = db::load_regulation_scale(conn, &regulation_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .unwrap_or_else(|| GradingScale::new(Vec::new()));
    let default_id =
        setup::default_regulation_id(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "id": regulation_id,
        "code": code,
        "name": name,
        "createdAt": created_at,
        "isDefault": default_id.as_deref() == Some(regulation_id.as_str()),
        "coverageIssues": scale.coverage_issues(),
        "bands": scale,
    }))
}

fn regulations_update_scale(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let regulation_id = required_str(req, "regulationId")?;
    let Some(scale) = parse_scale(req.params.get("scale"))? else {
        return Err(HandlerErr::bad_params("missing scale"));
    };
    if !db::regulation_exists(conn, &regulation_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    {
        return Err(HandlerErr::not_found("regulation not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    db::replace_regulation_bands(&tx, &regulation_id, &scale).map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "grade_bands" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    tracing::info!(regulation_id = %regulation_id, bands = scale.bands().len(), "regulation scale replaced");
    Ok(json!({
        "ok": true,
        "bandCount": scale.bands().len(),
        "coverageIssues": scale.coverage_issues(),
    }))
}

fn regulations_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let regulation_id = required_str(req, "regulationId")?;
    if !db::regulation_exists(conn, &regulation_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    {
        return Err(HandlerErr::not_found("regulation not found"));
    }
    let default_id =
        setup::default_regulation_id(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if default_id.as_deref() == Some(regulation_id.as_str()) {
        return Err(HandlerErr::new(
            "conflict",
            "regulation is the workspace default; change setup.grading.defaultRegulationId first",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM grade_bands WHERE regulation_id = ?",
        [&regulation_id],
    )
    .map_err(|e| {
        HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "grade_bands" }))
    })?;
    tx.execute("DELETE FROM regulations WHERE id = ?", [&regulation_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "regulations" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    tracing::info!(regulation_id = %regulation_id, "regulation deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "regulations.list" => regulations_list(state),
        "regulations.create" => regulations_create(state, req),
        "regulations.get" => regulations_get(state, req),
        "regulations.updateScale" => regulations_update_scale(state, req),
        "regulations.delete" => regulations_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
