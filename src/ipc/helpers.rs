use crate::db;
use crate::grading::{GradeResolver, GradingScale};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};

pub fn require_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Trimmed, non-empty string param.
pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    let Some(raw) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let v = raw.trim();
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(v.to_string())
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing/invalid {}", key)))
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(found.is_some())
}

/// Code of a course, or `not_found`.
pub fn course_code(conn: &Connection, course_id: &str) -> Result<String, HandlerErr> {
    let code: Option<String> = conn
        .query_row("SELECT code FROM courses WHERE id = ?", [course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    code.ok_or_else(|| {
        HandlerErr::not_found("course not found")
            .with_details(serde_json::json!({ "courseId": course_id }))
    })
}

/// Scale used by calc methods: the explicit regulation, else the workspace
/// default regulation, else the built-in 10-point scale.
/// Returns the resolver and the id of the regulation it came from.
pub fn resolver_for(
    conn: Option<&Connection>,
    regulation_id: Option<&str>,
) -> Result<(GradeResolver, Option<String>), HandlerErr> {
    if let Some(id) = regulation_id {
        let Some(conn) = conn else {
            return Err(HandlerErr::new(
                "no_workspace",
                "select a workspace first to use a regulation scale",
            ));
        };
        let scale = db::load_regulation_scale(conn, id)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
            .ok_or_else(|| {
                HandlerErr::not_found("regulation not found")
                    .with_details(serde_json::json!({ "regulationId": id }))
            })?;
        return Ok((GradeResolver::new(scale), Some(id.to_string())));
    }

    let Some(conn) = conn else {
        return Ok((GradeResolver::new(GradingScale::ten_point()), None));
    };
    let default_id =
        setup::default_regulation_id(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(id) = default_id {
        match db::load_regulation_scale(conn, &id) {
            Ok(Some(scale)) => return Ok((GradeResolver::new(scale), Some(id))),
            Ok(None) => {
                tracing::warn!(regulation_id = %id, "default regulation missing; using built-in scale")
            }
            Err(e) => return Err(HandlerErr::db("db_query_failed", e)),
        }
    }
    Ok((GradeResolver::new(GradingScale::ten_point()), None))
}
