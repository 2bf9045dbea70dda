use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{require_conn, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn courses_list(state: &mut AppState) -> HandlerResult {
    let conn = require_conn(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.code,
               c.name,
               c.credits,
               (SELECT COUNT(*) FROM exam_registrations er WHERE er.course_id = c.id) AS registration_count
             FROM courses c
             ORDER BY c.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let courses = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let credits: f64 = row.get(3)?;
            let registration_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "credits": credits,
                "registrationCount": registration_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "courses": courses }))
}

fn courses_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let code = required_str(req, "code")?.to_ascii_uppercase();
    let name = required_str(req, "name")?;
    let credits = required_f64(&req.params, "credits")?;
    if credits <= 0.0 {
        return Err(HandlerErr::bad_params("credits must be > 0")
            .with_details(json!({ "credits": credits })));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM courses WHERE code = ?", [&code], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(course_id) = existing {
        return Err(HandlerErr::new("conflict", "course code already exists")
            .with_details(json!({ "code": code, "courseId": course_id })));
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, code, name, credits) VALUES(?, ?, ?, ?)",
        (&course_id, &code, &name, credits),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "courses" })))?;

    Ok(json!({
        "courseId": course_id,
        "code": code,
        "name": name,
        "credits": credits,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.list" => courses_list(state),
        "courses.create" => courses_create(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
