use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{optional_str, require_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let batch = optional_str(req, "batch");

    let mut stmt = conn
        .prepare(
            "SELECT id, register_no, name, batch
             FROM students
             WHERE (?1 IS NULL OR batch = ?1)
             ORDER BY register_no",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([&batch], |row| {
            let id: String = row.get(0)?;
            let register_no: String = row.get(1)?;
            let name: String = row.get(2)?;
            let batch: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "registerNo": register_no,
                "name": name,
                "batch": batch,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "students": students }))
}

fn students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let register_no = required_str(req, "registerNo")?.to_ascii_uppercase();
    let name = required_str(req, "name")?;
    let batch = optional_str(req, "batch");

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE register_no = ?",
            [&register_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(student_id) = existing {
        return Err(HandlerErr::new("conflict", "register number already exists")
            .with_details(json!({ "registerNo": register_no, "studentId": student_id })));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, register_no, name, batch, created_at) VALUES(?, ?, ?, ?, ?)",
        (&student_id, &register_no, &name, &batch, db::now_timestamp()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" })))?;

    Ok(json!({
        "studentId": student_id,
        "registerNo": register_no,
        "name": name,
        "batch": batch,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.create" => students_create(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
