use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{course_code, require_conn, required_f64, required_str, student_exists};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn marks_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let course_id = required_str(req, "courseId")?;
    let marks_obtained = required_f64(&req.params, "marksObtained")?;
    let max_marks = required_f64(&req.params, "maxMarks")?;
    if marks_obtained < 0.0 {
        return Err(HandlerErr::bad_params("marksObtained must be >= 0")
            .with_details(json!({ "marksObtained": marks_obtained })));
    }
    if max_marks <= 0.0 {
        return Err(HandlerErr::bad_params("maxMarks must be > 0")
            .with_details(json!({ "maxMarks": max_marks })));
    }

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found")
            .with_details(json!({ "studentId": student_id })));
    }
    let code = course_code(conn, &course_id)?;

    // Keeps any status grade already recorded on the registration.
    conn.execute(
        "INSERT INTO exam_registrations(id, student_id, course_id, marks_obtained, max_marks, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id) DO UPDATE SET
           marks_obtained = excluded.marks_obtained,
           max_marks = excluded.max_marks,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &course_id,
            marks_obtained,
            max_marks,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "exam_registrations" }))
    })?;

    tracing::debug!(student_id = %student_id, course = %code, "marks recorded");
    Ok(json!({ "ok": true }))
}

fn marks_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.code, c.name, c.credits, er.marks_obtained, er.max_marks, er.status_grade, er.updated_at
             FROM exam_registrations er
             JOIN courses c ON c.id = er.course_id
             WHERE er.student_id = ?
             ORDER BY c.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let registrations = stmt
        .query_map([&student_id], |row| {
            let course_id: String = row.get(0)?;
            let course_code: String = row.get(1)?;
            let course_name: String = row.get(2)?;
            let credits: f64 = row.get(3)?;
            let marks_obtained: Option<f64> = row.get(4)?;
            let max_marks: Option<f64> = row.get(5)?;
            let status_grade: Option<String> = row.get(6)?;
            let updated_at: String = row.get(7)?;
            Ok(json!({
                "courseId": course_id,
                "courseCode": course_code,
                "courseName": course_name,
                "credits": credits,
                "marksObtained": marks_obtained,
                "maxMarks": max_marks,
                "statusGrade": status_grade,
                "updatedAt": updated_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "studentId": student_id, "registrations": registrations }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "marks.set" => marks_set(state, req),
        "marks.list" => marks_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
