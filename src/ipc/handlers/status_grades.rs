use crate::db;
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::handlers::setup::{self, ImportPolicy};
use crate::ipc::helpers::{course_code, optional_str, require_conn, required_str, student_exists};
use crate::ipc::types::{AppState, Request};
use crate::status_grade::{
    is_valid_status_grade, rows_from_csv, rows_to_csv, validate_rows, ImportRow, RowIssue,
    StatusGrade, StatusGradeRow, ValidatedRow, SHEET_COLUMNS,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUS_GRADE_MAX_ROWS: usize = 5000;
const PREVIEW_ROW_LIMIT: usize = 250;

struct ResolvedRow {
    line: usize,
    register_no: String,
    student_id: String,
    grade: StatusGrade,
    current: Option<String>,
}

impl ResolvedRow {
    fn is_unchanged(&self) -> bool {
        self.current.as_deref() == Some(self.grade.as_str())
    }
}

fn current_status(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<Option<String>, HandlerErr> {
    let found: Option<Option<String>> = conn
        .query_row(
            "SELECT status_grade FROM exam_registrations WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(found.flatten())
}

/// Creates the registration when the student has none for the course yet.
fn upsert_status_grade(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    grade: StatusGrade,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO exam_registrations(id, student_id, course_id, status_grade, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id) DO UPDATE SET
           status_grade = excluded.status_grade,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            course_id,
            grade.as_str(),
            db::now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "exam_registrations" }))
    })?;
    Ok(())
}

fn status_grades_values() -> HandlerResult {
    let values: Vec<serde_json::Value> = StatusGrade::ALL
        .iter()
        .map(|g| {
            json!({
                "value": g.as_str(),
                "badge": g.badge(),
                "absent": g.is_absent(),
            })
        })
        .collect();
    Ok(json!({ "values": values }))
}

fn status_grades_validate(req: &Request) -> HandlerResult {
    let Some(value) = req.params.get("value").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing value"));
    };
    Ok(json!({ "value": value, "valid": is_valid_status_grade(value) }))
}

fn status_grades_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let course_id = required_str(req, "courseId")?;
    let Some(raw) = req.params.get("grade").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing grade"));
    };
    let grade = StatusGrade::parse(raw).map_err(|e| {
        HandlerErr::new(e.code(), e.to_string()).with_details(json!({
            "value": raw,
            "allowed": StatusGrade::ALL.map(StatusGrade::as_str),
        }))
    })?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found")
            .with_details(json!({ "studentId": student_id })));
    }
    let code = course_code(conn, &course_id)?;

    let previous = current_status(conn, &student_id, &course_id)?;
    upsert_status_grade(conn, &student_id, &course_id, grade)?;
    tracing::info!(student_id = %student_id, course = %code, grade = %grade, "status grade set");

    Ok(json!({ "ok": true, "previous": previous, "grade": grade }))
}

fn status_grades_clear(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let course_id = required_str(req, "courseId")?;

    let changed = conn
        .execute(
            "UPDATE exam_registrations
             SET status_grade = NULL, updated_at = ?
             WHERE student_id = ? AND course_id = ? AND status_grade IS NOT NULL",
            (db::now_timestamp(), &student_id, &course_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    Ok(json!({ "ok": true, "cleared": changed > 0 }))
}

fn status_grades_export(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let course_id = required_str(req, "courseId")?;
    let code = course_code(conn, &course_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.register_no, s.name, er.status_grade
             FROM exam_registrations er
             JOIN students s ON s.id = er.student_id
             WHERE er.course_id = ?
             ORDER BY s.register_no",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows: Vec<StatusGradeRow> = stmt
        .query_map([&course_id], |r| {
            let register_no: String = r.get(0)?;
            let student_name: String = r.get(1)?;
            let current: Option<String> = r.get(2)?;
            let current = current.unwrap_or_default();
            // New Grade starts as the current grade so an untouched sheet re-imports as a no-op.
            Ok(StatusGradeRow {
                register_no,
                student_name,
                new_grade: current.clone(),
                current_grade: current,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let out_path = optional_str(req, "outPath");
    if let Some(path) = &out_path {
        std::fs::write(path, rows_to_csv(&rows)).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
        tracing::info!(course = %code, path = %path, rows = rows.len(), "status grades exported");
    }

    Ok(json!({
        "courseId": course_id,
        "courseCode": code,
        "columns": SHEET_COLUMNS,
        "rowCount": rows.len(),
        "rows": rows,
        "path": out_path,
    }))
}

/// Rows come either inline as `rows[]` objects or from a CSV file at `inPath`.
fn read_import_rows(
    req: &Request,
) -> Result<(Vec<ImportRow>, Vec<RowIssue>, Option<String>), HandlerErr> {
    if let Some(arr) = req.params.get("rows").and_then(|v| v.as_array()) {
        if arr.len() > STATUS_GRADE_MAX_ROWS {
            return Err(HandlerErr::bad_params(format!(
                "too many rows: {} > {}",
                arr.len(),
                STATUS_GRADE_MAX_ROWS
            )));
        }
        let mut rows = Vec::with_capacity(arr.len());
        let mut issues = Vec::new();
        for (i, item) in arr.iter().enumerate() {
            match serde_json::from_value::<StatusGradeRow>(item.clone()) {
                Ok(row) => rows.push(ImportRow { line: i + 1, row }),
                Err(e) => issues.push(RowIssue::new(i + 1, None, "bad_row", e.to_string())),
            }
        }
        return Ok((rows, issues, None));
    }

    let Some(in_path) = optional_str(req, "inPath") else {
        return Err(HandlerErr::bad_params("provide rows[] or inPath"));
    };
    let text = std::fs::read_to_string(&in_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": in_path }))
    })?;
    let (rows, issues) = rows_from_csv(&text);
    if rows.len() > STATUS_GRADE_MAX_ROWS {
        return Err(HandlerErr::bad_params(format!(
            "too many rows: {} > {}",
            rows.len(),
            STATUS_GRADE_MAX_ROWS
        )));
    }
    Ok((rows, issues, Some(in_path)))
}

fn resolve_rows(
    conn: &Connection,
    course_id: &str,
    valid: Vec<ValidatedRow>,
) -> Result<(Vec<ResolvedRow>, Vec<RowIssue>), HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, er.status_grade
             FROM students s
             LEFT JOIN exam_registrations er ON er.student_id = s.id AND er.course_id = ?
             WHERE s.register_no = ?",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut resolved = Vec::with_capacity(valid.len());
    let mut issues = Vec::new();
    for row in valid {
        let register_no = row.register_no;
        let found: Option<(String, Option<String>)> = stmt
            .query_row((course_id, &register_no), |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        match found {
            Some((student_id, current)) => resolved.push(ResolvedRow {
                line: row.line,
                register_no,
                student_id,
                grade: row.grade,
                current,
            }),
            None => issues.push(RowIssue::new(
                row.line,
                Some(&register_no),
                "unknown_register_no",
                "no student with this Register No",
            )),
        }
    }
    Ok((resolved, issues))
}

/// Parse, validate and resolve every row; nothing is written here.
fn prepare_import(
    conn: &Connection,
    req: &Request,
) -> Result<(String, Vec<ResolvedRow>, Vec<RowIssue>, usize, Option<String>), HandlerErr> {
    let course_id = required_str(req, "courseId")?;
    course_code(conn, &course_id)?;

    let (rows, mut issues, path) = read_import_rows(req)?;
    let rows_parsed = rows.len();
    let (valid, row_issues) = validate_rows(&rows);
    issues.extend(row_issues);
    let (resolved, unresolved) = resolve_rows(conn, &course_id, valid)?;
    issues.extend(unresolved);
    issues.sort_by_key(|i| i.line);

    Ok((course_id, resolved, issues, rows_parsed, path))
}

fn status_grades_preview(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let (course_id, resolved, issues, rows_parsed, path) = prepare_import(conn, req)?;

    let unchanged = resolved.iter().filter(|r| r.is_unchanged()).count();
    let preview_rows: Vec<serde_json::Value> = resolved
        .iter()
        .take(PREVIEW_ROW_LIMIT)
        .map(|r| {
            json!({
                "line": r.line,
                "registerNo": r.register_no,
                "studentId": r.student_id,
                "currentGrade": r.current,
                "newGrade": r.grade,
                "action": if r.is_unchanged() { "unchanged" } else { "update" },
            })
        })
        .collect();

    Ok(json!({
        "courseId": course_id,
        "path": path,
        "rowsParsed": rows_parsed,
        "rowsValid": resolved.len(),
        "rowsUnchanged": unchanged,
        "rowsRejected": issues.len(),
        "issues": issues,
        "previewRows": preview_rows,
    }))
}

fn status_grades_apply(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let policy = match optional_str(req, "policy") {
        Some(raw) => ImportPolicy::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("policy must be one of: skip_invalid, reject_batch")
        })?,
        None => setup::import_policy(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?,
    };
    let (course_id, resolved, issues, rows_parsed, path) = prepare_import(conn, req)?;

    if policy == ImportPolicy::RejectBatch && !issues.is_empty() {
        tracing::warn!(
            course_id = %course_id,
            rejected = issues.len(),
            "status grade batch rejected"
        );
        return Ok(json!({
            "ok": true,
            "applied": false,
            "policy": policy.as_str(),
            "rowsParsed": rows_parsed,
            "updated": 0,
            "unchanged": 0,
            "rejected": issues.len(),
            "issues": issues,
            "path": path,
        }));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut updated = 0usize;
    let mut unchanged = 0usize;
    for row in &resolved {
        if row.is_unchanged() {
            unchanged += 1;
            continue;
        }
        upsert_status_grade(&tx, &row.student_id, &course_id, row.grade)?;
        updated += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    if !issues.is_empty() {
        tracing::warn!(course_id = %course_id, rejected = issues.len(), "status grade rows skipped");
    }
    tracing::info!(course_id = %course_id, updated, unchanged, "status grades applied");

    Ok(json!({
        "ok": true,
        "applied": true,
        "policy": policy.as_str(),
        "rowsParsed": rows_parsed,
        "updated": updated,
        "unchanged": unchanged,
        "rejected": issues.len(),
        "issues": issues,
        "path": path,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "statusGrades.values" => status_grades_values(),
        "statusGrades.validate" => status_grades_validate(req),
        "statusGrades.set" => status_grades_set(state, req),
        "statusGrades.clear" => status_grades_clear(state, req),
        "statusGrades.export" => status_grades_export(state, req),
        "statusGrades.preview" => status_grades_preview(state, req),
        "statusGrades.apply" => status_grades_apply(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
