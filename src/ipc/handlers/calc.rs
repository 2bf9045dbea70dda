use crate::grading::{calculate_percentage, CourseResult, Resolution};
use crate::ipc::error::{respond, HandlerErr, HandlerResult};
use crate::ipc::helpers::{optional_str, require_conn, required_f64, required_str, resolver_for};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

const CALC_MAX_COURSES: usize = 500;

/// Rejects request rows that break the course-input invariants. The
/// calculation itself still degrades such rows to zero when called directly.
fn course_row_problem(c: &CourseResult) -> Option<&'static str> {
    if c.course_code.trim().is_empty() {
        Some("courseCode must not be empty")
    } else if !c.credits.is_finite() || c.credits <= 0.0 {
        Some("credits must be > 0")
    } else if !c.marks_obtained.is_finite() || c.marks_obtained < 0.0 {
        Some("marksObtained must be >= 0")
    } else if !c.max_marks.is_finite() || c.max_marks <= 0.0 {
        Some("maxMarks must be > 0")
    } else {
        None
    }
}

/// Every row is checked before anything is computed; all problems are
/// reported together in `details.errors`.
fn parse_course_rows(raw: Option<&serde_json::Value>) -> Result<Vec<CourseResult>, HandlerErr> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing courses[]"));
    };
    if arr.len() > CALC_MAX_COURSES {
        return Err(HandlerErr::bad_params(format!(
            "too many courses: {} > {}",
            arr.len(),
            CALC_MAX_COURSES
        )));
    }

    let mut courses = Vec::with_capacity(arr.len());
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        let course: CourseResult = match serde_json::from_value(item.clone()) {
            Ok(c) => c,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "message": format!("course at index {} is malformed: {}", i, e),
                }));
                continue;
            }
        };
        if let Some(problem) = course_row_problem(&course) {
            errors.push(json!({
                "index": i,
                "courseCode": course.course_code,
                "message": problem,
            }));
            continue;
        }
        courses.push(course);
    }

    if !errors.is_empty() {
        return Err(HandlerErr::bad_params("courses contain invalid rows")
            .with_details(json!({ "errors": errors })));
    }
    Ok(courses)
}

fn calc_percentage(req: &Request) -> HandlerResult {
    let marks_obtained = required_f64(&req.params, "marksObtained")?;
    let max_marks = required_f64(&req.params, "maxMarks")?;
    Ok(json!({ "percentage": calculate_percentage(marks_obtained, max_marks) }))
}

fn calc_grade(state: &mut AppState, req: &Request) -> HandlerResult {
    let percentage = required_f64(&req.params, "percentage")?;
    let regulation_id = optional_str(req, "regulationId");
    let (resolver, source) = resolver_for(state.db.as_ref(), regulation_id.as_deref())?;

    let in_range = matches!(resolver.resolve(percentage), Resolution::Band(_));
    let band = resolver.calculate_grade(percentage);
    Ok(json!({
        "percentage": percentage,
        "grade": band.grade,
        "gradePoint": band.grade_point,
        "description": band.description,
        "minPercentage": band.min_percentage,
        "maxPercentage": band.max_percentage,
        "inRange": in_range,
        "passing": resolver.is_passing(percentage),
        "regulationId": source,
    }))
}

fn calc_grade_point(state: &mut AppState, req: &Request) -> HandlerResult {
    let marks_obtained = required_f64(&req.params, "marksObtained")?;
    let max_marks = required_f64(&req.params, "maxMarks")?;
    let regulation_id = optional_str(req, "regulationId");
    let (resolver, source) = resolver_for(state.db.as_ref(), regulation_id.as_deref())?;
    Ok(json!({
        "gradePoint": resolver.get_grade_point(marks_obtained, max_marks),
        "regulationId": source,
    }))
}

fn calc_cgpa(state: &mut AppState, req: &Request) -> HandlerResult {
    let courses = parse_course_rows(req.params.get("courses"))?;
    let regulation_id = optional_str(req, "regulationId");
    let (resolver, source) = resolver_for(state.db.as_ref(), regulation_id.as_deref())?;

    let result = resolver.calculate_cgpa(&courses);
    let mut out = json!(result);
    out["regulationId"] = json!(source);
    Ok(out)
}

fn calc_student_result(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = require_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let regulation_id = optional_str(req, "regulationId");

    let student: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT register_no, name, batch FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((register_no, name, batch)) = student else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let (resolver, source) = resolver_for(Some(conn), regulation_id.as_deref())?;

    let mut stmt = conn
        .prepare(
            "SELECT c.code, c.name, c.credits, er.marks_obtained, er.max_marks
             FROM exam_registrations er
             JOIN courses c ON c.id = er.course_id
             WHERE er.student_id = ?
             ORDER BY c.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&student_id], |r| {
            let code: String = r.get(0)?;
            let name: String = r.get(1)?;
            let credits: f64 = r.get(2)?;
            let marks_obtained: Option<f64> = r.get(3)?;
            let max_marks: Option<f64> = r.get(4)?;
            Ok((code, name, credits, marks_obtained, max_marks))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    // Registrations that only carry a status grade have no marks to grade yet.
    let mut courses = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for (code, course_name, credits, marks_obtained, max_marks) in rows {
        match (marks_obtained, max_marks) {
            (Some(marks_obtained), Some(max_marks)) => courses.push(CourseResult {
                course_code: code,
                course_name,
                credits,
                marks_obtained,
                max_marks,
            }),
            _ => pending.push(code),
        }
    }

    let result = resolver.calculate_cgpa(&courses);
    Ok(json!({
        "student": {
            "id": student_id,
            "registerNo": register_no,
            "name": name,
            "batch": batch,
        },
        "regulationId": source,
        "result": result,
        "pendingCourses": pending,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "calc.percentage" => calc_percentage(req),
        "calc.grade" => calc_grade(state, req),
        "calc.gradePoint" => calc_grade_point(state, req),
        "calc.cgpa" => calc_cgpa(state, req),
        "calc.studentResult" => calc_student_result(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
