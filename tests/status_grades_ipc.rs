use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coed");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coed");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_default()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Fixture {
    workspace: PathBuf,
    course_id: String,
    students: Vec<String>,
}

fn setup_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> Fixture {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "course",
        "courses.create",
        json!({ "code": "EN101", "name": "English", "credits": 2 }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();

    let mut students = Vec::new();
    for (i, (reg, name)) in [("REG001", "Arun"), ("REG002", "Divya"), ("REG003", "Kavin")]
        .iter()
        .enumerate()
    {
        let s = request_ok(
            stdin,
            reader,
            &format!("s{}", i),
            "students.create",
            json!({ "registerNo": reg, "name": name }),
        );
        let student_id = s["studentId"].as_str().expect("studentId").to_string();
        request_ok(
            stdin,
            reader,
            &format!("m{}", i),
            "marks.set",
            json!({ "studentId": student_id, "courseId": course_id, "marksObtained": 60, "maxMarks": 100 }),
        );
        students.push(student_id);
    }

    Fixture {
        workspace,
        course_id,
        students,
    }
}

fn status_of(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
) -> Option<String> {
    let listed = request_ok(stdin, reader, id, "marks.list", json!({ "studentId": student_id }));
    listed["registrations"][0]["statusGrade"]
        .as_str()
        .map(str::to_string)
}

#[test]
fn single_status_grade_set_and_clear() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, "coed-status-single");
    let s1 = fx.students[0].clone();

    let values = request_ok(&mut stdin, &mut reader, "1", "statusGrades.values", json!({}));
    let values = values["values"].as_array().expect("values");
    let names: Vec<&str> = values.iter().filter_map(|v| v["value"].as_str()).collect();
    assert_eq!(names, vec!["Commended", "Highly Commended", "AAA"]);
    assert_eq!(values[2]["absent"].as_bool(), Some(true));
    assert_eq!(values[2]["badge"].as_str(), Some("danger"));

    let ok = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "statusGrades.validate",
        json!({ "value": "Highly Commended" }),
    );
    assert_eq!(ok["valid"].as_bool(), Some(true));
    let lower = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "statusGrades.validate",
        json!({ "value": "commended" }),
    );
    assert_eq!(lower["valid"].as_bool(), Some(false));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": fx.course_id, "grade": "Commended" }),
    );
    assert!(first["previous"].is_null());
    assert_eq!(first["grade"].as_str(), Some("Commended"));
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": fx.course_id, "grade": "AAA" }),
    );
    assert_eq!(second["previous"].as_str(), Some("Commended"));
    assert_eq!(status_of(&mut stdin, &mut reader, "6", &s1).as_deref(), Some("AAA"));

    let invalid = request(
        &mut stdin,
        &mut reader,
        "7",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": fx.course_id, "grade": "Excellent" }),
    );
    assert_eq!(error_code(&invalid), "invalid_status_grade");
    let blank = request(
        &mut stdin,
        &mut reader,
        "8",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": fx.course_id, "grade": "  " }),
    );
    assert_eq!(error_code(&blank), "missing_status_grade");
    let unknown_course = request(
        &mut stdin,
        &mut reader,
        "9",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": "nope", "grade": "AAA" }),
    );
    assert_eq!(error_code(&unknown_course), "not_found");
    assert_eq!(status_of(&mut stdin, &mut reader, "10", &s1).as_deref(), Some("AAA"));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "statusGrades.clear",
        json!({ "studentId": s1, "courseId": fx.course_id }),
    );
    assert_eq!(cleared["cleared"].as_bool(), Some(true));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "statusGrades.clear",
        json!({ "studentId": s1, "courseId": fx.course_id }),
    );
    assert_eq!(again["cleared"].as_bool(), Some(false));
    assert_eq!(status_of(&mut stdin, &mut reader, "13", &s1), None);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn export_then_import_sheet_with_both_policies() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, "coed-status-sheet");
    let (s1, s2, s3) = (
        fx.students[0].clone(),
        fx.students[1].clone(),
        fx.students[2].clone(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "statusGrades.set",
        json!({ "studentId": s1, "courseId": fx.course_id, "grade": "Commended" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "statusGrades.set",
        json!({ "studentId": s3, "courseId": fx.course_id, "grade": "AAA" }),
    );

    let export_path = fx.workspace.join("en101-status.csv");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "statusGrades.export",
        json!({ "courseId": fx.course_id, "outPath": export_path.to_string_lossy() }),
    );
    assert_eq!(exported["courseCode"].as_str(), Some("EN101"));
    assert_eq!(exported["rowCount"].as_u64(), Some(3));
    assert_eq!(exported["rows"][0]["registerNo"].as_str(), Some("REG001"));
    assert_eq!(exported["rows"][0]["newGrade"].as_str(), Some("Commended"));
    assert_eq!(exported["rows"][1]["currentGrade"].as_str(), Some(""));
    let text = std::fs::read_to_string(&export_path).expect("read export");
    assert!(text.starts_with("Register No,Student Name,Current Grade,New Grade\n"));
    assert!(text.contains("REG003,Kavin,AAA,AAA"));

    // Untouched sheet: only the student without a grade is rejected.
    let untouched = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "statusGrades.apply",
        json!({ "courseId": fx.course_id, "inPath": export_path.to_string_lossy() }),
    );
    assert_eq!(untouched["applied"].as_bool(), Some(true));
    assert_eq!(untouched["updated"].as_u64(), Some(0));
    assert_eq!(untouched["unchanged"].as_u64(), Some(2));
    assert_eq!(untouched["issues"][0]["code"].as_str(), Some("missing_status_grade"));
    assert_eq!(untouched["issues"][0]["line"].as_u64(), Some(3));

    let edited_path = fx.workspace.join("en101-edited.csv");
    std::fs::write(
        &edited_path,
        "Register No,Student Name,Current Grade,New Grade\n\
         REG001,Arun,Commended,Highly Commended\n\
         reg002,Divya,,Commended\n\
         REG003,Kavin,AAA,AAA\n\
         REG999,Ghost,,Commended\n\
         reg002,Divya,,AAA\n",
    )
    .expect("write edited sheet");

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "statusGrades.preview",
        json!({ "courseId": fx.course_id, "inPath": edited_path.to_string_lossy() }),
    );
    assert_eq!(preview["rowsParsed"].as_u64(), Some(5));
    assert_eq!(preview["rowsValid"].as_u64(), Some(3));
    assert_eq!(preview["rowsUnchanged"].as_u64(), Some(1));
    let issues: Vec<(u64, String)> = preview["issues"]
        .as_array()
        .expect("issues")
        .iter()
        .map(|i| {
            (
                i["line"].as_u64().unwrap_or(0),
                i["code"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect();
    assert_eq!(
        issues,
        vec![
            (5, "unknown_register_no".to_string()),
            (6, "duplicate_register_no".to_string()),
        ]
    );
    assert_eq!(preview["previewRows"][1]["registerNo"].as_str(), Some("REG002"));
    assert_eq!(preview["previewRows"][1]["action"].as_str(), Some("update"));
    assert_eq!(preview["previewRows"][2]["action"].as_str(), Some("unchanged"));
    assert_eq!(status_of(&mut stdin, &mut reader, "6", &s1).as_deref(), Some("Commended"));

    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "statusGrades.apply",
        json!({
            "courseId": fx.course_id,
            "inPath": edited_path.to_string_lossy(),
            "policy": "reject_batch"
        }),
    );
    assert_eq!(rejected["applied"].as_bool(), Some(false));
    assert_eq!(rejected["updated"].as_u64(), Some(0));
    assert_eq!(rejected["rejected"].as_u64(), Some(2));
    assert_eq!(status_of(&mut stdin, &mut reader, "8", &s1).as_deref(), Some("Commended"));
    assert_eq!(status_of(&mut stdin, &mut reader, "9", &s2), None);

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "statusGrades.apply",
        json!({ "courseId": fx.course_id, "inPath": edited_path.to_string_lossy() }),
    );
    assert_eq!(applied["applied"].as_bool(), Some(true));
    assert_eq!(applied["policy"].as_str(), Some("skip_invalid"));
    assert_eq!(applied["updated"].as_u64(), Some(2));
    assert_eq!(applied["unchanged"].as_u64(), Some(1));
    assert_eq!(applied["rejected"].as_u64(), Some(2));
    assert_eq!(
        status_of(&mut stdin, &mut reader, "11", &s1).as_deref(),
        Some("Highly Commended")
    );
    assert_eq!(status_of(&mut stdin, &mut reader, "12", &s2).as_deref(), Some("Commended"));
    assert_eq!(status_of(&mut stdin, &mut reader, "13", &s3).as_deref(), Some("AAA"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn inline_rows_follow_workspace_import_policy() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, "coed-status-inline");
    let s2 = fx.students[1].clone();

    let setup = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({ "section": "statusGrades", "patch": { "importPolicy": "reject_batch" } }),
    );
    assert_eq!(setup["statusGrades"]["importPolicy"].as_str(), Some("reject_batch"));

    let mixed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "statusGrades.apply",
        json!({
            "courseId": fx.course_id,
            "rows": [
                { "registerNo": "REG002", "newGrade": "AAA" },
                { "registerNo": "REG003", "newGrade": "Very Good" },
                { "studentName": "no register number" }
            ]
        }),
    );
    assert_eq!(mixed["applied"].as_bool(), Some(false));
    assert_eq!(mixed["policy"].as_str(), Some("reject_batch"));
    let codes: Vec<&str> = mixed["issues"]
        .as_array()
        .expect("issues")
        .iter()
        .filter_map(|i| i["code"].as_str())
        .collect();
    assert_eq!(codes, vec!["invalid_status_grade", "bad_row"]);
    assert_eq!(status_of(&mut stdin, &mut reader, "3", &s2), None);

    let clean = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "statusGrades.apply",
        json!({
            "courseId": fx.course_id,
            "rows": [{ "registerNo": "REG002", "newGrade": " AAA " }]
        }),
    );
    assert_eq!(clean["applied"].as_bool(), Some(true));
    assert_eq!(clean["updated"].as_u64(), Some(1));
    assert_eq!(status_of(&mut stdin, &mut reader, "5", &s2).as_deref(), Some("AAA"));

    let bad_sheet = fx.workspace.join("bad.csv");
    std::fs::write(&bad_sheet, "Reg,Name\nREG002,Divya\n").expect("write");
    let bad = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "statusGrades.preview",
        json!({ "courseId": fx.course_id, "inPath": bad_sheet.to_string_lossy() }),
    );
    assert_eq!(bad["rowsParsed"].as_u64(), Some(0));
    assert_eq!(bad["issues"][0]["code"].as_str(), Some("bad_header"));

    let bad_policy = request(
        &mut stdin,
        &mut reader,
        "7",
        "statusGrades.apply",
        json!({ "courseId": fx.course_id, "rows": [], "policy": "sometimes" }),
    );
    assert_eq!(error_code(&bad_policy), "bad_params");
    let no_input = request(
        &mut stdin,
        &mut reader,
        "8",
        "statusGrades.preview",
        json!({ "courseId": fx.course_id }),
    );
    assert_eq!(error_code(&no_input), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn register_number_repeated_in_other_case_is_a_duplicate() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, "coed-status-dup-case");
    let s1 = fx.students[0].clone();
    let rows = json!([
        { "registerNo": "REG001", "newGrade": "Commended" },
        { "registerNo": "reg001", "newGrade": "AAA" }
    ]);

    let strict = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "statusGrades.apply",
        json!({ "courseId": fx.course_id, "rows": rows, "policy": "reject_batch" }),
    );
    assert_eq!(strict["applied"].as_bool(), Some(false));
    assert_eq!(strict["issues"][0]["code"].as_str(), Some("duplicate_register_no"));
    assert_eq!(status_of(&mut stdin, &mut reader, "2", &s1), None);

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "statusGrades.apply",
        json!({ "courseId": fx.course_id, "rows": rows }),
    );
    assert_eq!(applied["applied"].as_bool(), Some(true));
    assert_eq!(applied["updated"].as_u64(), Some(1));
    assert_eq!(applied["rejected"].as_u64(), Some(1));
    assert_eq!(applied["issues"][0]["line"].as_u64(), Some(2));
    assert_eq!(applied["issues"][0]["code"].as_str(), Some("duplicate_register_no"));
    assert_eq!(
        status_of(&mut stdin, &mut reader, "4", &s1).as_deref(),
        Some("Commended")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}
