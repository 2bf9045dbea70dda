use crate::grading::{GradeBand, GradingScale};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("coed.sqlite3");
    let conn = Connection::open(&db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    tracing::debug!(path = %db_path.display(), "opened workspace database");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS regulations(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            regulation_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            min_percentage REAL NOT NULL,
            max_percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            grade_point REAL NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(regulation_id) REFERENCES regulations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_regulation ON grade_bands(regulation_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            register_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            batch TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before batches were tracked lack this column.
    ensure_students_batch(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            credits REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            marks_obtained REAL,
            max_marks REAL,
            status_grade TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_registrations_student ON exam_registrations(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_registrations_course ON exam_registrations(course_id)",
        [],
    )?;

    Ok(conn)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn regulation_exists(conn: &Connection, regulation_id: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM regulations WHERE id = ?",
            [regulation_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Bands of a regulation in stored order; `None` when the regulation is unknown.
pub fn load_regulation_scale(
    conn: &Connection,
    regulation_id: &str,
) -> anyhow::Result<Option<GradingScale>> {
    if !regulation_exists(conn, regulation_id)? {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT min_percentage, max_percentage, grade, grade_point, description
         FROM grade_bands
         WHERE regulation_id = ?
         ORDER BY sort_order",
    )?;
    let bands = stmt
        .query_map([regulation_id], |r| {
            Ok(GradeBand {
                min_percentage: r.get(0)?,
                max_percentage: r.get(1)?,
                grade: r.get(2)?,
                grade_point: r.get(3)?,
                description: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(GradingScale::new(bands)))
}

/// Replaces every band of a regulation. Callers own the transaction.
pub fn replace_regulation_bands(
    conn: &Connection,
    regulation_id: &str,
    scale: &GradingScale,
) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM grade_bands WHERE regulation_id = ?",
        [regulation_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO grade_bands(id, regulation_id, sort_order, min_percentage, max_percentage, grade, grade_point, description)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (i, band) in scale.bands().iter().enumerate() {
        stmt.execute((
            Uuid::new_v4().to_string(),
            regulation_id,
            i as i64,
            band.min_percentage,
            band.max_percentage,
            band.grade.trim(),
            band.grade_point,
            &band.description,
        ))?;
    }
    Ok(())
}

fn ensure_students_batch(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "batch")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN batch TEXT", [])?;
    tracing::info!("migrated students table: added batch column");
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
