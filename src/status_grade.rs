use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Column headers of the bulk status-grade sheet, in order.
pub const SHEET_COLUMNS: [&str; 4] = ["Register No", "Student Name", "Current Grade", "New Grade"];

/// Categorical override recorded on an exam registration. It never feeds CGPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusGrade {
    #[serde(rename = "Commended")]
    Commended,
    #[serde(rename = "Highly Commended")]
    HighlyCommended,
    /// Absent / disqualified.
    #[serde(rename = "AAA")]
    Aaa,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatusGradeError {
    #[error("status grade must not be empty")]
    Empty,
    #[error("`{0}` is not a valid status grade; expected one of: Commended, Highly Commended, AAA")]
    Unknown(String),
}

impl StatusGradeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "missing_status_grade",
            Self::Unknown(_) => "invalid_status_grade",
        }
    }
}

impl StatusGrade {
    pub const ALL: [StatusGrade; 3] = [Self::Commended, Self::HighlyCommended, Self::Aaa];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commended => "Commended",
            Self::HighlyCommended => "Highly Commended",
            Self::Aaa => "AAA",
        }
    }

    /// Exact match on the canonical label; surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self, StatusGradeError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(StatusGradeError::Empty);
        }
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == value)
            .ok_or_else(|| StatusGradeError::Unknown(value.to_string()))
    }

    /// Badge tone the UI uses when listing the grade.
    pub fn badge(self) -> &'static str {
        match self {
            Self::Commended => "info",
            Self::HighlyCommended => "success",
            Self::Aaa => "danger",
        }
    }

    pub fn is_absent(self) -> bool {
        match self {
            Self::Aaa => true,
            Self::Commended | Self::HighlyCommended => false,
        }
    }
}

impl fmt::Display for StatusGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusGrade {
    type Err = StatusGradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn is_valid_status_grade(value: &str) -> bool {
    StatusGrade::parse(value).is_ok()
}

/// One row of the bulk sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusGradeRow {
    pub register_no: String,
    #[serde(default)]
    pub student_name: String,
    #[serde(default)]
    pub current_grade: String,
    #[serde(default)]
    pub new_grade: String,
}

/// A row together with where it came from (1-based row index or file line).
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub line: usize,
    pub row: StatusGradeRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub line: usize,
    pub register_no: String,
    pub grade: StatusGrade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIssue {
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_no: Option<String>,
    pub code: &'static str,
    pub message: String,
}

impl RowIssue {
    pub fn new(line: usize, register_no: Option<&str>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            line,
            register_no: register_no.map(str::to_string),
            code,
            message: message.into(),
        }
    }
}

/// Splits rows into writable ones and row-level rejections.
/// A register number repeated within one batch is rejected after its first row;
/// register numbers compare case-insensitively and come back uppercased.
pub fn validate_rows(rows: &[ImportRow]) -> (Vec<ValidatedRow>, Vec<RowIssue>) {
    let mut valid = Vec::new();
    let mut issues = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for ImportRow { line, row } in rows {
        let register_no = row.register_no.trim();
        if register_no.is_empty() {
            issues.push(RowIssue::new(
                *line,
                None,
                "missing_register_no",
                "Register No must not be empty",
            ));
            continue;
        }
        let grade = match StatusGrade::parse(&row.new_grade) {
            Ok(g) => g,
            Err(e) => {
                issues.push(RowIssue::new(*line, Some(register_no), e.code(), e.to_string()));
                continue;
            }
        };
        let key = register_no.to_ascii_uppercase();
        if let Some(first) = seen.get(&key) {
            issues.push(RowIssue::new(
                *line,
                Some(register_no),
                "duplicate_register_no",
                format!("Register No already appears on line {}", first),
            ));
            continue;
        }
        seen.insert(key.clone(), *line);
        valid.push(ValidatedRow {
            line: *line,
            register_no: key,
            grade,
        });
    }

    (valid, issues)
}

/// Sheet records are one line each, so embedded line breaks become spaces.
fn csv_quote(s: &str) -> String {
    let s = s.replace("\r\n", " ").replace(['\r', '\n'], " ");
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

pub fn rows_to_csv(rows: &[StatusGradeRow]) -> String {
    let mut csv = SHEET_COLUMNS.join(",");
    csv.push('\n');
    for r in rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csv_quote(&r.register_no),
            csv_quote(&r.student_name),
            csv_quote(&r.current_grade),
            csv_quote(&r.new_grade),
        ));
    }
    csv
}

/// Parses a sheet written by [`rows_to_csv`] (or edited by hand).
/// Line numbers in the result are 1-based file lines.
pub fn rows_from_csv(text: &str) -> (Vec<ImportRow>, Vec<RowIssue>) {
    let mut rows = Vec::new();
    let mut issues = Vec::new();
    let mut lines = text.lines().enumerate();

    let header_ok = lines
        .next()
        .map(|(_, h)| {
            let fields = parse_csv_record(h.trim_start_matches('\u{feff}'));
            fields.len() >= SHEET_COLUMNS.len()
                && fields
                    .iter()
                    .zip(SHEET_COLUMNS)
                    .all(|(got, want)| got.trim().eq_ignore_ascii_case(want))
        })
        .unwrap_or(false);
    if !header_ok {
        issues.push(RowIssue::new(
            1,
            None,
            "bad_header",
            format!("expected header: {}", SHEET_COLUMNS.join(",")),
        ));
        return (rows, issues);
    }

    for (idx, raw_line) in lines {
        let line_no = idx + 1;
        if raw_line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(raw_line);
        let [register_no, student_name, current_grade, new_grade] = fields.as_slice() else {
            issues.push(RowIssue::new(
                line_no,
                None,
                "bad_columns",
                format!(
                    "expected {} CSV columns, found {}",
                    SHEET_COLUMNS.len(),
                    fields.len()
                ),
            ));
            continue;
        };
        rows.push(ImportRow {
            line: line_no,
            row: StatusGradeRow {
                register_no: register_no.trim().to_string(),
                student_name: student_name.trim().to_string(),
                current_grade: current_grade.trim().to_string(),
                new_grade: new_grade.trim().to_string(),
            },
        });
    }

    (rows, issues)
}
