use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    StatusGrades,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "statusGrades" => Some(Self::StatusGrades),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::StatusGrades => "setup.statusGrades",
        }
    }
}

/// What a bulk status-grade apply does when some rows are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Write the valid rows, report the rest.
    SkipInvalid,
    /// Write nothing unless every row is valid.
    RejectBatch,
}

impl ImportPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip_invalid" => Some(Self::SkipInvalid),
            "reject_batch" => Some(Self::RejectBatch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkipInvalid => "skip_invalid",
            Self::RejectBatch => "reject_batch",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "defaultRegulationId": null
        }),
        SetupSection::StatusGrades => json!({
            "importPolicy": "skip_invalid"
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "defaultRegulationId" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 64)?);
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::StatusGrades => match k.as_str() {
                "importPolicy" => {
                    let raw = parse_string_max(v, k, 24)?;
                    let Some(policy) = ImportPolicy::parse(&raw) else {
                        return Err("importPolicy must be one of: skip_invalid, reject_batch".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                _ => return Err(format!("unknown statusGrades field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.key(), error = %e, "ignoring stored setup value");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

pub fn default_regulation_id(conn: &Connection) -> anyhow::Result<Option<String>> {
    let grading = load_section(conn, SetupSection::Grading)?;
    Ok(grading
        .get("defaultRegulationId")
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

pub fn import_policy(conn: &Connection) -> anyhow::Result<ImportPolicy> {
    let section = load_section(conn, SetupSection::StatusGrades)?;
    Ok(section
        .get("importPolicy")
        .and_then(|v| v.as_str())
        .and_then(ImportPolicy::parse)
        .unwrap_or(ImportPolicy::SkipInvalid))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let status_grades = match load_section(conn, SetupSection::StatusGrades) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "statusGrades": status_grades
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }

    if let Some(id) = current.get("defaultRegulationId").and_then(|v| v.as_str()) {
        match db::regulation_exists(conn, id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "regulation not found",
                    Some(json!({ "regulationId": id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup updated");
    let mut result = json!({ "ok": true });
    result[section_raw] = current;
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
