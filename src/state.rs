//! Persisted system state: JSON on disk, one file per save, old backups
//! cleaned up by age. Grounded on the teacher's `save_schedule`/
//! `save_base_data`/`clean_up_files` trio (`serde_json::to_string_pretty` +
//! `fs::write`, then a glob sweep of same-pattern files older than a cutoff).

use std::fs;

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use glob::glob;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StateError;
use crate::interfaces::AdminOutputMode;
use crate::models::{History, StateReason, SystemState};

const SCHEMA_VERSION: u32 = 1;
const STATE_FILE_TYPE: &str = "PowerController";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedOutputState {
    pub name: String,
    pub system_state: SystemState,
    pub is_on: bool,
    pub last_changed: Option<DateTime<Local>>,
    pub reason: StateReason,
    pub app_mode: AdminOutputMode,
    pub app_mode_revert_time: Option<DateTime<Local>>,
    pub history: History,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedState {
    pub schema_version: u32,
    pub state_file_type: String,
    pub device_name: String,
    pub save_time: DateTime<Local>,
    pub outputs: Vec<SavedOutputState>,
}

impl SavedState {
    pub fn new(device_name: String, outputs: Vec<SavedOutputState>, now: DateTime<Local>) -> Self {
        SavedState {
            schema_version: SCHEMA_VERSION,
            state_file_type: STATE_FILE_TYPE.to_string(),
            device_name,
            save_time: now,
            outputs,
        }
    }
}

/// Writes `state` to `<dir>/<timestamp>_state.json`, tagging every
/// date/datetime/time-shaped string value with a `<key>__datatype` sibling,
/// then removes backups in the same directory older than `max_age_hours`.
pub fn save_state(dir: &str, state: &SavedState, max_age_hours: i64) -> Result<(), StateError> {
    let mut value = serde_json::to_value(state)?;
    tag_datetime_fields(&mut value);
    let json = serde_json::to_string_pretty(&value)?;

    let filename = format!("{}/{}_state.json", dir.trim_end_matches('/'), state.save_time.format("%Y%m%d%H%M%S"));
    fs::write(&filename, json)?;
    info!("state saved to {}", filename);

    clean_up_backups(dir, state.save_time, max_age_hours)?;
    Ok(())
}

/// Loads the most recently written state file in `dir`, if any.
pub fn load_latest_state(dir: &str) -> Result<Option<SavedState>, StateError> {
    let pattern = format!("{}/*_state.json", dir.trim_end_matches('/'));
    let mut paths: Vec<_> = glob(&pattern)?.filter_map(Result::ok).collect();
    paths.sort();

    let Some(path) = paths.last() else {
        return Ok(None);
    };

    let raw = fs::read_to_string(path)?;
    let mut value: Value = serde_json::from_str(&raw)?;
    strip_datatype_fields(&mut value);
    let state: SavedState = serde_json::from_value(value)?;
    Ok(Some(state))
}

fn clean_up_backups(dir: &str, gate: DateTime<Local>, max_age_hours: i64) -> Result<(), StateError> {
    let pattern = format!("{}/*_state.json", dir.trim_end_matches('/'));
    for entry in glob(&pattern)? {
        let path = entry?;
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Some(ts) = stem.strip_suffix("_state") {
                if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S") {
                    let written = naive.and_local_timezone(Local).single().unwrap_or(gate);
                    if (gate - written).num_hours() > max_age_hours {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Walks a JSON value recursively; for every object field whose string value
/// parses as a date/time/datetime, inserts a `<key>__datatype` sibling
/// carrying which one, so a non-Rust reader can round-trip typed values
/// through plain JSON.
fn tag_datetime_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut tags = Vec::new();
            for (key, v) in map.iter() {
                if let Value::String(s) = v {
                    if let Some(kind) = classify(s) {
                        tags.push((format!("{}__datatype", key), kind));
                    }
                }
            }
            for (key, kind) in tags {
                map.insert(key, Value::String(kind.to_string()));
            }
            for v in map.values_mut() {
                tag_datetime_fields(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                tag_datetime_fields(item);
            }
        }
        _ => {}
    }
}

fn strip_datatype_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !k.ends_with("__datatype"));
            for v in map.values_mut() {
                strip_datatype_fields(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_datatype_fields(item);
            }
        }
        _ => {}
    }
}

fn classify(s: &str) -> Option<&'static str> {
    if DateTime::parse_from_rfc3339(s).is_ok() {
        Some("datetime")
    } else if s.parse::<NaiveDate>().is_ok() {
        Some("date")
    } else if s.parse::<NaiveTime>().is_ok() {
        Some("time")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datatype_tags_round_trip() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let state = SavedState::new("test-device".into(), vec![], now);

        let mut value = serde_json::to_value(&state).unwrap();
        tag_datetime_fields(&mut value);
        assert!(value.get("save_time__datatype").is_some());

        strip_datatype_fields(&mut value);
        assert!(value.get("save_time__datatype").is_none());
        let restored: SavedState = serde_json::from_value(value).unwrap();
        assert_eq!(restored.device_name, "test-device");
        assert_eq!(restored.save_time, now);
    }

    #[test]
    fn classify_distinguishes_date_time_datetime() {
        assert_eq!(classify("2026-01-10"), Some("date"));
        assert_eq!(classify("12:30:00"), Some("time"));
        assert_eq!(classify("2026-01-10T12:30:00+01:00"), Some("datetime"));
        assert_eq!(classify("not-a-date"), None);
    }
}
