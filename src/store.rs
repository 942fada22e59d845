use crate::error::{Error, Result};
use crate::model::{Record, Snapshot};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn from_json(json: &str) -> Result<Snapshot> {
    let entries = match serde_json::from_str(json)? {
        Value::Array(entries) => entries,
        other => {
            return Err(Error::NotAnArray {
                found: kind_of(&other),
            });
        }
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::Object(fields) => Ok(Record::new(fields)),
            other => Err(Error::NotAnObject {
                index,
                found: kind_of(&other),
            }),
        })
        .collect()
}

pub fn to_json(snapshot: &Snapshot) -> Result<String> {
    let mut json = serde_json::to_string_pretty(snapshot)?;
    json.push('\n');
    Ok(json)
}

pub fn load(path: &Path) -> Result<Snapshot> {
    let json = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let snapshot = from_json(&json).map_err(|e| e.in_file(path))?;
    debug!(path = %path.display(), records = snapshot.len(), "loaded snapshot");
    Ok(snapshot)
}

/// Like [`load`], but a missing file is an empty snapshot. The first
/// synchronisation has no common ancestor yet.
pub fn load_or_empty(path: &Path) -> Result<Snapshot> {
    match fs::read_to_string(path) {
        Ok(json) => from_json(&json).map_err(|e| e.in_file(path)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot yet, starting from empty");
            Ok(Snapshot::default())
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = to_json(snapshot)?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    debug!(path = %path.display(), records = snapshot.len(), "saved snapshot");
    Ok(())
}
