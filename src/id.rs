use crate::model::{CREATED_KEY, META_FIELD, Record, Snapshot, TIMESTAMP_KEY, UID_KEY};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::warn;

const HEX: &[u8] = b"0123456789abcdef";

/// Lowercase hex in the 8-4-4-4-12 layout of a UUID.
fn to_uuid_layout(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(36);
    for (i, byte) in bytes.iter().take(16).enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            result.push('-');
        }
        result.push(HEX[(byte >> 4) as usize] as char);
        result.push(HEX[(byte & 0x0f) as usize] as char);
    }
    result
}

pub fn generate_uid(seed: &str, existing: &HashSet<String>) -> String {
    for nonce in 0u32.. {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        let uid = to_uuid_layout(&hasher.finalize());
        if !existing.contains(&uid) {
            return uid;
        }
    }
    unreachable!()
}

/// Current instant in the form revision timestamps use, e.g. `2024-01-02T15:00:00Z`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Give every record a stable identity and revision timestamps where they
/// are missing. Returns how many records were changed.
pub fn stamp(snapshot: &mut Snapshot, now: &str) -> usize {
    let mut existing: HashSet<String> = snapshot
        .iter()
        .filter_map(|r| r.uid().map(str::to_string))
        .collect();
    let mut changed = 0;

    for record in snapshot.records_mut() {
        if stamp_record(record, now, &mut existing) {
            changed += 1;
        }
    }
    changed
}

fn stamp_record(record: &mut Record, now: &str, existing: &mut HashSet<String>) -> bool {
    let seed = record
        .short_id()
        .map(str::to_string)
        .unwrap_or_else(|| serde_json::to_string(record.fields()).unwrap_or_default());
    let has_uid = record.uid().is_some();

    let meta = record
        .fields_mut()
        .entry(META_FIELD)
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = meta.as_object_mut() else {
        warn!(field = META_FIELD, "metadata field is not an object, leaving record unstamped");
        return false;
    };

    let mut changed = false;
    if !has_uid {
        let uid = generate_uid(&seed, existing);
        existing.insert(uid.clone());
        meta.insert(UID_KEY.to_string(), Value::String(uid));
        changed = true;
    }
    if !meta.get(CREATED_KEY).is_some_and(Value::is_string) {
        meta.insert(CREATED_KEY.to_string(), Value::String(now.to_string()));
        changed = true;
    }
    if !meta.get(TIMESTAMP_KEY).is_some_and(Value::is_string) {
        let created = meta.get(CREATED_KEY).cloned().unwrap_or(Value::String(now.to_string()));
        meta.insert(TIMESTAMP_KEY.to_string(), created);
        changed = true;
    }
    changed
}
