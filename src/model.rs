use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Top-level field holding the human-readable citation key.
pub const SHORT_ID_FIELD: &str = "id";
/// Top-level object holding revision bookkeeping (and possibly user extras
/// such as tags) for a record.
pub const META_FIELD: &str = "custom";
pub const UID_KEY: &str = "uuid";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const CREATED_KEY: &str = "created_at";

/// One bibliographic entry. Schemaless: any key may appear on any record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Record(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The citation key, if it is a non-empty string.
    pub fn short_id(&self) -> Option<&str> {
        non_empty_str(self.0.get(SHORT_ID_FIELD))
    }

    /// The revision metadata object, if present and well-formed.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.0.get(META_FIELD).and_then(Value::as_object)
    }

    /// The stable identity key, if it is a non-empty string.
    pub fn uid(&self) -> Option<&str> {
        self.meta().and_then(|m| non_empty_str(m.get(UID_KEY)))
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::of(self)
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::of(self)
    }

    /// Placeholder ancestor for a record added independently on both sides:
    /// carries nothing but the identity, and so has the oldest timestamp.
    pub(crate) fn synthetic(identity: &IdentityKey) -> Record {
        let mut fields = Map::new();
        match identity {
            IdentityKey::Stable(uid) => {
                let mut meta = Map::new();
                meta.insert(UID_KEY.to_string(), Value::String(uid.clone()));
                fields.insert(META_FIELD.to_string(), Value::Object(meta));
            }
            IdentityKey::Fallback(id) => {
                fields.insert(SHORT_ID_FIELD.to_string(), Value::String(id.clone()));
            }
            IdentityKey::Digest(_) => {}
        }
        Record(fields)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Record(fields)
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Key used to match the "same" record across snapshots.
///
/// `Stable` is the normal case. The other variants are degraded matching:
/// `Fallback` relies on the citation key, which unrelated records may share,
/// and `Digest` only ever matches a byte-identical copy of the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKey {
    Stable(String),
    Fallback(String),
    Digest(String),
}

impl IdentityKey {
    pub fn of(record: &Record) -> Self {
        if let Some(uid) = record.uid() {
            return IdentityKey::Stable(uid.to_string());
        }
        if let Some(id) = record.short_id() {
            return IdentityKey::Fallback(id.to_string());
        }
        // Map serialization is key-sorted, so this is canonical.
        let canonical = serde_json::to_string(record.fields()).unwrap_or_default();
        IdentityKey::Digest(format!("{:x}", Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        match self {
            IdentityKey::Stable(s) | IdentityKey::Fallback(s) | IdentityKey::Digest(s) => s,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, IdentityKey::Stable(_))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Stable(uid) => write!(f, "{uid}"),
            IdentityKey::Fallback(id) => write!(f, "id:{id}"),
            IdentityKey::Digest(hash) => {
                write!(f, "sha256:{}", hash.chars().take(12).collect::<String>())
            }
        }
    }
}

/// Revision instant as an ISO-8601 UTC string. Ordering is lexicographic,
/// which matches chronological order for zero-padded UTC instants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Sorts before every real instant.
    pub const MIN: Timestamp = Timestamp(String::new());

    pub fn new(instant: impl Into<String>) -> Self {
        Timestamp(instant.into())
    }

    /// `custom.timestamp`, else `custom.created_at`, else [`Timestamp::MIN`].
    pub fn of(record: &Record) -> Self {
        let Some(meta) = record.meta() else {
            return Timestamp::MIN;
        };
        meta.get(TIMESTAMP_KEY)
            .and_then(Value::as_str)
            .or_else(|| meta.get(CREATED_KEY).and_then(Value::as_str))
            .map(Timestamp::new)
            .unwrap_or(Timestamp::MIN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Which side wins when both revision timestamps are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePreference {
    Local,
    Remote,
}

impl fmt::Display for TiePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TiePreference::Local => write!(f, "local"),
            TiePreference::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for TiePreference {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(TiePreference::Local),
            "remote" => Ok(TiePreference::Remote),
            _ => Err(format!("unknown tie preference: {s} (valid: local, remote)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOptions {
    pub prefer_on_tie: Option<TiePreference>,
}

impl MergeOptions {
    pub fn prefer_on_tie(side: TiePreference) -> Self {
        MergeOptions {
            prefer_on_tie: Some(side),
        }
    }
}

/// How an item conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// One side had a strictly newer timestamp.
    AutoLww,
    PreferLocal,
    PreferRemote,
    /// Equal timestamps and no preference; the merged value is provisional.
    Unresolved,
}

impl Resolution {
    pub fn is_unresolved(self) -> bool {
        matches!(self, Resolution::Unresolved)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::AutoLww => write!(f, "auto-lww"),
            Resolution::PreferLocal => write!(f, "prefer-local"),
            Resolution::PreferRemote => write!(f, "prefer-remote"),
            Resolution::Unresolved => write!(f, "unresolved"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Success,
    AutoResolved,
    Conflict,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Success => write!(f, "success"),
            MergeStatus::AutoResolved => write!(f, "auto-resolved"),
            MergeStatus::Conflict => write!(f, "conflict"),
        }
    }
}

/// One field that both sides changed to different values.
///
/// `None` means the field is absent on that side (distinct from JSON `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConflict {
    pub identity: IdentityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub fields: Vec<FieldConflict>,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    pub resolution: Resolution,
}

/// An ordered collection of records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: Vec<Record>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Snapshot { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }
}

impl From<Vec<Record>> for Snapshot {
    fn from(records: Vec<Record>) -> Self {
        Snapshot { records }
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Snapshot {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub status: MergeStatus,
    pub merged: Vec<Record>,
    pub conflicts: Vec<ItemConflict>,
    pub local_only: Vec<Record>,
    pub remote_only: Vec<Record>,
    pub deleted_in_local: Vec<Record>,
    pub deleted_in_remote: Vec<Record>,
}

impl MergeResult {
    /// `Conflict` if anything is unresolved, `AutoResolved` if there were
    /// conflicts that policy settled, `Success` otherwise.
    pub fn status_of(conflicts: &[ItemConflict]) -> MergeStatus {
        if conflicts.is_empty() {
            MergeStatus::Success
        } else if conflicts.iter().any(|c| c.resolution.is_unresolved()) {
            MergeStatus::Conflict
        } else {
            MergeStatus::AutoResolved
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ItemConflict> {
        self.conflicts.iter().filter(|c| c.resolution.is_unresolved())
    }

    pub fn merged_snapshot(&self) -> Snapshot {
        Snapshot::new(self.merged.clone())
    }

    pub fn into_snapshot(self) -> Snapshot {
        Snapshot::new(self.merged)
    }
}
