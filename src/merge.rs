use crate::model::*;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// An identity plus its occurrence within one snapshot. Records sharing an
/// identity (typically a citation key reused without a uuid) are matched
/// across snapshots by position among their namesakes, so none is dropped.
type Slot = (IdentityKey, usize);

/// Identity-keyed view of one snapshot. Borrows the records; the snapshot is
/// never modified.
struct Index<'a> {
    order: Vec<Slot>,
    by_slot: HashMap<Slot, &'a Record>,
}

impl<'a> Index<'a> {
    fn build(label: &str, snapshot: &'a Snapshot) -> Self {
        let mut order = Vec::with_capacity(snapshot.len());
        let mut by_slot = HashMap::with_capacity(snapshot.len());
        let mut occurrences: HashMap<IdentityKey, usize> = HashMap::new();
        for record in snapshot {
            let key = record.identity();
            let occurrence = occurrences.entry(key.clone()).or_insert(0);
            if *occurrence > 0 {
                warn!(
                    snapshot = label,
                    identity = %key,
                    occurrence = *occurrence,
                    "duplicate identity, matching by occurrence"
                );
            } else if key.is_degraded() {
                debug!(snapshot = label, identity = %key, "record has no stable identity");
            }
            let slot = (key, *occurrence);
            *occurrence += 1;
            order.push(slot.clone());
            by_slot.insert(slot, record);
        }
        Index { order, by_slot }
    }

    fn get(&self, slot: &Slot) -> Option<&'a Record> {
        self.by_slot.get(slot).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Three-way reconciliation of `local` and `remote` against their common
/// ancestor `base`.
///
/// Additions on one side are kept. A deletion on either side wins over the
/// other side's copy. Records present everywhere are merged field by field;
/// a field both sides changed differently goes to the newer revision, and is
/// reported as a conflict unless it is revision bookkeeping (`custom.uuid`,
/// `custom.timestamp`, `custom.created_at`).
///
/// Pure and infallible: the same inputs always produce the same result.
pub fn merge(
    base: &Snapshot,
    local: &Snapshot,
    remote: &Snapshot,
    options: &MergeOptions,
) -> MergeResult {
    let base_idx = Index::build("base", base);
    let local_idx = Index::build("local", local);
    let remote_idx = Index::build("remote", remote);

    // Union of identities in order of first appearance: local, remote, base.
    let mut seen: HashSet<&Slot> = HashSet::new();
    let slots: Vec<&Slot> = local_idx
        .order
        .iter()
        .chain(remote_idx.order.iter())
        .chain(base_idx.order.iter())
        .filter(|slot| seen.insert(*slot))
        .collect();

    let mut result = MergeResult {
        status: MergeStatus::Success,
        merged: Vec::new(),
        conflicts: Vec::new(),
        local_only: Vec::new(),
        remote_only: Vec::new(),
        deleted_in_local: Vec::new(),
        deleted_in_remote: Vec::new(),
    };

    for slot in slots {
        let key = &slot.0;
        match (base_idx.get(slot), local_idx.get(slot), remote_idx.get(slot)) {
            (Some(base_rec), Some(local_rec), Some(remote_rec)) => {
                let (record, conflict) = merge_records(key, base_rec, local_rec, remote_rec, options);
                result.merged.push(record);
                result.conflicts.extend(conflict);
            }
            // Added independently on both sides under the same identity
            (None, Some(local_rec), Some(remote_rec)) => {
                if local_rec == remote_rec {
                    debug!(identity = %key, "identical dual addition");
                    result.merged.push(local_rec.clone());
                } else {
                    debug!(identity = %key, "diverging dual addition, merging against empty base");
                    let synthetic = Record::synthetic(key);
                    let (record, conflict) =
                        merge_records(key, &synthetic, local_rec, remote_rec, options);
                    result.merged.push(record);
                    result.conflicts.extend(conflict);
                }
            }
            (None, Some(local_rec), None) => {
                debug!(identity = %key, "added in local");
                result.merged.push(local_rec.clone());
                result.local_only.push(local_rec.clone());
            }
            (None, None, Some(remote_rec)) => {
                debug!(identity = %key, "added in remote");
                result.merged.push(remote_rec.clone());
                result.remote_only.push(remote_rec.clone());
            }
            // Deletion is not field-mergeable: it wins even over an edit.
            (Some(base_rec), None, Some(remote_rec)) => {
                if remote_rec != base_rec {
                    warn!(identity = %key, "deleted in local but modified in remote, dropping");
                } else {
                    debug!(identity = %key, "deleted in local");
                }
                result.deleted_in_local.push(base_rec.clone());
            }
            (Some(base_rec), Some(local_rec), None) => {
                if local_rec != base_rec {
                    warn!(identity = %key, "deleted in remote but modified in local, dropping");
                } else {
                    debug!(identity = %key, "deleted in remote");
                }
                result.deleted_in_remote.push(base_rec.clone());
            }
            (Some(base_rec), None, None) => {
                debug!(identity = %key, "deleted on both sides");
                result.deleted_in_local.push(base_rec.clone());
                result.deleted_in_remote.push(base_rec.clone());
            }
            // Not in any: impossible given how keys were collected
            (None, None, None) => {}
        }
    }

    result.status = MergeResult::status_of(&result.conflicts);
    info!(
        status = %result.status,
        merged = result.merged.len(),
        conflicts = result.conflicts.len(),
        local_only = result.local_only.len(),
        remote_only = result.remote_only.len(),
        deleted_in_local = result.deleted_in_local.len(),
        deleted_in_remote = result.deleted_in_remote.len(),
        "merge finished"
    );
    result
}

/// Field-level three-way merge of one record. Returns the merged record and,
/// if any content field was contested, the conflict describing it.
fn merge_records(
    identity: &IdentityKey,
    base: &Record,
    local: &Record,
    remote: &Record,
    options: &MergeOptions,
) -> (Record, Option<ItemConflict>) {
    if local == remote || remote == base {
        return (local.clone(), None);
    }
    if local == base {
        return (remote.clone(), None);
    }

    let local_ts = local.timestamp();
    let remote_ts = remote.timestamp();
    let winner = pick_side(&local_ts, &remote_ts, options);

    let mut fields = Vec::new();
    let merged = merge_fields(
        None,
        base.fields(),
        local.fields(),
        remote.fields(),
        winner,
        &mut fields,
    );

    let record = Record::new(merged);
    if fields.is_empty() {
        return (record, None);
    }

    let resolution = classify(&local_ts, &remote_ts, options);
    debug!(identity = %identity, fields = fields.len(), %resolution, "field conflict");
    let conflict = ItemConflict {
        identity: identity.clone(),
        short_id: local.short_id().or(remote.short_id()).map(str::to_string),
        fields,
        local_timestamp: local_ts,
        remote_timestamp: remote_ts,
        resolution,
    };
    (record, Some(conflict))
}

/// Three-way merge of one JSON object. Contested keys go to `winner` and are
/// recorded in `conflicts`, except bookkeeping keys of the metadata object.
/// The metadata object itself is merged key by key, so user content stored
/// there (tags, notes) is contested like any other field.
fn merge_fields(
    parent: Option<&str>,
    base: &Map<String, Value>,
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    winner: Side,
    conflicts: &mut Vec<FieldConflict>,
) -> Map<String, Value> {
    let names: BTreeSet<&String> = base
        .keys()
        .chain(local.keys())
        .chain(remote.keys())
        .collect();

    let mut merged = Map::new();
    for name in names {
        let base_val = base.get(name);
        let local_val = local.get(name);
        let remote_val = remote.get(name);

        let value = if local_val == base_val {
            remote_val.cloned()
        } else if remote_val == base_val || local_val == remote_val {
            local_val.cloned()
        } else if let Some((b, l, r)) = nested_meta(parent, name, base_val, local_val, remote_val)
        {
            Some(Value::Object(merge_fields(
                Some(name.as_str()),
                &b,
                &l,
                &r,
                winner,
                conflicts,
            )))
        } else {
            let chosen = match winner {
                Side::Local => local_val,
                Side::Remote => remote_val,
            };
            if !is_bookkeeping(parent, name) {
                conflicts.push(FieldConflict {
                    field: match parent {
                        Some(parent) => format!("{parent}.{name}"),
                        None => name.clone(),
                    },
                    base: base_val.cloned(),
                    local: local_val.cloned(),
                    remote: remote_val.cloned(),
                    resolved: chosen.cloned(),
                });
            }
            chosen.cloned()
        };

        if let Some(value) = value {
            merged.insert(name.clone(), value);
        }
    }
    merged
}

type MetaMaps = (Map<String, Value>, Map<String, Value>, Map<String, Value>);

/// The three sides of the top-level metadata field as objects, an absent
/// side counting as empty. `None` for any other field, or when a side holds
/// something other than an object.
fn nested_meta(
    parent: Option<&str>,
    name: &str,
    base: Option<&Value>,
    local: Option<&Value>,
    remote: Option<&Value>,
) -> Option<MetaMaps> {
    if parent.is_some() || name != META_FIELD {
        return None;
    }
    let as_map = |value: Option<&Value>| match value {
        None => Some(Map::new()),
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => None,
    };
    Some((as_map(base)?, as_map(local)?, as_map(remote)?))
}

fn is_bookkeeping(parent: Option<&str>, name: &str) -> bool {
    parent == Some(META_FIELD) && [UID_KEY, TIMESTAMP_KEY, CREATED_KEY].contains(&name)
}

/// Last-write-wins. Equal timestamps defer to the tie preference, and
/// provisionally to local when there is none.
fn pick_side(local_ts: &Timestamp, remote_ts: &Timestamp, options: &MergeOptions) -> Side {
    match local_ts.cmp(remote_ts) {
        Ordering::Greater => Side::Local,
        Ordering::Less => Side::Remote,
        Ordering::Equal => match options.prefer_on_tie {
            Some(TiePreference::Remote) => Side::Remote,
            Some(TiePreference::Local) | None => Side::Local,
        },
    }
}

fn classify(local_ts: &Timestamp, remote_ts: &Timestamp, options: &MergeOptions) -> Resolution {
    if local_ts != remote_ts {
        return Resolution::AutoLww;
    }
    match options.prefer_on_tie {
        Some(TiePreference::Local) => Resolution::PreferLocal,
        Some(TiePreference::Remote) => Resolution::PreferRemote,
        None => Resolution::Unresolved,
    }
}
