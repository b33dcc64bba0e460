//! Reconciliation of change notifications into local snapshots
//!
//! Every store keeps an id -> entity map and folds two independent update
//! paths into it: its own optimistic writes (applied after the remote call
//! succeeds) and the change notifications pushed by the backend, which
//! include echoes of those same writes. The fold below is idempotent, so an
//! echo arriving before or after the optimistic write leaves the same state.
//!
//! - insert: absent id -> add; present id -> overwrite the delivered fields
//! - update: shallow merge into the existing entity; unknown id -> no-op
//!   (a later `refresh()` corrects it, nothing self-heals)
//! - delete: remove if present

use crate::sync::types::{from_row, Row, SortOrder, Table};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Kind of a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification for one row of one table
///
/// `new` carries the full current row for insert/update, `old` carries at
/// least the primary key for delete.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Row,
    pub old: Row,
}

impl ChangeEvent {
    pub fn insert(table: Table, row: Row) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            new: row,
            old: Row::new(),
        }
    }

    pub fn update(table: Table, row: Row) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            new: row,
            old: Row::new(),
        }
    }

    pub fn delete(table: Table, id: &str) -> Self {
        let mut old = Row::new();
        old.insert("id".to_string(), Value::String(id.to_string()));
        Self {
            table,
            kind: ChangeKind::Delete,
            new: Row::new(),
            old,
        }
    }

    /// Id of the affected row
    pub fn row_id(&self) -> Option<&str> {
        let primary = match self.kind {
            ChangeKind::Delete => &self.old,
            ChangeKind::Insert | ChangeKind::Update => &self.new,
        };
        primary
            .get("id")
            .or_else(|| self.old.get("id"))
            .and_then(Value::as_str)
    }

    /// String value of `column` in the delivered row (new, else old)
    pub fn field(&self, column: &str) -> Option<&str> {
        self.new
            .get(column)
            .or_else(|| self.old.get(column))
            .and_then(Value::as_str)
    }
}

/// An entity mirrored by a snapshot
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Owning team, for team-scoped stores
    fn scope(&self) -> Option<&str> {
        None
    }
}

/// Result of folding one change into a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Inserted,
    Merged,
    Unchanged,
    Removed,
    /// Out of scope, or delete of an absent id
    Ignored,
    /// Update for an id the snapshot does not hold
    Missing,
}

impl FoldOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            FoldOutcome::Inserted | FoldOutcome::Merged | FoldOutcome::Removed
        )
    }
}

/// Shallow merge: fields present in `fields` replace the current ones,
/// everything else (including local-only fields) is kept. The id never changes.
pub fn merge_fields<T: Record>(current: &T, fields: &Row) -> Result<T> {
    let mut value = serde_json::to_value(current)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("record {} is not a JSON object", current.id()))?;
    for (key, field) in fields {
        if key == "id" {
            continue;
        }
        map.insert(key.clone(), field.clone());
    }
    Ok(serde_json::from_value(value)?)
}

fn same_value<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn in_scope<T: Record>(record: &T, scope: Option<&str>) -> bool {
    match (scope, record.scope()) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}

/// In-memory id -> entity map with a declared listing order
#[derive(Debug, Clone)]
pub struct Snapshot<T: Record> {
    entries: HashMap<String, T>,
    order: SortOrder,
}

impl<T: Record> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(SortOrder::Ascending)
    }
}

impl<T: Record> Snapshot<T> {
    pub fn new(order: SortOrder) -> Self {
        Self {
            entries: HashMap::new(),
            order,
        }
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Replaces the whole content (initial fetch / refresh)
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = T>) {
        self.entries = records
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Entities in the declared order: creation time, ties by id
    pub fn list(&self) -> Vec<T> {
        let mut records: Vec<T> = self.entries.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        if self.order == SortOrder::Descending {
            records.reverse();
        }
        records
    }

    /// Local write of a full entity (optimistic insert)
    pub fn upsert(&mut self, record: T) -> FoldOutcome {
        match self.entries.get(record.id()) {
            Some(existing) if same_value(existing, &record) => FoldOutcome::Unchanged,
            Some(_) => {
                self.entries.insert(record.id().to_string(), record);
                FoldOutcome::Merged
            }
            None => {
                self.entries.insert(record.id().to_string(), record);
                FoldOutcome::Inserted
            }
        }
    }

    /// Local field patch (optimistic update)
    pub fn patch(&mut self, id: &str, fields: &Row) -> Result<FoldOutcome> {
        self.merge_existing(id, fields, None)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id)
    }

    /// Folds one change notification. `scope` is the active team id for
    /// team-scoped stores; rows of other teams never enter the snapshot.
    pub fn apply(&mut self, event: &ChangeEvent, scope: Option<&str>) -> Result<FoldOutcome> {
        let id = event
            .row_id()
            .ok_or_else(|| anyhow!("{:?} event on {} without id", event.kind, event.table))?
            .to_string();

        let outcome = match event.kind {
            ChangeKind::Insert => {
                if self.entries.contains_key(&id) {
                    self.merge_existing(&id, &event.new, scope)?
                } else {
                    let record: T = from_row(event.new.clone())?;
                    if in_scope(&record, scope) {
                        self.entries.insert(id.clone(), record);
                        FoldOutcome::Inserted
                    } else {
                        FoldOutcome::Ignored
                    }
                }
            }
            ChangeKind::Update => {
                if self.entries.contains_key(&id) {
                    self.merge_existing(&id, &event.new, scope)?
                } else {
                    FoldOutcome::Missing
                }
            }
            ChangeKind::Delete => match self.entries.remove(&id) {
                Some(_) => FoldOutcome::Removed,
                None => FoldOutcome::Ignored,
            },
        };

        debug!(
            "[Reconcile] {} {:?} {} -> {:?}",
            event.table, event.kind, id, outcome
        );
        Ok(outcome)
    }

    fn merge_existing(&mut self, id: &str, fields: &Row, scope: Option<&str>) -> Result<FoldOutcome> {
        let Some(current) = self.entries.get(id) else {
            return Ok(FoldOutcome::Missing);
        };
        let merged = merge_fields(current, fields)?;
        if !in_scope(&merged, scope) {
            self.entries.remove(id);
            return Ok(FoldOutcome::Removed);
        }
        if same_value(current, &merged) {
            return Ok(FoldOutcome::Unchanged);
        }
        self.entries.insert(id.to_string(), merged);
        Ok(FoldOutcome::Merged)
    }
}

/// Change notifications seen while a full fetch is in flight
///
/// A fetch result replaces the snapshot wholesale, which would drop anything
/// folded between the subscription and the result landing. Events recorded
/// here are folded again on top of the fetched rows; the fold is idempotent,
/// so an event the fetch already reflects leaves the rows as they are.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    in_flight: usize,
    events: Vec<ChangeEvent>,
}

impl ReplayBuffer {
    /// Marks the start of one fetch
    pub fn begin(&mut self) {
        self.in_flight += 1;
    }

    pub fn is_recording(&self) -> bool {
        self.in_flight > 0
    }

    pub fn record(&mut self, event: &ChangeEvent) {
        if self.is_recording() {
            self.events.push(event.clone());
        }
    }

    /// Ends one fetch and returns the events to fold over its result
    pub fn finish(&mut self) -> Vec<ChangeEvent> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            std::mem::take(&mut self.events)
        } else {
            self.events.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        team_id: String,
        label: String,
        #[serde(default)]
        note: Option<String>,
        created_at: DateTime<Utc>,
        #[serde(default)]
        tags: Vec<String>,
    }

    impl Record for Item {
        fn id(&self) -> &str {
            &self.id
        }
        fn created_at(&self) -> DateTime<Utc> {
            self.created_at
        }
        fn scope(&self) -> Option<&str> {
            Some(&self.team_id)
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn item_row(id: &str, team: &str, label: &str, secs: i64) -> Row {
        row(json!({
            "id": id,
            "team_id": team,
            "label": label,
            "note": null,
            "created_at": ts(secs),
        }))
    }

    fn fingerprint(snapshot: &Snapshot<Item>) -> Vec<Item> {
        snapshot.list()
    }

    #[test]
    fn insert_twice_is_idempotent() {
        let mut snapshot = Snapshot::<Item>::default();
        let event = ChangeEvent::insert(Table::Okrs, item_row("a", "t1", "first", 0));

        assert_eq!(snapshot.apply(&event, Some("t1")).unwrap(), FoldOutcome::Inserted);
        let once = fingerprint(&snapshot);
        assert_eq!(snapshot.apply(&event, Some("t1")).unwrap(), FoldOutcome::Unchanged);
        assert_eq!(fingerprint(&snapshot), once);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn update_twice_is_idempotent() {
        let mut snapshot = Snapshot::<Item>::default();
        snapshot
            .apply(&ChangeEvent::insert(Table::Okrs, item_row("a", "t1", "first", 0)), None)
            .unwrap();
        let event = ChangeEvent::update(Table::Okrs, row(json!({"id": "a", "label": "renamed"})));

        assert_eq!(snapshot.apply(&event, None).unwrap(), FoldOutcome::Merged);
        let once = fingerprint(&snapshot);
        assert_eq!(snapshot.apply(&event, None).unwrap(), FoldOutcome::Unchanged);
        assert_eq!(fingerprint(&snapshot), once);
        assert_eq!(snapshot.get("a").unwrap().label, "renamed");
    }

    #[test]
    fn delete_twice_is_idempotent() {
        let mut snapshot = Snapshot::<Item>::default();
        snapshot
            .apply(&ChangeEvent::insert(Table::Okrs, item_row("a", "t1", "first", 0)), None)
            .unwrap();
        let event = ChangeEvent::delete(Table::Okrs, "a");

        assert_eq!(snapshot.apply(&event, None).unwrap(), FoldOutcome::Removed);
        assert_eq!(snapshot.apply(&event, None).unwrap(), FoldOutcome::Ignored);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn update_keeps_fields_absent_from_notification() {
        let mut snapshot = Snapshot::<Item>::default();
        let mut item: Item = from_row(item_row("a", "t1", "first", 0)).unwrap();
        item.note = Some("keep me".into());
        item.tags = vec!["local".into()];
        snapshot.upsert(item);

        let event = ChangeEvent::update(Table::Okrs, row(json!({"id": "a", "label": "second"})));
        snapshot.apply(&event, Some("t1")).unwrap();

        let item = snapshot.get("a").unwrap();
        assert_eq!(item.label, "second");
        assert_eq!(item.note.as_deref(), Some("keep me"));
        assert_eq!(item.tags, vec!["local".to_string()]);
    }

    #[test]
    fn optimistic_write_then_echo_equals_echo_then_write() {
        let inserted: Item = from_row(item_row("a", "t1", "first", 0)).unwrap();
        let echo = ChangeEvent::insert(Table::Okrs, item_row("a", "t1", "first", 0));

        let mut local_first = Snapshot::<Item>::default();
        local_first.upsert(inserted.clone());
        local_first.apply(&echo, Some("t1")).unwrap();

        let mut echo_first = Snapshot::<Item>::default();
        echo_first.apply(&echo, Some("t1")).unwrap();
        assert_eq!(echo_first.upsert(inserted), FoldOutcome::Unchanged);

        assert_eq!(fingerprint(&local_first), fingerprint(&echo_first));
    }

    #[test]
    fn update_for_unknown_id_is_reported_missing() {
        let mut snapshot = Snapshot::<Item>::default();
        let event = ChangeEvent::update(Table::Okrs, item_row("ghost", "t1", "x", 0));
        assert_eq!(snapshot.apply(&event, None).unwrap(), FoldOutcome::Missing);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn rows_of_other_scopes_are_ignored_or_evicted() {
        let mut snapshot = Snapshot::<Item>::default();
        let foreign = ChangeEvent::insert(Table::Okrs, item_row("b", "t2", "foreign", 0));
        assert_eq!(snapshot.apply(&foreign, Some("t1")).unwrap(), FoldOutcome::Ignored);

        snapshot
            .apply(&ChangeEvent::insert(Table::Okrs, item_row("a", "t1", "mine", 0)), Some("t1"))
            .unwrap();
        let moved = ChangeEvent::update(Table::Okrs, row(json!({"id": "a", "team_id": "t2"})));
        assert_eq!(snapshot.apply(&moved, Some("t1")).unwrap(), FoldOutcome::Removed);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn listing_follows_creation_time_then_id() {
        let mut snapshot = Snapshot::<Item>::new(SortOrder::Ascending);
        for (id, secs) in [("c", 5), ("b", 1), ("a", 5), ("d", 0)] {
            snapshot
                .apply(&ChangeEvent::insert(Table::Okrs, item_row(id, "t1", id, secs)), None)
                .unwrap();
        }
        let ids: Vec<String> = snapshot.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["d", "b", "a", "c"]);

        let mut descending = Snapshot::<Item>::new(SortOrder::Descending);
        descending.replace_all(snapshot.list());
        let ids: Vec<String> = descending.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn event_without_id_is_an_error() {
        let mut snapshot = Snapshot::<Item>::default();
        let event = ChangeEvent::update(Table::Okrs, row(json!({"label": "x"})));
        assert!(snapshot.apply(&event, None).is_err());
    }

    #[test]
    fn events_during_a_fetch_survive_its_result() {
        let mut snapshot = Snapshot::<Item>::default();
        let mut buffer = ReplayBuffer::default();
        buffer.begin();

        // the fetch read the table before "b" was written
        let fetched: Vec<Item> = vec![from_row(item_row("a", "t1", "first", 0)).unwrap()];
        let late = ChangeEvent::insert(Table::Okrs, item_row("b", "t1", "late", 1));
        snapshot.apply(&late, Some("t1")).unwrap();
        buffer.record(&late);
        // and saw "a" already renamed, whose echo also lands during the fetch
        let rename = ChangeEvent::update(Table::Okrs, row(json!({"id": "a", "label": "first"})));
        buffer.record(&rename);

        snapshot.replace_all(fetched);
        for event in buffer.finish() {
            snapshot.apply(&event, Some("t1")).unwrap();
        }
        let ids: Vec<String> = snapshot.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!buffer.is_recording());
    }

    #[test]
    fn overlapping_fetches_keep_the_buffer_until_the_last_one() {
        let mut buffer = ReplayBuffer::default();
        buffer.record(&ChangeEvent::delete(Table::Okrs, "ignored"));
        buffer.begin();
        buffer.begin();
        buffer.record(&ChangeEvent::delete(Table::Okrs, "a"));
        assert_eq!(buffer.finish().len(), 1);
        assert_eq!(buffer.finish().len(), 1);
        assert!(buffer.finish().is_empty());
    }
}
