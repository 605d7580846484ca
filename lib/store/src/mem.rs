use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};

use crate::{
  BulkResult, ChangeRecord, ChangesPage, DocStore, FeedOptions,
  Reduce, Result, RevRef, SavedRev, StoreError, ViewDef, ViewQuery,
  ViewRow, doc_id, doc_rev,
};

/// Embedded implementation of the [DocStore] contract, sharing the
/// HTTP store's MVCC semantics: `N-<digest>` revision chains,
/// monotonic sequence numbers, tombstoned deletes (which keep `@type`
/// so feed consumers can classify them), and a replayable change log.
///
/// Used by the test suite and single-node dev mode. Nothing survives
/// a restart.
pub struct MemStore {
  inner: Mutex<Inner>,
  changes: broadcast::Sender<ChangeRecord>,
}

#[derive(Default)]
struct Inner {
  docs: BTreeMap<String, Value>,
  /// id -> (tombstone rev, last known `@type`)
  deleted: HashMap<String, (String, String)>,
  /// "design/view" -> definition
  views: HashMap<String, ViewDef>,
  log: Vec<ChangeRecord>,
  seq: u64,
}

impl Default for MemStore {
  fn default() -> MemStore {
    MemStore::new()
  }
}

impl MemStore {
  pub fn new() -> MemStore {
    let (changes, _) = broadcast::channel(1024);
    MemStore {
      inner: Mutex::new(Inner::default()),
      changes,
    }
  }

  fn save_sync(&self, mut doc: Value) -> Result<SavedRev> {
    let id = doc_id(&doc)?;
    if !doc.is_object() {
      return Err(StoreError::InvalidDoc(
        "document must be a JSON object".to_string(),
      ));
    }
    let incoming = doc_rev(&doc);
    let mut inner = self.inner.lock().unwrap();
    let generation = match inner.docs.get(&id) {
      Some(existing) => {
        let current = doc_rev(existing);
        if incoming != current {
          return Err(StoreError::conflict(&id));
        }
        rev_generation(&current)
      }
      None => {
        // A new write may resurrect a tombstoned id, but must not
        // carry a revision of its own.
        if !incoming.is_empty() {
          return Err(StoreError::conflict(&id));
        }
        inner
          .deleted
          .get(&id)
          .map(|(rev, _)| rev_generation(rev))
          .unwrap_or(0)
      }
    };
    let rev = make_rev(&id, generation + 1, &doc);
    doc["_rev"] = Value::String(rev.clone());
    doc["_id"] = Value::String(id.clone());
    inner.docs.insert(id.clone(), doc.clone());
    inner.deleted.remove(&id);
    inner.seq += 1;
    let record = ChangeRecord {
      id: id.clone(),
      seq: inner.seq.to_string(),
      changes: vec![RevRef { rev: rev.clone() }],
      deleted: false,
      doc: Some(doc),
    };
    inner.log.push(record.clone());
    drop(inner);
    let _ = self.changes.send(record);
    Ok(SavedRev { id, rev })
  }

  fn delete_sync(&self, id: &str, rev: &str) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    let Some(existing) = inner.docs.get(id) else {
      return Err(StoreError::not_found(id));
    };
    let current = doc_rev(existing);
    if rev != current {
      return Err(StoreError::conflict(id));
    }
    let kind = existing
      .get("@type")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let tomb_rev =
      make_rev(id, rev_generation(&current) + 1, &Value::Null);
    inner.docs.remove(id);
    inner
      .deleted
      .insert(id.to_string(), (tomb_rev.clone(), kind.clone()));
    inner.seq += 1;
    let mut tombstone = json!({
      "_id": id,
      "_rev": tomb_rev,
      "_deleted": true,
    });
    if !kind.is_empty() {
      tombstone["@type"] = Value::String(kind);
    }
    let record = ChangeRecord {
      id: id.to_string(),
      seq: inner.seq.to_string(),
      changes: vec![RevRef { rev: tomb_rev }],
      deleted: true,
      doc: Some(tombstone),
    };
    inner.log.push(record.clone());
    drop(inner);
    let _ = self.changes.send(record);
    Ok(())
  }

  fn changes_page(
    &self,
    since: Option<&str>,
    limit: Option<usize>,
  ) -> ChangesPage {
    let since = since
      .and_then(|s| s.parse::<u64>().ok())
      .unwrap_or(0);
    let inner = self.inner.lock().unwrap();
    // Collapse to the latest record per document, like the feed the
    // HTTP store serves.
    let mut latest = BTreeMap::<String, ChangeRecord>::new();
    for record in &inner.log {
      if record.seq.parse::<u64>().unwrap_or(0) > since {
        latest.insert(record.id.clone(), record.clone());
      }
    }
    let mut results = latest.into_values().collect::<Vec<_>>();
    results.sort_by_key(|r| r.seq.parse::<u64>().unwrap_or(0));
    if let Some(limit) = limit {
      results.truncate(limit);
    }
    ChangesPage {
      results,
      last_seq: inner.seq.to_string(),
    }
  }
}

#[async_trait]
impl DocStore for MemStore {
  async fn save(&self, doc: Value) -> Result<SavedRev> {
    self.save_sync(doc)
  }

  async fn get(&self, id: &str) -> Result<Value> {
    let inner = self.inner.lock().unwrap();
    inner
      .docs
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::not_found(id))
  }

  async fn delete(&self, id: &str, rev: &str) -> Result<()> {
    self.delete_sync(id, rev)
  }

  async fn bulk_save(
    &self,
    docs: Vec<Value>,
  ) -> Result<Vec<BulkResult>> {
    let results = docs
      .into_iter()
      .map(|doc| {
        let id = doc_id(&doc).unwrap_or_default();
        match self.save_sync(doc) {
          Ok(saved) => BulkResult::ok(saved.id, saved.rev),
          Err(e) => BulkResult::err(id, e.class(), e.to_string()),
        }
      })
      .collect();
    Ok(results)
  }

  async fn find(
    &self,
    selector: Value,
    limit: Option<usize>,
    skip: Option<usize>,
  ) -> Result<Vec<Value>> {
    let inner = self.inner.lock().unwrap();
    let docs = inner
      .docs
      .values()
      .filter(|doc| matches_selector(doc, &selector))
      .skip(skip.unwrap_or(0))
      .take(limit.unwrap_or(usize::MAX))
      .cloned()
      .collect();
    Ok(docs)
  }

  async fn view(
    &self,
    design: &str,
    view: &str,
    query: ViewQuery,
  ) -> Result<Vec<ViewRow>> {
    let inner = self.inner.lock().unwrap();
    let def = inner
      .views
      .get(&format!("{design}/{view}"))
      .ok_or_else(|| {
        StoreError::not_found(format!("_design/{design}/{view}"))
      })?
      .clone();

    let mut rows = Vec::new();
    for (id, doc) in &inner.docs {
      let kind =
        doc.get("@type").and_then(Value::as_str).unwrap_or_default();
      if !def.doc_kinds.iter().any(|k| k == kind) {
        continue;
      }
      let key = doc.get(&def.key_field).cloned().unwrap_or(Value::Null);
      if let Some(wanted) = &query.key
        && &key != wanted
      {
        continue;
      }
      rows.push(ViewRow {
        id: Some(id.clone()),
        key,
        value: Value::from(1),
        doc: query.include_docs.then(|| doc.clone()),
      });
    }
    rows.sort_by(|a, b| {
      a.key.to_string().cmp(&b.key.to_string())
    });

    if query.reduce && def.reduce == Some(Reduce::Sum) {
      rows = reduce_sum(rows, query.group);
    }

    let skip = query.skip.unwrap_or(0);
    let rows = rows
      .into_iter()
      .skip(skip)
      .take(query.limit.unwrap_or(usize::MAX))
      .collect();
    Ok(rows)
  }

  async fn get_changes(
    &self,
    since: Option<&str>,
    limit: Option<usize>,
  ) -> Result<ChangesPage> {
    Ok(self.changes_page(since, limit))
  }

  async fn listen_changes(
    &self,
    opts: FeedOptions,
    tx: mpsc::Sender<ChangeRecord>,
  ) -> Result<()> {
    // Subscribe before replaying so nothing falls in the gap.
    let mut rx = self.changes.subscribe();
    let mut last_seq = 0u64;
    let replay = self.changes_page(opts.since.as_deref(), None);
    for record in replay.results {
      if !record_matches(&record, &opts.kinds) {
        continue;
      }
      last_seq = record.seq.parse().unwrap_or(last_seq);
      if tx.send(record).await.is_err() {
        return Ok(());
      }
    }
    loop {
      let record = match rx.recv().await {
        Ok(record) => record,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(
            "change feed subscriber lagged, skipped {skipped} records"
          );
          continue;
        }
        Err(broadcast::error::RecvError::Closed) => return Ok(()),
      };
      if record.seq.parse::<u64>().unwrap_or(0) <= last_seq
        || !record_matches(&record, &opts.kinds)
      {
        continue;
      }
      last_seq = record.seq.parse().unwrap_or(last_seq);
      if tx.send(record).await.is_err() {
        return Ok(());
      }
    }
  }

  async fn ensure_index(
    &self,
    _name: &str,
    _fields: &[&str],
  ) -> Result<()> {
    // Selector queries scan; there is nothing to build.
    Ok(())
  }

  async fn ensure_view(
    &self,
    design: &str,
    views: &[(&str, ViewDef)],
  ) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    for (name, def) in views {
      inner
        .views
        .insert(format!("{design}/{name}"), def.clone());
    }
    Ok(())
  }
}

/// Deletions always pass the kind filter: their tombstones may not
/// carry `@type` on every backend.
fn record_matches(record: &ChangeRecord, kinds: &[String]) -> bool {
  if kinds.is_empty() || record.deleted {
    return true;
  }
  let kind = record
    .doc
    .as_ref()
    .and_then(|d| d.get("@type"))
    .and_then(Value::as_str)
    .unwrap_or_default();
  kinds.iter().any(|k| k == kind)
}

fn rev_generation(rev: &str) -> u64 {
  rev
    .split_once('-')
    .and_then(|(n, _)| n.parse().ok())
    .unwrap_or(0)
}

fn make_rev(id: &str, generation: u64, body: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.as_bytes());
  hasher.update(generation.to_be_bytes());
  hasher.update(body.to_string().as_bytes());
  let digest = hasher.finalize();
  let hex = digest
    .iter()
    .take(16)
    .map(|b| format!("{b:02x}"))
    .collect::<String>();
  format!("{generation}-{hex}")
}

fn reduce_sum(rows: Vec<ViewRow>, group: bool) -> Vec<ViewRow> {
  if !group {
    let total = rows
      .iter()
      .map(|r| r.value.as_i64().unwrap_or(0))
      .sum::<i64>();
    return vec![ViewRow {
      id: None,
      key: Value::Null,
      value: Value::from(total),
      doc: None,
    }];
  }
  let mut grouped = BTreeMap::<String, (Value, i64)>::new();
  for row in rows {
    let entry = grouped
      .entry(row.key.to_string())
      .or_insert_with(|| (row.key.clone(), 0));
    entry.1 += row.value.as_i64().unwrap_or(0);
  }
  grouped
    .into_values()
    .map(|(key, total)| ViewRow {
      id: None,
      key,
      value: Value::from(total),
      doc: None,
    })
    .collect()
}

/// Mango selector subset: implicit equality, `$eq` / `$ne` / `$in` /
/// `$gt` / `$gte` / `$lt` / `$lte` / `$exists`, plus top-level `$and`
/// / `$or`.
fn matches_selector(doc: &Value, selector: &Value) -> bool {
  let Some(map) = selector.as_object() else {
    return true;
  };
  map.iter().all(|(field, cond)| match field.as_str() {
    "$and" => cond
      .as_array()
      .is_some_and(|subs| {
        subs.iter().all(|s| matches_selector(doc, s))
      }),
    "$or" => cond
      .as_array()
      .is_some_and(|subs| {
        subs.iter().any(|s| matches_selector(doc, s))
      }),
    _ => matches_condition(doc.get(field), cond),
  })
}

fn matches_condition(value: Option<&Value>, cond: &Value) -> bool {
  let ops = match cond.as_object() {
    Some(ops)
      if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() =>
    {
      ops
    }
    _ => return value == Some(cond),
  };
  ops.iter().all(|(op, operand)| match op.as_str() {
    "$eq" => value == Some(operand),
    "$ne" => value != Some(operand),
    "$exists" => {
      operand.as_bool().unwrap_or(false) == value.is_some()
    }
    "$in" => operand
      .as_array()
      .is_some_and(|arr| value.is_some_and(|v| arr.contains(v))),
    "$gt" | "$gte" | "$lt" | "$lte" => {
      let (Some(a), Some(b)) =
        (value.and_then(Value::as_f64), operand.as_f64())
      else {
        return false;
      };
      match op.as_str() {
        "$gt" => a > b,
        "$gte" => a >= b,
        "$lt" => a < b,
        _ => a <= b,
      }
    }
    _ => false,
  })
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn container(id: &str, host: &str, status: &str) -> Value {
    json!({
      "@context": "https://schema.org",
      "@type": "SoftwareApplication",
      "@id": id,
      "name": id,
      "executableName": "nginx:1.27",
      "hostedOn": host,
      "status": status,
    })
  }

  #[tokio::test]
  async fn save_advances_the_revision_chain() {
    let store = MemStore::new();
    let saved =
      store.save(container("c1", "h1", "running")).await.unwrap();
    assert!(saved.rev.starts_with("1-"));

    let mut doc = store.get("c1").await.unwrap();
    assert_eq!(doc["_rev"].as_str().unwrap(), saved.rev);

    doc["status"] = json!("stopped");
    let saved2 = store.save(doc).await.unwrap();
    assert!(saved2.rev.starts_with("2-"));
  }

  #[tokio::test]
  async fn conflicting_save_leaves_the_stored_revision_unchanged() {
    let store = MemStore::new();
    let saved =
      store.save(container("c1", "h1", "running")).await.unwrap();

    let mut stale = container("c1", "h1", "stopped");
    stale["_rev"] = json!("1-0000000000000000");
    let err = store.save(stale).await.unwrap_err();
    assert!(err.is_conflict());

    let current = store.get("c1").await.unwrap();
    assert_eq!(current["_rev"].as_str().unwrap(), saved.rev);
    assert_eq!(current["status"], json!("running"));
  }

  #[tokio::test]
  async fn delete_is_strict_and_keeps_kind_on_the_tombstone() {
    let store = MemStore::new();
    let saved =
      store.save(container("c1", "h1", "running")).await.unwrap();

    let err =
      store.delete("c1", "1-bogus").await.unwrap_err();
    assert!(err.is_conflict());

    store.delete("c1", &saved.rev).await.unwrap();
    assert!(store.get("c1").await.unwrap_err().is_not_found());

    let page = store.get_changes(None, None).await.unwrap();
    let last = page.results.last().unwrap();
    assert!(last.deleted);
    assert_eq!(
      last.doc.as_ref().unwrap()["@type"],
      json!("SoftwareApplication")
    );
  }

  #[tokio::test]
  async fn bulk_save_reports_per_document_outcomes() {
    let store = MemStore::new();
    store.save(container("c2", "h1", "running")).await.unwrap();

    // The second doc carries a stale rev and must fail alone.
    let mut stale = container("c2", "h1", "running");
    stale["_rev"] = json!("1-stale");
    let results = store
      .bulk_save(vec![
        container("c1", "h1", "running"),
        stale,
        container("c3", "h2", "stopped"),
      ])
      .await
      .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].ok);
    assert!(!results[1].ok);
    assert_eq!(results[1].error.as_deref(), Some("conflict"));
    assert!(results[2].ok);
  }

  #[tokio::test]
  async fn find_supports_in_and_equality() {
    let store = MemStore::new();
    for (id, host, status) in [
      ("c1", "h1", "running"),
      ("c2", "h1", "stopped"),
      ("c3", "h2", "running"),
    ] {
      store.save(container(id, host, status)).await.unwrap();
    }
    let docs = store
      .find(
        json!({
          "@type": "SoftwareApplication",
          "hostedOn": "h1",
          "status": { "$in": ["running", "stopped"] },
        }),
        None,
        None,
      )
      .await
      .unwrap();
    assert_eq!(docs.len(), 2);
  }

  #[tokio::test]
  async fn views_group_and_reduce() {
    let store = MemStore::new();
    store
      .ensure_view(
        "containers",
        &[(
          "container_count_by_host",
          ViewDef {
            doc_kinds: vec!["SoftwareApplication".to_string()],
            key_field: "hostedOn".to_string(),
            reduce: Some(Reduce::Sum),
          },
        )],
      )
      .await
      .unwrap();
    for (id, host) in [("c1", "h1"), ("c2", "h1"), ("c3", "h2")] {
      store.save(container(id, host, "running")).await.unwrap();
    }
    let rows = store
      .view(
        "containers",
        "container_count_by_host",
        ViewQuery {
          group: true,
          reduce: true,
          ..Default::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, json!("h1"));
    assert_eq!(rows[0].value, json!(2));
    assert_eq!(rows[1].key, json!("h2"));
    assert_eq!(rows[1].value, json!(1));
  }

  #[tokio::test]
  async fn listen_changes_replays_then_streams() {
    let store = std::sync::Arc::new(MemStore::new());
    store.save(container("c1", "h1", "running")).await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let listener = {
      let store = store.clone();
      tokio::spawn(async move {
        store
          .listen_changes(
            FeedOptions {
              kinds: vec!["SoftwareApplication".to_string()],
              include_docs: true,
              ..Default::default()
            },
            tx,
          )
          .await
      })
    };

    let replayed = rx.recv().await.unwrap();
    assert_eq!(replayed.id, "c1");

    store.save(container("c2", "h2", "running")).await.unwrap();
    let live = rx.recv().await.unwrap();
    assert_eq!(live.id, "c2");

    drop(rx);
    // Another write unblocks the listener so it notices the closed
    // receiver and returns.
    store.save(container("c3", "h2", "running")).await.unwrap();
    listener.await.unwrap().unwrap();
  }
}
