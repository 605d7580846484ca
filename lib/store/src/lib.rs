//! # Trellis Store
//!
//! The MVCC document store adapter. Documents are JSON objects keyed
//! by `@id` and versioned by `_rev`: a save carries the expected prior
//! revision and fails with [StoreError::Conflict] on mismatch. The
//! store also serves Mango-style selector queries, map/reduce views,
//! and an append-only change feed with resumable sequence tokens.
//!
//! Two implementations share the [DocStore] contract:
//! [HttpStore] speaks the store's HTTP API, and [MemStore] is an
//! embedded equivalent used by the test suite and single-node dev
//! mode.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

mod error;
mod http;
mod mem;

pub use error::StoreError;
pub use http::HttpStore;
pub use mem::MemStore;

/// Default heartbeat cadence on the continuous change feed.
pub const CHANGE_FEED_HEARTBEAT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRev {
  pub id: String,
  pub rev: String,
}

/// Per-document outcome of a bulk save. Bulk writes are
/// non-transactional: some documents land while others fail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rev: Option<String>,
  pub ok: bool,
  /// Failure class, eg `conflict` or `validation`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

impl BulkResult {
  pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> BulkResult {
    BulkResult {
      id: id.into(),
      rev: Some(rev.into()),
      ok: true,
      error: None,
      reason: None,
    }
  }

  pub fn err(
    id: impl Into<String>,
    error: impl Into<String>,
    reason: impl Into<String>,
  ) -> BulkResult {
    BulkResult {
      id: id.into(),
      rev: None,
      ok: false,
      error: Some(error.into()),
      reason: Some(reason.into()),
    }
  }
}

/// A declarative map/reduce view. Implementations compile it to their
/// native form: [HttpStore] emits a javascript map function into the
/// design document, [MemStore] interprets it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDef {
  /// `@type`s the view maps over.
  pub doc_kinds: Vec<String>,
  /// The document field whose value becomes the row key.
  pub key_field: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reduce: Option<Reduce>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
  /// Sum of emitted values (every row emits `1`).
  Sum,
}

#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
  /// Restrict rows to this exact key.
  pub key: Option<Value>,
  /// Group reduced rows by key instead of collapsing to one total.
  pub group: bool,
  /// Run the view's reduce. Ignored for views without one.
  pub reduce: bool,
  /// Join each map row with its source document.
  pub include_docs: bool,
  pub limit: Option<usize>,
  pub skip: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub key: Value,
  pub value: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub doc: Option<Value>,
}

/// One row of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
  pub id: String,
  #[serde(default)]
  pub seq: String,
  #[serde(default)]
  pub changes: Vec<RevRef>,
  #[serde(default)]
  pub deleted: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub doc: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevRef {
  pub rev: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesPage {
  #[serde(default)]
  pub results: Vec<ChangeRecord>,
  #[serde(default)]
  pub last_seq: String,
}

/// Options for the continuous change feed.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
  /// Resume after this sequence token. `None` streams from now on
  /// ([MemStore]) or from zero ([HttpStore] with an empty database).
  pub since: Option<String>,
  /// Server-side `@type` selector. Empty means no filter. Deletions
  /// always pass the filter; their tombstones may lack `@type`.
  pub kinds: Vec<String>,
  pub include_docs: bool,
}

/// The document store capability consumed by the repository and the
/// change broadcaster.
#[async_trait]
pub trait DocStore: Send + Sync {
  /// MVCC write. The document's `_rev` must match the stored revision
  /// (or be absent for a new document), else [StoreError::Conflict].
  async fn save(&self, doc: Value) -> Result<SavedRev>;

  async fn get(&self, id: &str) -> Result<Value>;

  /// Strict delete: a conflicting `rev` is surfaced, never retried.
  async fn delete(&self, id: &str, rev: &str) -> Result<()>;

  /// Non-transactional bulk write with per-document outcomes.
  async fn bulk_save(&self, docs: Vec<Value>) -> Result<Vec<BulkResult>>;

  /// Mango-style selector query.
  async fn find(
    &self,
    selector: Value,
    limit: Option<usize>,
    skip: Option<usize>,
  ) -> Result<Vec<Value>>;

  async fn view(
    &self,
    design: &str,
    view: &str,
    query: ViewQuery,
  ) -> Result<Vec<ViewRow>>;

  /// One-shot poll of the change feed.
  async fn get_changes(
    &self,
    since: Option<&str>,
    limit: Option<usize>,
  ) -> Result<ChangesPage>;

  /// Continuous change feed. Runs until `tx` closes, reconnecting
  /// internally (from the last seen seq) on transport errors and on
  /// heartbeat silence longer than 2x [CHANGE_FEED_HEARTBEAT].
  async fn listen_changes(
    &self,
    opts: FeedOptions,
    tx: mpsc::Sender<ChangeRecord>,
  ) -> Result<()>;

  /// Idempotent index creation, called at startup.
  async fn ensure_index(
    &self,
    name: &str,
    fields: &[&str],
  ) -> Result<()>;

  /// Idempotent view creation, called at startup.
  async fn ensure_view(
    &self,
    design: &str,
    views: &[(&str, ViewDef)],
  ) -> Result<()>;
}

/// Pull the `@id` out of a raw document.
pub(crate) fn doc_id(doc: &Value) -> Result<String> {
  match doc.get("@id").and_then(Value::as_str) {
    Some(id) if !id.is_empty() => Ok(id.to_string()),
    _ => Err(StoreError::InvalidDoc(
      "document is missing '@id'".to_string(),
    )),
  }
}

/// Pull the `_rev` out of a raw document, empty when unsaved.
pub(crate) fn doc_rev(doc: &Value) -> String {
  doc
    .get("_rev")
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_string()
}
