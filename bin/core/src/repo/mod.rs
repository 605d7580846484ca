use std::sync::Arc;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde_json::{Value, json};
use serror::AddStatusCodeError;
use store::{DocStore, StoreError};
use trellis_client::entities::{
  Entity, SCHEMA_ORG_CONTEXT, new_document_id, trellis_timestamp,
};

mod action;
mod agent;
mod container;
mod deployment;
mod host;
mod stack;
mod task;
mod user;

pub use container::dedup_by_id;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Pagination window for list queries. Over-range offsets just come
/// back empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

impl Page {
  /// The widest allowed window.
  pub fn max() -> Page {
    Page {
      limit: Some(MAX_PAGE_LIMIT),
      offset: None,
    }
  }

  pub fn limit(&self) -> usize {
    self
      .limit
      .unwrap_or(DEFAULT_PAGE_LIMIT)
      .min(MAX_PAGE_LIMIT)
  }

  pub fn offset(&self) -> usize {
    self.offset.unwrap_or(0)
  }
}

/// Typed CRUD over the document store. The single writer of canonical
/// state: every persisted mutation in the controller goes through
/// here, picking up default stamping and the conflict retry.
pub struct Repo {
  store: Arc<dyn DocStore>,
}

impl Repo {
  pub fn new(store: Arc<dyn DocStore>) -> Repo {
    Repo { store }
  }

  pub fn store(&self) -> &dyn DocStore {
    self.store.as_ref()
  }

  /// Owned handle on the underlying store, for long-running
  /// subscribers spawned onto their own task.
  pub fn store_arc(&self) -> Arc<dyn DocStore> {
    self.store.clone()
  }

  pub async fn get<E: Entity>(&self, id: &str) -> anyhow::Result<E> {
    let value = self
      .store
      .get(id)
      .await
      .with_context(|| format!("failed to get {} {id}", E::KIND))?;
    parse::<E>(value)
  }

  pub async fn try_get<E: Entity>(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<E>> {
    match self.store.get(id).await {
      Ok(value) => Ok(Some(parse::<E>(value)?)),
      Err(e) if e.is_not_found() => Ok(None),
      Err(e) => Err(e)
        .with_context(|| format!("failed to get {} {id}", E::KIND)),
    }
  }

  pub async fn list<E: Entity>(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<E>> {
    let docs = self
      .store
      .find(
        json!({ "@type": { "$in": E::kinds() } }),
        Some(page.limit()),
        Some(page.offset()),
      )
      .await
      .with_context(|| format!("failed to list {}s", E::KIND))?;
    docs.into_iter().map(parse::<E>).collect()
  }

  /// Save with default stamping and one conflict retry.
  ///
  /// On conflict the current revision is re-fetched and the *incoming*
  /// body re-saved under it (last-writer-wins). A second conflict is
  /// surfaced to the caller as 409.
  pub async fn save<E: Entity>(
    &self,
    entity: &mut E,
  ) -> serror::Result<String> {
    self.stamp(entity);
    let id = entity.doc().id.clone();
    let value = serde_json::to_value(&*entity)
      .with_context(|| format!("failed to serialize {}", E::KIND))?;
    match self.store.save(value.clone()).await {
      Ok(saved) => {
        entity.doc_mut().rev = saved.rev.clone();
        Ok(saved.rev)
      }
      Err(e) if e.is_conflict() => {
        let current = self.store.get(&id).await.map_err(|e| {
          coded(e, format!("failed to re-fetch {id} after conflict"))
        })?;
        let rev = current
          .get("_rev")
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_string();
        let mut value = value;
        value["_rev"] = Value::String(rev.clone());
        match self.store.save(value).await {
          Ok(saved) => {
            entity.doc_mut().rev = saved.rev.clone();
            Ok(saved.rev)
          }
          Err(e) if e.is_conflict() => Err(
            anyhow::Error::from(e)
              .context(format!(
                "save conflict on {id} persisted through retry"
              ))
              .status_code(StatusCode::CONFLICT),
          ),
          Err(e) => {
            Err(coded(e, format!("failed to save {} {id}", E::KIND)))
          }
        }
      }
      Err(e) => {
        Err(coded(e, format!("failed to save {} {id}", E::KIND)))
      }
    }
  }

  /// Strict delete by id + rev: conflicts are surfaced, never
  /// retried.
  pub async fn delete<E: Entity>(
    &self,
    id: &str,
    rev: &str,
  ) -> serror::Result<()> {
    self.store.delete(id, rev).await.map_err(|e| {
      coded(e, format!("failed to delete {} {id}", E::KIND))
    })
  }

  fn stamp<E: Entity>(&self, entity: &mut E) {
    let now = trellis_timestamp();
    let doc = entity.doc_mut();
    if doc.context.is_empty() {
      doc.context = SCHEMA_ORG_CONTEXT.to_string();
    }
    if doc.kind.is_empty() {
      doc.kind = E::KIND.to_string();
    }
    if doc.id.is_empty() {
      doc.id = new_document_id(&E::KIND.to_lowercase());
    }
    entity.touch(now);
  }
}

pub(crate) fn parse<E: Entity>(value: Value) -> anyhow::Result<E> {
  serde_json::from_value(value)
    .with_context(|| format!("failed to deserialize {}", E::KIND))
}

fn coded(e: StoreError, msg: String) -> serror::Error {
  let status = match &e {
    StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
    StoreError::Conflict { .. } => StatusCode::CONFLICT,
    StoreError::InvalidDoc(_) => StatusCode::BAD_REQUEST,
    StoreError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
    StoreError::Unauthorized => StatusCode::INTERNAL_SERVER_ERROR,
  };
  anyhow::Error::from(e).context(msg).status_code(status)
}

pub(crate) fn not_found(
  kind: &str,
  id: &str,
) -> serror::Error {
  anyhow!("no {kind} found with id {id}")
    .status_code(StatusCode::NOT_FOUND)
}
