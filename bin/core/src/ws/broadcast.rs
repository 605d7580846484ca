//! The change-feed broadcaster: one long-running subscriber on the
//! store's feed, classifying every change by `@type` into typed
//! events for the hub.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use store::{ChangeRecord, FeedOptions};
use tokio::sync::mpsc;
use trellis_client::entities::{
  Document, Entity,
  event::{ChangeEvent, EventClass, EventVerb},
};

use crate::{repo::Repo, state};

use super::hub::Hub;

const CHECKPOINT_ID: &str = "broadcast-checkpoint";
const SNAPSHOT_LIMIT: usize = 10_000;

/// Where the broadcaster left off on the feed, persisted so restarts
/// resume instead of replaying from zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastCheckpoint {
  #[serde(flatten)]
  doc: Document,
  last_seq: String,
}

impl Entity for BroadcastCheckpoint {
  const KIND: &'static str = "BroadcastCheckpoint";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}

pub fn spawn_change_broadcaster() {
  tokio::spawn(async move {
    loop {
      if let Err(e) =
        run_broadcaster(state::repo(), state::hub()).await
      {
        error!("change broadcaster exited | {e:#}");
      }
      // The feed reconnects internally; landing here means a full
      // restart (snapshot + checkpoint reload) is needed.
      tokio::time::sleep(Duration::from_secs(5)).await;
    }
  });
}

pub async fn run_broadcaster(
  repo: &Repo,
  hub: &Hub,
) -> anyhow::Result<()> {
  // Seed the id -> class cache from a snapshot read, so deletions
  // whose tombstones carry no `@type` still classify after a
  // restart.
  let mut classes = snapshot_classes(repo).await?;

  let since = repo
    .try_get::<BroadcastCheckpoint>(CHECKPOINT_ID)
    .await
    .context("failed to load broadcast checkpoint")?
    .map(|checkpoint| checkpoint.last_seq);

  let (tx, mut rx) = mpsc::channel::<ChangeRecord>(1024);
  let listener = tokio::spawn({
    let store = repo.store_arc();
    let opts = FeedOptions {
      since,
      kinds: EventClass::all_kinds()
        .iter()
        .map(ToString::to_string)
        .collect(),
      include_docs: true,
    };
    async move { store.listen_changes(opts, tx).await }
  });

  while let Some(record) = rx.recv().await {
    let seq = record.seq.clone();
    if let Some(event) = classify_record(record, &mut classes) {
      hub.publish(&event);
    }
    save_checkpoint(repo, seq).await;
  }

  listener
    .await
    .context("change feed listener panicked")?
    .context("change feed listener failed")?;
  Ok(())
}

async fn snapshot_classes(
  repo: &Repo,
) -> anyhow::Result<HashMap<String, EventClass>> {
  let docs = repo
    .store()
    .find(
      json!({ "@type": { "$in": EventClass::all_kinds() } }),
      Some(SNAPSHOT_LIMIT),
      None,
    )
    .await
    .context("failed to snapshot documents for classification")?;
  Ok(
    docs
      .into_iter()
      .filter_map(|doc| {
        let id =
          doc.get("@id").and_then(Value::as_str)?.to_string();
        let class = doc
          .get("@type")
          .and_then(Value::as_str)
          .and_then(EventClass::classify)?;
        Some((id, class))
      })
      .collect(),
  )
}

/// Map one feed record onto a broadcast event. Returns `None` for
/// documents outside the broadcast classes (and for deletions whose
/// class was never learned).
fn classify_record(
  record: ChangeRecord,
  classes: &mut HashMap<String, EventClass>,
) -> Option<ChangeEvent> {
  if record.id.starts_with("_design/") {
    return None;
  }
  let kind = record
    .doc
    .as_ref()
    .and_then(|doc| doc.get("@type"))
    .and_then(Value::as_str);
  let class = match kind.and_then(EventClass::classify) {
    Some(class) => {
      classes.insert(record.id.clone(), class);
      class
    }
    None if record.deleted => classes.get(&record.id).copied()?,
    None => return None,
  };
  if record.deleted {
    classes.remove(&record.id);
    return Some(ChangeEvent::new(
      class,
      EventVerb::Deleted,
      json!({ "@id": record.id }),
    ));
  }
  // First observed revision means created; everything after is an
  // update.
  let verb = if record
    .changes
    .first()
    .map(|change| change.rev.starts_with("1-"))
    .unwrap_or(false)
  {
    EventVerb::Created
  } else {
    EventVerb::Updated
  };
  let data = record
    .doc
    .unwrap_or_else(|| json!({ "@id": record.id }));
  Some(ChangeEvent::new(class, verb, data))
}

/// Checkpoint writes are best-effort: losing one replays a little of
/// the feed, which subscribers tolerate.
async fn save_checkpoint(repo: &Repo, seq: String) {
  if seq.is_empty() {
    return;
  }
  let mut checkpoint = match repo
    .try_get::<BroadcastCheckpoint>(CHECKPOINT_ID)
    .await
  {
    Ok(Some(checkpoint)) => checkpoint,
    Ok(None) => BroadcastCheckpoint {
      doc: Document::new(BroadcastCheckpoint::KIND, CHECKPOINT_ID),
      ..Default::default()
    },
    Err(e) => {
      debug!("failed to load broadcast checkpoint | {e:#}");
      return;
    }
  };
  checkpoint.last_seq = seq;
  if let Err(e) = repo.save(&mut checkpoint).await {
    debug!("failed to save broadcast checkpoint | {:#}", e.error);
  }
}

#[cfg(test)]
mod tests {
  use store::RevRef;

  use super::*;

  fn record(
    id: &str,
    rev: &str,
    kind: &str,
    deleted: bool,
  ) -> ChangeRecord {
    ChangeRecord {
      id: id.to_string(),
      seq: "7".to_string(),
      changes: vec![RevRef {
        rev: rev.to_string(),
      }],
      deleted,
      doc: (!deleted).then(|| {
        json!({ "@id": id, "@type": kind, "name": id })
      }),
    }
  }

  #[test]
  fn first_revision_classifies_as_created() {
    let mut classes = HashMap::new();
    let event = classify_record(
      record("c1", "1-abc", "SoftwareApplication", false),
      &mut classes,
    )
    .unwrap();
    assert_eq!(event.kind, "container.created");

    let event = classify_record(
      record("c1", "2-def", "SoftwareApplication", false),
      &mut classes,
    )
    .unwrap();
    assert_eq!(event.kind, "container.updated");
  }

  #[test]
  fn deletions_classify_from_the_learned_cache() {
    let mut classes = HashMap::new();
    classify_record(
      record("h1", "1-abc", "ComputerServer", false),
      &mut classes,
    );
    // Tombstone without a body.
    let event = classify_record(
      ChangeRecord {
        id: "h1".to_string(),
        seq: "8".to_string(),
        changes: vec![RevRef {
          rev: "2-dead".to_string(),
        }],
        deleted: true,
        doc: None,
      },
      &mut classes,
    )
    .unwrap();
    assert_eq!(event.kind, "host.deleted");
    assert_eq!(event.data, json!({ "@id": "h1" }));

    // The class was forgotten with the document.
    assert!(classes.is_empty());
  }

  #[test]
  fn unclassified_kinds_are_not_broadcast() {
    let mut classes = HashMap::new();
    assert!(
      classify_record(
        record("u1", "1-abc", "User", false),
        &mut classes
      )
      .is_none()
    );
    assert!(
      classify_record(
        record("_design/containers", "1-abc", "", false),
        &mut classes
      )
      .is_none()
    );
  }
}
