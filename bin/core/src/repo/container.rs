use serde_json::{Value, json};
use store::{BulkResult, ViewQuery};
use trellis_client::{
  entities::{
    container::{Container, IgnoreListEntry},
    stack::Stack,
  },
  validate,
};

use super::{Page, Repo, not_found, parse};

impl Repo {
  /// Create or update a container, then run the best-effort
  /// relationship side effects.
  pub async fn save_container(
    &self,
    container: &mut Container,
  ) -> serror::Result<String> {
    let rev = self.save(container).await?;
    if let Err(e) =
      self.auto_assign_container_to_stack(container).await
    {
      warn!(
        "failed to auto assign container {} to a stack | {e:#}",
        container.doc.id
      );
    }
    Ok(rev)
  }

  /// List containers, deduplicated by `@id` keeping the last observed
  /// revision. The store can surface multiple rows for one logical
  /// container during sync contention.
  pub async fn list_containers(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<Container>> {
    Ok(dedup_by_id(self.list(page).await?))
  }

  /// Containers on one host, via the `containers_by_host` view.
  pub async fn containers_by_host(
    &self,
    host_id: &str,
  ) -> anyhow::Result<Vec<Container>> {
    let rows = self
      .store()
      .view(
        "containers",
        "containers_by_host",
        ViewQuery {
          key: Some(json!(host_id)),
          include_docs: true,
          ..Default::default()
        },
      )
      .await?;
    let containers = rows
      .into_iter()
      .filter_map(|row| row.doc)
      .map(parse::<Container>)
      .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(dedup_by_id(containers))
  }

  /// Delete a container and run the relationship cleanup. The ignore
  /// tombstone is written before stack cleanup so an agent resync
  /// cannot recreate the container mid-cleanup. Cleanup failures are
  /// logged, never surfaced.
  pub async fn delete_container(
    &self,
    id: &str,
  ) -> serror::Result<Container> {
    let Some(container) = self.try_get::<Container>(id).await?
    else {
      return Err(not_found("container", id));
    };
    self
      .delete::<Container>(id, &container.doc.rev)
      .await?;
    if let Err(e) = self.add_to_ignore_list(id).await {
      warn!("failed to add container {id} to ignore list | {e:#}");
    }
    if let Err(e) = self.remove_container_from_stacks(id).await {
      warn!("failed to remove container {id} from stacks | {e:#}");
    }
    self
      .audit("", "container.delete", id, Value::Null)
      .await;
    Ok(container)
  }

  pub async fn add_to_ignore_list(
    &self,
    container_id: &str,
  ) -> anyhow::Result<()> {
    let mut entry = IgnoreListEntry::new(container_id);
    if let Some(existing) = self
      .try_get::<IgnoreListEntry>(&entry.doc.id)
      .await?
    {
      entry.doc.rev = existing.doc.rev;
    }
    self.save(&mut entry).await.map_err(|e| e.error)?;
    Ok(())
  }

  /// A missing ignore document just means "not ignored".
  pub async fn is_container_ignored(
    &self,
    container_id: &str,
  ) -> anyhow::Result<bool> {
    Ok(
      self
        .try_get::<IgnoreListEntry>(&IgnoreListEntry::id_for(
          container_id,
        ))
        .await?
        .is_some(),
    )
  }

  /// If the container's name starts `<stackName>-`, add its id to
  /// that stack's container set. The most specific (longest) stack
  /// name wins when several prefix-match.
  pub async fn auto_assign_container_to_stack(
    &self,
    container: &Container,
  ) -> anyhow::Result<()> {
    if container.name.is_empty() {
      return Ok(());
    }
    let mut stacks = self.list::<Stack>(Page::max()).await?;
    stacks.sort_by_key(|s| std::cmp::Reverse(s.name.len()));
    let Some(stack) = stacks.iter_mut().find(|stack| {
      !stack.name.is_empty()
        && container
          .name
          .starts_with(&format!("{}-", stack.name))
    }) else {
      return Ok(());
    };
    if stack.add_container(&container.doc.id) {
      self.save(stack).await.map_err(|e| e.error)?;
    }
    Ok(())
  }

  /// Scan every stack and filter the id out of modified ones.
  pub async fn remove_container_from_stacks(
    &self,
    container_id: &str,
  ) -> anyhow::Result<()> {
    let stacks = self.list::<Stack>(Page::max()).await?;
    for mut stack in stacks {
      if stack.remove_container(container_id)
        && let Err(e) = self.save(&mut stack).await
      {
        warn!(
          "failed to remove container {container_id} from stack {} | {:#}",
          stack.doc.id, e.error
        );
      }
    }
    Ok(())
  }

  /// Bulk save raw container documents. Each document is validated
  /// first; invalid ones fail alone with `error = "validation"` while
  /// the rest land (bulk writes are non-transactional).
  pub async fn bulk_save_containers(
    &self,
    docs: Vec<Value>,
  ) -> anyhow::Result<Vec<BulkResult>> {
    let mut slots: Vec<Option<BulkResult>> =
      vec![None; docs.len()];
    let mut to_save = Vec::new();
    let mut save_slots = Vec::new();
    for (i, doc) in docs.into_iter().enumerate() {
      let bytes = serde_json::to_vec(&doc)?;
      let report = validate::validate_container(&bytes);
      if report.valid {
        save_slots.push(i);
        to_save.push(doc);
      } else {
        let id = doc
          .get("@id")
          .and_then(Value::as_str)
          .unwrap_or_default();
        let reason = report
          .errors
          .iter()
          .map(|e| format!("{}: {}", e.field, e.message))
          .collect::<Vec<_>>()
          .join("; ");
        slots[i] = Some(BulkResult::err(id, "validation", reason));
      }
    }
    let saved = self.store().bulk_save(to_save).await?;
    for (slot, result) in save_slots.into_iter().zip(saved) {
      slots[slot] = Some(result);
    }
    Ok(slots.into_iter().flatten().collect())
  }
}

/// Keep exactly one document per distinct `@id`, the last one
/// observed.
pub fn dedup_by_id(containers: Vec<Container>) -> Vec<Container> {
  let mut by_id =
    indexmap::IndexMap::<String, Container>::with_capacity(
      containers.len(),
    );
  for container in containers {
    by_id.insert(container.doc.id.clone(), container);
  }
  by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use serde_json::json;
  use store::MemStore;
  use trellis_client::entities::{Document, Entity};

  use super::*;

  fn repo() -> Repo {
    Repo::new(Arc::new(MemStore::new()))
  }

  fn container(id: &str, name: &str) -> Container {
    Container {
      doc: Document::new(Container::KIND, id),
      name: name.to_string(),
      executable_name: "nginx:1.27".to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn dedup_keeps_the_last_revision_per_id() {
    let a1 = container("c1", "first");
    let mut a2 = container("c1", "second");
    a2.doc.rev = "2-x".to_string();
    let b = container("c2", "other");
    let deduped = dedup_by_id(vec![a1, b.clone(), a2]);
    assert_eq!(deduped.len(), 2);
    let c1 = deduped.iter().find(|c| c.doc.id == "c1").unwrap();
    assert_eq!(c1.name, "second");
  }

  #[tokio::test]
  async fn deleting_a_container_tombstones_and_cleans_stacks() {
    let repo = repo();
    let mut stack = Stack {
      doc: Document::new(Stack::KIND, "stack-web"),
      name: "web".to_string(),
      containers: vec!["c1".to_string(), "c2".to_string()],
      ..Default::default()
    };
    repo.save(&mut stack).await.unwrap();
    let mut c = container("c1", "web-1");
    repo.save(&mut c).await.unwrap();

    repo.delete_container("c1").await.unwrap();

    assert!(repo.is_container_ignored("c1").await.unwrap());
    let stack: Stack = repo.get("stack-web").await.unwrap();
    assert_eq!(stack.containers, vec!["c2"]);
    assert!(
      repo.try_get::<Container>("c1").await.unwrap().is_none()
    );
  }

  #[tokio::test]
  async fn auto_assign_prefers_the_longest_stack_prefix() {
    let repo = repo();
    for (id, name) in
      [("stack-web", "web"), ("stack-web-app", "web-app")]
    {
      let mut stack = Stack {
        doc: Document::new(Stack::KIND, id),
        name: name.to_string(),
        ..Default::default()
      };
      repo.save(&mut stack).await.unwrap();
    }
    let mut c = container("c1", "web-app-frontend");
    repo.save_container(&mut c).await.unwrap();

    let stack: Stack = repo.get("stack-web-app").await.unwrap();
    assert_eq!(stack.containers, vec!["c1"]);
    let other: Stack = repo.get("stack-web").await.unwrap();
    assert!(other.containers.is_empty());
  }

  #[tokio::test]
  async fn bulk_save_flags_the_invalid_document_alone() {
    let repo = repo();
    let valid = |id: &str| {
      json!({
        "@context": "https://schema.org",
        "@type": "SoftwareApplication",
        "@id": id,
        "name": id,
        "executableName": "nginx:1.27",
        "hostedOn": "host-a",
        "status": "running",
      })
    };
    let mut invalid = valid("c2");
    invalid["status"] = json!("zombie");

    let results = repo
      .bulk_save_containers(vec![valid("c1"), invalid, valid("c3")])
      .await
      .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].ok);
    assert!(!results[1].ok);
    assert_eq!(results[1].error.as_deref(), Some("validation"));
    assert!(
      results[1].reason.as_deref().unwrap().contains("status")
    );
    assert!(results[2].ok);

    let total = results.len();
    let success = results.iter().filter(|r| r.ok).count();
    assert_eq!((total, success, total - success), (3, 2, 1));
  }
}
