use anyhow::Context;
use serde_json::{Value, json};
use trellis_client::entities::stack::Stack;

use super::{Page, Repo, not_found, parse};

impl Repo {
  pub async fn list_stacks(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<Stack>> {
    self.list(page).await
  }

  pub async fn get_stack_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<Stack>> {
    let docs = self
      .store()
      .find(
        json!({ "@type": Stack::KIND, "name": name }),
        Some(1),
        None,
      )
      .await
      .context("failed to query stacks by name")?;
    docs.into_iter().next().map(parse::<Stack>).transpose()
  }

  /// Save a stack, normalizing the container set first.
  pub async fn save_stack(
    &self,
    stack: &mut Stack,
  ) -> serror::Result<String> {
    stack.normalize_containers();
    self.save(stack).await
  }

  pub async fn delete_stack(
    &self,
    id: &str,
  ) -> serror::Result<Stack> {
    let Some(stack) = self.try_get::<Stack>(id).await? else {
      return Err(not_found("stack", id));
    };
    self.delete::<Stack>(id, &stack.doc.rev).await?;
    self.audit("", "stack.delete", id, Value::Null).await;
    Ok(stack)
  }

  /// Container ids listed on the stack which neither resolve nor
  /// appear in the ignore list. A healthy stack returns none.
  pub async fn stack_dangling_containers(
    &self,
    stack: &Stack,
  ) -> anyhow::Result<Vec<String>> {
    let mut dangling = Vec::new();
    for id in &stack.containers {
      if self
        .try_get::<trellis_client::entities::container::Container>(
          id,
        )
        .await?
        .is_some()
      {
        continue;
      }
      if !self.is_container_ignored(id).await? {
        dangling.push(id.clone());
      }
    }
    Ok(dangling)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use store::MemStore;
  use trellis_client::entities::{
    Document, Entity, container::Container,
  };

  use super::*;

  #[tokio::test]
  async fn stack_integrity_holds_after_assign_and_remove_cycles() {
    let repo = Repo::new(Arc::new(MemStore::new()));
    let mut stack = Stack {
      doc: Document::new(Stack::KIND, "stack-web"),
      name: "web".to_string(),
      ..Default::default()
    };
    repo.save_stack(&mut stack).await.unwrap();

    for i in 0..3 {
      let mut c = Container {
        doc: Document::new(Container::KIND, format!("c{i}")),
        name: format!("web-{i}"),
        ..Default::default()
      };
      repo.save_container(&mut c).await.unwrap();
    }
    // A second save of the same container must not duplicate the id.
    let mut again: Container = repo.get("c0").await.unwrap();
    repo.save_container(&mut again).await.unwrap();

    repo.delete_container("c1").await.unwrap();

    let stack: Stack = repo.get("stack-web").await.unwrap();
    assert_eq!(stack.containers, vec!["c0", "c2"]);
    let mut sorted = stack.containers.clone();
    sorted.dedup();
    assert_eq!(sorted.len(), stack.containers.len());
    assert!(
      repo
        .stack_dangling_containers(&stack)
        .await
        .unwrap()
        .is_empty()
    );
  }
}
