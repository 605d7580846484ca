//! Startup work, run after the store client is initialized:
//! idempotent index / view creation, recovery of work stranded by the
//! previous shutdown, and the agent directory seed.

use store::{Reduce, ViewDef};
use trellis_client::entities::{
  Entity,
  container::Container,
  host::Host,
  task::{TaskError, TaskStatus},
};

use crate::{repo::Repo, state};

pub async fn on_startup() {
  if let Err(e) = ensure_indexes(state::repo()).await {
    error!("failed to ensure store indexes / views | {e:#}");
  }
  tokio::join!(fail_stranded_tasks(), load_agent_directory());
}

/// The index and view set every query path relies on. Safe to run on
/// every boot.
pub async fn ensure_indexes(repo: &Repo) -> anyhow::Result<()> {
  let store = repo.store();

  store
    .ensure_index(
      "type-status-host",
      &["@type", "status", "hostedOn"],
    )
    .await?;
  store
    .ensure_index(
      "type-location-status",
      &["@type", "location", "status"],
    )
    .await?;
  store.ensure_index("type-name", &["@type", "name"]).await?;

  let container_kinds = kinds_of::<Container>();
  store
    .ensure_view(
      "containers",
      &[
        (
          "containers_by_host",
          ViewDef {
            doc_kinds: container_kinds.clone(),
            key_field: "hostedOn".to_string(),
            reduce: None,
          },
        ),
        (
          "containers_by_status",
          ViewDef {
            doc_kinds: container_kinds.clone(),
            key_field: "status".to_string(),
            reduce: None,
          },
        ),
        (
          "containers_by_image",
          ViewDef {
            doc_kinds: container_kinds.clone(),
            key_field: "executableName".to_string(),
            reduce: None,
          },
        ),
        (
          "container_count_by_host",
          ViewDef {
            doc_kinds: container_kinds,
            key_field: "hostedOn".to_string(),
            reduce: Some(Reduce::Sum),
          },
        ),
      ],
    )
    .await?;

  let host_kinds = kinds_of::<Host>();
  store
    .ensure_view(
      "hosts",
      &[
        (
          "hosts_by_datacenter",
          ViewDef {
            doc_kinds: host_kinds.clone(),
            key_field: "location".to_string(),
            reduce: None,
          },
        ),
        (
          "host_status_summary",
          ViewDef {
            doc_kinds: host_kinds,
            key_field: "status".to_string(),
            reduce: Some(Reduce::Sum),
          },
        ),
      ],
    )
    .await?;

  Ok(())
}

fn kinds_of<E: Entity>() -> Vec<String> {
  E::kinds().iter().map(ToString::to_string).collect()
}

/// Tasks left `assigned` / `running` by a controller restart cannot
/// complete: fail them with reason `SHUTDOWN` and spawn retries where
/// eligible.
async fn fail_stranded_tasks() {
  let repo = state::repo();
  let stranded = match repo.stranded_tasks().await {
    Ok(stranded) => stranded,
    Err(e) => {
      error!("failed to query stranded tasks | {e:#}");
      return;
    }
  };
  for task in stranded {
    let failed = repo
      .update_task_status(
        &task.doc.id,
        TaskStatus::Failed,
        Some(TaskError::new(
          "SHUTDOWN",
          "controller restarted mid-execution",
        )),
      )
      .await;
    match failed {
      Ok(failed) if failed.retry_eligible() => {
        if let Err(e) = repo.retry_task(&failed).await {
          warn!(
            "failed to retry stranded task {} | {:#}",
            failed.doc.id, e.error
          );
        }
      }
      Ok(_) => {}
      Err(e) => warn!(
        "failed to fail stranded task {} | {:#}",
        task.doc.id, e.error
      ),
    }
  }
}

async fn load_agent_directory() {
  if let Err(e) = state::agents().load(state::repo()).await {
    error!("failed to load agent directory | {e:#}");
  }
}
