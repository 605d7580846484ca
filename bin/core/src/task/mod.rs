//! Task subsystem background loops: the timeout sweeper and the
//! terminal-task cleanup. The state machine itself lives on
//! [TaskStatus][trellis_client::entities::task::TaskStatus]; the
//! queries live on the repository.

use std::time::Duration;

use async_timing_util::{Timelength, wait_until_timelength};
use trellis_client::entities::{
  task::{AgentTask, TaskError, TaskStatus},
  trellis_timestamp,
};

use crate::{config::core_config, repo::Repo, state};

pub fn spawn_task_sweeper() {
  tokio::spawn(async move {
    loop {
      wait_until_timelength(Timelength::TenSeconds, 0).await;
      match sweep_timeouts(state::repo()).await {
        Ok(0) => {}
        Ok(swept) => info!("timeout sweeper failed {swept} task/s"),
        Err(e) => warn!("timeout sweep failed | {e:#}"),
      }
    }
  });
}

pub fn spawn_task_cleanup() {
  tokio::spawn(async move {
    loop {
      wait_until_timelength(Timelength::FiveMinutes, 0).await;
      let config = core_config();
      let horizon =
        Duration::from_secs(config.keep_tasks_for_hours * 3600);
      match cleanup_terminal_tasks(
        state::repo(),
        horizon,
        config.cleanup_batch_size,
      )
      .await
      {
        Ok(0) => {}
        Ok(deleted) => {
          info!("task cleanup deleted {deleted} terminal task/s")
        }
        Err(e) => warn!("task cleanup failed | {e:#}"),
      }
    }
  });
}

/// Fail every running task whose `started_at + timeout_seconds` has
/// passed, reason `TIMEOUT`, and spawn its retry when eligible.
/// Returns how many tasks were timed out.
pub async fn sweep_timeouts(repo: &Repo) -> anyhow::Result<usize> {
  let now = trellis_timestamp();
  let mut swept = 0;
  for task in repo.running_tasks().await? {
    let Some(started_at) = task.started_at else {
      continue;
    };
    let deadline = started_at + task.timeout_seconds as i64 * 1000;
    if deadline >= now {
      continue;
    }
    let failed = repo
      .update_task_status(
        &task.doc.id,
        TaskStatus::Failed,
        Some(TaskError::new(
          "TIMEOUT",
          format!(
            "no completion within {}s",
            task.timeout_seconds
          ),
        )),
      )
      .await;
    let failed = match failed {
      Ok(failed) => failed,
      Err(e) => {
        warn!(
          "failed to time out task {} | {:#}",
          task.doc.id, e.error
        );
        continue;
      }
    };
    swept += 1;
    if failed.retry_eligible() {
      match repo.retry_task(&failed).await {
        Ok(retry) => debug!(
          "timed out task {} retried as {}",
          failed.doc.id, retry.doc.id
        ),
        Err(e) => warn!(
          "failed to retry timed out task {} | {:#}",
          failed.doc.id, e.error
        ),
      }
    }
  }
  Ok(swept)
}

/// Delete one batch of terminal tasks older than the horizon.
/// Returns how many were deleted.
pub async fn cleanup_terminal_tasks(
  repo: &Repo,
  keep_for: Duration,
  batch: usize,
) -> anyhow::Result<usize> {
  let cutoff = trellis_timestamp() - keep_for.as_millis() as i64;
  let tasks = repo.terminal_tasks_before(cutoff, batch).await?;
  let mut deleted = 0;
  for task in tasks {
    match repo
      .delete::<AgentTask>(&task.doc.id, &task.doc.rev)
      .await
    {
      Ok(()) => deleted += 1,
      // Deletes are strict; a raced task just waits for the next
      // batch.
      Err(e) => debug!(
        "cleanup skipped task {} | {:#}",
        task.doc.id, e.error
      ),
    }
  }
  Ok(deleted)
}
