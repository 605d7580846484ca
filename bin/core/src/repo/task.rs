use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde_json::json;
use serror::AddStatusCodeError;
use trellis_client::entities::{
  Document, Entity, new_document_id,
  task::{AgentTask, TaskError, TaskStatus},
  trellis_timestamp,
};

use super::{MAX_PAGE_LIMIT, Repo, not_found, parse};

impl Repo {
  /// Persist a new task. Tasks always enter the machine at
  /// `pending`.
  pub async fn create_task(
    &self,
    task: &mut AgentTask,
  ) -> serror::Result<String> {
    if task.priority > 10 {
      return Err(
        anyhow!(
          "task priority {} out of range [0, 10]",
          task.priority
        )
        .status_code(StatusCode::BAD_REQUEST),
      );
    }
    if task.doc.id.is_empty() {
      task.doc.id = new_document_id("task");
    }
    task.status = TaskStatus::Pending;
    if task.created_at == 0 {
      task.created_at = trellis_timestamp();
    }
    self.save(task).await
  }

  /// The agent poll primitive: `pending` and `assigned` tasks for the
  /// agent, priority descending, `created_at` ascending on ties.
  /// Tasks with unmet dependencies are filtered out of the result.
  pub async fn pending_tasks_for_agent(
    &self,
    agent_id: &str,
  ) -> anyhow::Result<Vec<AgentTask>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": AgentTask::KIND,
          "agentId": agent_id,
          "status": { "$in": ["pending", "assigned"] },
        }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query pending tasks")?;
    let mut tasks = docs
      .into_iter()
      .map(parse::<AgentTask>)
      .collect::<anyhow::Result<Vec<_>>>()?;
    tasks.sort_by(|a, b| {
      b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
    });
    let mut ready = Vec::with_capacity(tasks.len());
    for task in tasks {
      if self.task_dependencies_met(&task).await? {
        ready.push(task);
      }
    }
    Ok(ready)
  }

  /// True iff every dependency is `completed`. Failed or cancelled
  /// dependencies block.
  pub async fn task_dependencies_met(
    &self,
    task: &AgentTask,
  ) -> anyhow::Result<bool> {
    for dep in &task.depends_on {
      match self.try_get::<AgentTask>(dep).await? {
        Some(dep) if dep.status == TaskStatus::Completed => {}
        _ => return Ok(false),
      }
    }
    Ok(true)
  }

  /// Advance a task through the state machine, stamping the
  /// transition timestamp. Transitions outside the machine are
  /// rejected.
  pub async fn update_task_status(
    &self,
    id: &str,
    to: TaskStatus,
    error: Option<TaskError>,
  ) -> serror::Result<AgentTask> {
    let Some(mut task) = self.try_get::<AgentTask>(id).await?
    else {
      return Err(not_found("task", id));
    };
    if !task.status.can_transition_to(to) {
      return Err(
        anyhow!(
          "invalid task transition {} -> {to} on {id}",
          task.status
        )
        .status_code(StatusCode::BAD_REQUEST),
      );
    }
    let now = trellis_timestamp();
    match to {
      TaskStatus::Assigned => task.assigned_at = Some(now),
      TaskStatus::Running => task.started_at = Some(now),
      TaskStatus::Completed
      | TaskStatus::Failed
      | TaskStatus::Cancelled => task.completed_at = Some(now),
      TaskStatus::Pending => {}
    }
    task.status = to;
    if to == TaskStatus::Failed {
      task.error = error;
    }
    self.save(&mut task).await?;
    Ok(task)
  }

  /// Create the retry for a failed task:
  /// `<originalId>-retry-<n+1>`, same payload and dependencies,
  /// `retry_count` bumped. The original task is left untouched.
  pub async fn retry_task(
    &self,
    original: &AgentTask,
  ) -> serror::Result<AgentTask> {
    if !original.retry_eligible() {
      return Err(
        anyhow!(
          "task {} is not retry eligible ({}; retry {}/{})",
          original.doc.id,
          original.status,
          original.retry_count,
          original.max_retries
        )
        .status_code(StatusCode::BAD_REQUEST),
      );
    }
    let mut retry = AgentTask {
      doc: Document::new(AgentTask::KIND, original.next_retry_id()),
      task_type: original.task_type,
      status: TaskStatus::Pending,
      agent_id: original.agent_id.clone(),
      host_id: original.host_id.clone(),
      stack_id: original.stack_id.clone(),
      container_id: original.container_id.clone(),
      priority: original.priority,
      payload: original.payload.clone(),
      depends_on: original.depends_on.clone(),
      timeout_seconds: original.timeout_seconds,
      retry_count: original.retry_count + 1,
      max_retries: original.max_retries,
      created_at: trellis_timestamp(),
      scheduled_by: original.scheduled_by.clone(),
      ..Default::default()
    };
    self.save(&mut retry).await?;
    Ok(retry)
  }

  pub async fn running_tasks(
    &self,
  ) -> anyhow::Result<Vec<AgentTask>> {
    let docs = self
      .store()
      .find(
        json!({ "@type": AgentTask::KIND, "status": "running" }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query running tasks")?;
    docs.into_iter().map(parse).collect()
  }

  /// Terminal tasks whose `completed_at` predates the cutoff, one
  /// cleanup batch at a time.
  pub async fn terminal_tasks_before(
    &self,
    cutoff: i64,
    batch: usize,
  ) -> anyhow::Result<Vec<AgentTask>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": AgentTask::KIND,
          "status": { "$in": ["completed", "failed", "cancelled"] },
          "completedAt": { "$lt": cutoff },
        }),
        Some(batch),
        None,
      )
      .await
      .context("failed to query terminal tasks")?;
    docs.into_iter().map(parse).collect()
  }

  /// Execution history of a scheduled action.
  pub async fn tasks_scheduled_by(
    &self,
    action_id: &str,
  ) -> anyhow::Result<Vec<AgentTask>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": AgentTask::KIND,
          "scheduledBy": action_id,
        }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query scheduled tasks")?;
    let mut tasks = docs
      .into_iter()
      .map(parse::<AgentTask>)
      .collect::<anyhow::Result<Vec<_>>>()?;
    tasks.sort_by_key(|t| t.created_at);
    Ok(tasks)
  }

  /// Tasks stranded in flight by a controller restart.
  pub async fn stranded_tasks(
    &self,
  ) -> anyhow::Result<Vec<AgentTask>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": AgentTask::KIND,
          "status": { "$in": ["assigned", "running"] },
        }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query in-flight tasks")?;
    docs.into_iter().map(parse).collect()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use store::MemStore;

  use super::*;

  fn repo() -> Repo {
    Repo::new(Arc::new(MemStore::new()))
  }

  fn task(id: &str, agent: &str, priority: u8) -> AgentTask {
    AgentTask {
      doc: Document::new(AgentTask::KIND, id),
      agent_id: agent.to_string(),
      priority,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn poll_orders_by_priority_then_age() {
    let repo = repo();
    // T1 pri 5 oldest, T2 pri 9 younger, T3 pri 5 youngest.
    let mut t1 = task("T1", "A", 5);
    t1.created_at = 1_000;
    let mut t2 = task("T2", "A", 9);
    t2.created_at = 2_000;
    let mut t3 = task("T3", "A", 5);
    t3.created_at = 3_000;
    for t in [&mut t1, &mut t2, &mut t3] {
      repo.create_task(t).await.unwrap();
    }

    let polled = repo.pending_tasks_for_agent("A").await.unwrap();
    let ids = polled
      .iter()
      .map(|t| t.doc.id.as_str())
      .collect::<Vec<_>>();
    assert_eq!(ids, vec!["T2", "T1", "T3"]);
  }

  #[tokio::test]
  async fn unmet_dependencies_are_filtered_from_the_poll() {
    let repo = repo();
    let mut dep = task("dep", "A", 5);
    repo.create_task(&mut dep).await.unwrap();
    let mut gated = task("gated", "A", 9);
    gated.depends_on = vec!["dep".to_string()];
    repo.create_task(&mut gated).await.unwrap();

    let polled = repo.pending_tasks_for_agent("A").await.unwrap();
    let ids = polled
      .iter()
      .map(|t| t.doc.id.as_str())
      .collect::<Vec<_>>();
    // The gated task is held back until its dependency completes.
    assert_eq!(ids, vec!["dep"]);

    repo
      .update_task_status("dep", TaskStatus::Assigned, None)
      .await
      .unwrap();
    repo
      .update_task_status("dep", TaskStatus::Running, None)
      .await
      .unwrap();
    repo
      .update_task_status("dep", TaskStatus::Completed, None)
      .await
      .unwrap();

    let polled = repo.pending_tasks_for_agent("A").await.unwrap();
    assert!(polled.iter().any(|t| t.doc.id == "gated"));
  }

  #[tokio::test]
  async fn transitions_outside_the_machine_are_rejected() {
    let repo = repo();
    let mut t = task("T1", "A", 5);
    repo.create_task(&mut t).await.unwrap();

    // pending -> running skips assigned.
    let err = repo
      .update_task_status("T1", TaskStatus::Running, None)
      .await
      .unwrap_err();
    assert!(
      err
        .error
        .to_string()
        .contains("invalid task transition")
    );

    repo
      .update_task_status("T1", TaskStatus::Assigned, None)
      .await
      .unwrap();
    let running = repo
      .update_task_status("T1", TaskStatus::Running, None)
      .await
      .unwrap();
    assert!(running.started_at.is_some());
    let done = repo
      .update_task_status("T1", TaskStatus::Completed, None)
      .await
      .unwrap();
    assert!(done.completed_at.is_some());
  }

  #[tokio::test]
  async fn retry_preserves_payload_and_genealogy() {
    let repo = repo();
    let mut t = task("T1", "A", 7);
    t.payload = serde_json::json!({ "image": "nginx:1.27" });
    t.depends_on = vec!["other".to_string()];
    repo.create_task(&mut t).await.unwrap();
    repo
      .update_task_status("T1", TaskStatus::Assigned, None)
      .await
      .unwrap();
    repo
      .update_task_status("T1", TaskStatus::Running, None)
      .await
      .unwrap();
    let failed = repo
      .update_task_status(
        "T1",
        TaskStatus::Failed,
        Some(TaskError::new("TIMEOUT", "deadline exceeded")),
      )
      .await
      .unwrap();

    let retry = repo.retry_task(&failed).await.unwrap();
    assert_eq!(retry.doc.id, "T1-retry-1");
    assert_eq!(retry.status, TaskStatus::Pending);
    assert_eq!(retry.retry_count, 1);
    assert_eq!(retry.payload, failed.payload);
    assert_eq!(retry.depends_on, failed.depends_on);

    // The original task is untouched.
    let original: AgentTask = repo.get("T1").await.unwrap();
    assert_eq!(original.status, TaskStatus::Failed);
    assert_eq!(original.retry_count, 0);
  }
}
