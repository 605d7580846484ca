//! Executes stack-level deploy tasks addressed to the controller
//! itself: parse the definition out of the payload, place, deploy,
//! and settle the task with the outcome.

use std::sync::Arc;

use anyhow::Context;
use async_timing_util::{Timelength, wait_until_timelength};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use trellis_client::entities::{
  deployment::DeploymentStatus,
  stack::StackDefinition,
  task::{AgentTask, TaskError, TaskStatus, TaskType},
};

use crate::{
  placement::resolve_placements,
  repo::Repo,
  stack::{HostResolver, RepoHostResolver, parse_stack_definition},
  state,
};

use super::{DeployOptions, Deployer};

/// Agent id deploy tasks are addressed to when the controller runs
/// them.
pub const CONTROLLER_AGENT_ID: &str = "core";

pub fn spawn_deploy_driver() {
  tokio::spawn(async move {
    loop {
      wait_until_timelength(Timelength::FiveSeconds, 0).await;
      if let Err(e) = run_pending_deploys().await {
        warn!("deploy driver poll failed | {e:#}");
      }
    }
  });
}

async fn run_pending_deploys() -> anyhow::Result<()> {
  let repo = state::repo_arc();
  let tasks = repo
    .pending_tasks_for_agent(CONTROLLER_AGENT_ID)
    .await?;
  for task in tasks {
    if task.status != TaskStatus::Pending
      || task.task_type != TaskType::Deploy
    {
      continue;
    }
    execute_deploy_task(
      repo.clone(),
      state::docker_factory(),
      &task,
      CancellationToken::new(),
    )
    .await;
  }
  Ok(())
}

/// Claim and run one stack deploy task end to end. The task always
/// reaches a terminal status.
pub async fn execute_deploy_task(
  repo: Arc<Repo>,
  docker: Arc<dyn crate::docker::DockerClientFactory>,
  task: &AgentTask,
  cancel: CancellationToken,
) {
  let id = &task.doc.id;
  for status in [TaskStatus::Assigned, TaskStatus::Running] {
    if let Err(e) =
      repo.update_task_status(id, status, None).await
    {
      warn!(
        "failed to claim deploy task {id} | {:#}",
        e.error
      );
      return;
    }
  }

  match run_deploy(&repo, docker, task, cancel).await {
    Ok(result) => {
      let completed =
        repo.update_task_status(id, TaskStatus::Completed, None);
      if let Err(e) = completed.await {
        warn!(
          "failed to complete deploy task {id} | {:#}",
          e.error
        );
        return;
      }
      let mut task: AgentTask = match repo.get(id).await {
        Ok(task) => task,
        Err(_) => return,
      };
      task.result = Some(result);
      if let Err(e) = repo.save(&mut task).await {
        warn!(
          "failed to record deploy task result on {id} | {:#}",
          e.error
        );
      }
    }
    Err(e) => {
      if let Err(save_err) = repo
        .update_task_status(
          id,
          TaskStatus::Failed,
          Some(TaskError::new("DEPLOY", format!("{e:#}"))),
        )
        .await
      {
        warn!(
          "failed to fail deploy task {id} | {:#}",
          save_err.error
        );
      }
    }
  }
}

async fn run_deploy(
  repo: &Arc<Repo>,
  docker: Arc<dyn crate::docker::DockerClientFactory>,
  task: &AgentTask,
  cancel: CancellationToken,
) -> anyhow::Result<Value> {
  let definition: StackDefinition = serde_json::from_value(
    task
      .payload
      .get("definition")
      .cloned()
      .unwrap_or(Value::Null),
  )
  .context("deploy task payload has no stack definition")?;
  let opts = options_from_payload(&task.payload);

  let resolver = Arc::new(RepoHostResolver { repo: repo.clone() });
  let mut plan =
    parse_stack_definition(&definition, resolver.as_ref()).await?;
  if !plan.hosts_resolved {
    let hosts = resolver.list_hosts().await?;
    resolve_placements(&mut plan, &hosts)?;
  }

  let deployer = Deployer::new(repo.clone(), docker, resolver);
  let state = deployer.deploy(plan, opts, cancel).await?;
  match state.status {
    DeploymentStatus::Running => Ok(serde_json::json!({
      "deploymentId": state.doc.id,
      "placements": state.placements,
    })),
    status => {
      let message =
        state.error_message.clone().unwrap_or_default();
      Err(anyhow::anyhow!(
        "deployment {} ended {status}: {message}",
        state.doc.id
      ))
    }
  }
}

fn options_from_payload(payload: &Value) -> DeployOptions {
  let mut opts = DeployOptions::default();
  if let Some(rollback) = payload
    .get("rollbackOnError")
    .and_then(Value::as_bool)
  {
    opts.rollback_on_error = rollback;
  }
  if let Some(pull) =
    payload.get("pullImages").and_then(Value::as_bool)
  {
    opts.pull_images = pull;
  }
  if let Some(timeout) = payload
    .get("timeoutSeconds")
    .and_then(Value::as_u64)
  {
    opts.timeout = std::time::Duration::from_secs(timeout);
  }
  if let Some(name) =
    payload.get("stackName").and_then(Value::as_str)
  {
    opts.stack_name = name.to_string();
  }
  opts
}
