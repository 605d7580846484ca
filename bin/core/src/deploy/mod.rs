//! The deployer: executes a resolved [DeploymentPlan] wave by wave,
//! driving the Docker capability on every participating host and
//! recording authoritative progress on a
//! [DeploymentState] document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use trellis_client::entities::{
  Document, Entity,
  container::{Container, ContainerStatus},
  deployment::{
    DeploymentEvent, DeploymentState, DeploymentStatus, Placement,
    RollbackState,
  },
  host::HostInfo,
  stack::{Stack, StackStatus},
  task::{AgentTask, TaskError, TaskStatus, TaskType},
  trellis_timestamp,
};

use crate::{
  docker::{ContainerRun, DockerClientFactory},
  repo::Repo,
  stack::{ContainerSpec, DeploymentPlan, HealthCheck, HostResolver},
};

const PULL_ATTEMPTS: u32 = 3;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DeployOptions {
  /// Per-container health deadline.
  pub timeout: Duration,
  pub rollback_on_error: bool,
  pub pull_images: bool,
  /// Overrides the plan's stack name when non-empty.
  pub stack_name: String,
}

impl Default for DeployOptions {
  fn default() -> DeployOptions {
    DeployOptions {
      timeout: Duration::from_secs(300),
      rollback_on_error: true,
      pull_images: false,
      stack_name: String::new(),
    }
  }
}

pub struct Deployer {
  repo: Arc<Repo>,
  docker: Arc<dyn DockerClientFactory>,
  resolver: Arc<dyn HostResolver>,
}

/// What one container deployment produced: its placement plus the
/// events captured while it ran.
struct ContainerOutcome {
  service: String,
  placement: Placement,
  events: Vec<DeploymentEvent>,
}

impl Deployer {
  pub fn new(
    repo: Arc<Repo>,
    docker: Arc<dyn DockerClientFactory>,
    resolver: Arc<dyn HostResolver>,
  ) -> Deployer {
    Deployer {
      repo,
      docker,
      resolver,
    }
  }

  /// Run a plan to completion. Deployment failure is expressed on the
  /// returned [DeploymentState], not as an `Err`: only infrastructure
  /// problems (the state document itself unwritable) error out.
  pub async fn deploy(
    &self,
    plan: DeploymentPlan,
    opts: DeployOptions,
    cancel: CancellationToken,
  ) -> anyhow::Result<DeploymentState> {
    if !plan.hosts_resolved {
      return Err(anyhow!(
        "plan for stack {} still has unplaced services",
        plan.stack.name
      ));
    }
    let stack_name = if opts.stack_name.is_empty() {
      plan.stack.name.clone()
    } else {
      opts.stack_name.clone()
    };

    let mut state = DeploymentState {
      stack_id: if plan.stack.doc.id.is_empty() {
        stack_name.clone()
      } else {
        plan.stack.doc.id.clone()
      },
      status: DeploymentStatus::Deploying,
      phase: "starting".to_string(),
      ..Default::default()
    };
    state.push_event("starting", "", format!("deploying {stack_name}"));
    self.repo.create_deployment_state(&mut state).await.map_err(|e| e.error)?;

    let hosts = self.host_map(&plan).await?;
    let tasks = self
      .dispatch_container_tasks(&plan, &state, &stack_name)
      .await;

    if let Err(e) = self
      .prepare_hosts(&plan, &opts, &mut state, &cancel)
      .await
    {
      return self
        .finish_failure(state, &tasks, Vec::new(), &opts, e)
        .await;
    }

    // Containers created so far, in creation order, as
    // (host id, container name).
    let mut created: Vec<(String, String)> = Vec::new();
    let total_waves = plan.waves.len().max(1);

    for (wave_index, wave) in plan.waves.iter().enumerate() {
      if cancel.is_cancelled() {
        return self
          .finish_failure(
            state,
            &tasks,
            created,
            &opts,
            anyhow!("deployment cancelled"),
          )
          .await;
      }
      state.phase = format!("wave {}/{total_waves}", wave_index + 1);
      self.save_state(&mut state).await?;

      let outcomes = join_all(wave.iter().map(|&index| {
        self.deploy_container(
          &plan,
          index,
          &stack_name,
          &hosts,
          &opts,
          &tasks,
          &cancel,
        )
      }))
      .await;

      let mut first_error = None;
      for outcome in outcomes {
        match outcome {
          Ok(outcome) => {
            created.push((
              outcome.placement.host_id.clone(),
              outcome.placement.container_name.clone(),
            ));
            state.events.extend(outcome.events);
            state
              .placements
              .insert(outcome.service.clone(), outcome.placement);
          }
          Err((service, events, e)) => {
            state.events.extend(events);
            if first_error.is_none() {
              first_error = Some((service, e));
            }
          }
        }
      }

      if let Some((service, e)) = first_error {
        return self
          .finish_failure(
            state,
            &tasks,
            created,
            &opts,
            e.context(format!("service {service} failed")),
          )
          .await;
      }

      state.push_event(
        "wave_complete",
        "",
        format!("wave {}/{total_waves} healthy", wave_index + 1),
      );
      state.progress =
        (100 * (wave_index + 1) / total_waves) as u8;
      self.save_state(&mut state).await?;
    }

    self.persist_containers(&plan, &state).await;

    state.status = DeploymentStatus::Running;
    state.phase = "complete".to_string();
    state.progress = 100;
    state.completed_at = Some(trellis_timestamp());
    state.push_event("complete", "", "all waves healthy");
    self.save_state(&mut state).await?;

    // The stack document update is idempotent (set union) and never
    // fails the deployment: the DeploymentState is authoritative.
    if let Err(e) =
      self.update_stack(&plan, &state, &stack_name).await
    {
      warn!(
        "failed to update stack document for {stack_name} | {e:#}"
      );
      state.push_event("stack_update_failed", "", format!("{e:#}"));
      self.save_state(&mut state).await?;
    }

    Ok(state)
  }

  async fn host_map(
    &self,
    plan: &DeploymentPlan,
  ) -> anyhow::Result<HashMap<String, HostInfo>> {
    let mut hosts = HashMap::new();
    for host_id in plan.target_hosts() {
      let info = self
        .resolver
        .resolve_host(host_id)
        .await?
        .with_context(|| {
          format!("plan references unknown host {host_id}")
        })?;
      hosts.insert(host_id.to_string(), info);
    }
    Ok(hosts)
  }

  /// One tracking task per container, addressed to the host's agent,
  /// with dependencies mirroring the service graph. service name ->
  /// task id.
  async fn dispatch_container_tasks(
    &self,
    plan: &DeploymentPlan,
    state: &DeploymentState,
    stack_name: &str,
  ) -> HashMap<String, String> {
    let task_ids = plan
      .specs
      .iter()
      .map(|spec| {
        (
          spec.name.clone(),
          format!("{}-{}", state.doc.id, spec.name),
        )
      })
      .collect::<HashMap<_, _>>();
    for spec in &plan.specs {
      let mut task = AgentTask {
        doc: Document::new(
          AgentTask::KIND,
          task_ids[&spec.name].clone(),
        ),
        task_type: TaskType::Deploy,
        agent_id: spec.located_in_host.clone(),
        host_id: spec.located_in_host.clone(),
        stack_id: state.stack_id.clone(),
        container_id: spec.id.clone(),
        payload: serde_json::json!({
          "service": spec.name,
          "image": spec.executable_name,
          "stack": stack_name,
        }),
        depends_on: spec
          .depends_on
          .iter()
          .filter_map(|dep| task_ids.get(dep).cloned())
          .collect(),
        ..Default::default()
      };
      if let Err(e) = self.repo.create_task(&mut task).await {
        warn!(
          "failed to dispatch task for service {} | {:#}",
          spec.name, e.error
        );
      }
    }
    task_ids
  }

  /// Pre-pull images (bounded to one in-flight pull per host) and
  /// create the stack network everywhere.
  async fn prepare_hosts(
    &self,
    plan: &DeploymentPlan,
    opts: &DeployOptions,
    state: &mut DeploymentState,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    if opts.pull_images {
      state.phase = "pulling".to_string();
      self.save_state(state).await?;
      let mut by_host = HashMap::<&str, Vec<&ContainerSpec>>::new();
      for spec in &plan.specs {
        by_host
          .entry(spec.located_in_host.as_str())
          .or_default()
          .push(spec);
      }
      let pulls =
        join_all(by_host.into_iter().map(|(host_id, specs)| {
          let cancel = cancel.clone();
          async move {
            let client = self.docker.client_for(host_id).await?;
            for spec in specs {
              if cancel.is_cancelled() {
                return Err(anyhow!("deployment cancelled"));
              }
              pull_with_retry(
                client.as_ref(),
                &spec.executable_name,
              )
              .await?;
            }
            anyhow::Ok(())
          }
        }))
        .await;
      for result in pulls {
        result?;
      }
      state.push_event("pulled", "", "images present on all hosts");
    }

    let network = plan.network_name();
    for host_id in plan.target_hosts() {
      if cancel.is_cancelled() {
        return Err(anyhow!("deployment cancelled"));
      }
      let client = self.docker.client_for(host_id).await?;
      client
        .create_network(&network, plan.network_driver())
        .await
        .with_context(|| {
          format!("create network {network} on {host_id}")
        })?;
    }
    state.push_event("network", "", format!("network {network} ready"));
    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  async fn deploy_container(
    &self,
    plan: &DeploymentPlan,
    index: usize,
    stack_name: &str,
    hosts: &HashMap<String, HostInfo>,
    opts: &DeployOptions,
    tasks: &HashMap<String, String>,
    cancel: &CancellationToken,
  ) -> Result<
    ContainerOutcome,
    (String, Vec<DeploymentEvent>, anyhow::Error),
  > {
    let spec = &plan.specs[index];
    let service = spec.name.clone();
    let mut events = Vec::new();
    let task_id = tasks.get(&service).cloned().unwrap_or_default();

    let result = self
      .run_container(
        plan, spec, stack_name, hosts, opts, &task_id, &mut events,
        cancel,
      )
      .await;
    match result {
      Ok(placement) => {
        self
          .transition_task(&task_id, TaskStatus::Completed, None)
          .await;
        Ok(ContainerOutcome {
          service,
          placement,
          events,
        })
      }
      Err(e) => {
        self
          .transition_task(
            &task_id,
            TaskStatus::Failed,
            Some(TaskError::new("DEPLOY", format!("{e:#}"))),
          )
          .await;
        events.push(DeploymentEvent {
          ts: trellis_timestamp(),
          stage: "failed".to_string(),
          service: service.clone(),
          message: format!("{e:#}"),
        });
        Err((service, events, e))
      }
    }
  }

  #[allow(clippy::too_many_arguments)]
  async fn run_container(
    &self,
    plan: &DeploymentPlan,
    spec: &ContainerSpec,
    stack_name: &str,
    hosts: &HashMap<String, HostInfo>,
    opts: &DeployOptions,
    task_id: &str,
    events: &mut Vec<DeploymentEvent>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<Placement> {
    if cancel.is_cancelled() {
      return Err(anyhow!("deployment cancelled"));
    }
    let host = hosts
      .get(&spec.located_in_host)
      .with_context(|| {
        format!("no host info for {}", spec.located_in_host)
      })?;
    let container_name = format!("{stack_name}-{}", spec.name);

    self
      .transition_task(task_id, TaskStatus::Assigned, None)
      .await;
    let client =
      self.docker.client_for(&spec.located_in_host).await?;
    self
      .transition_task(task_id, TaskStatus::Running, None)
      .await;

    let run = ContainerRun {
      image: spec.executable_name.clone(),
      env: container_env(plan, spec, hosts),
      ports: spec.ports.clone(),
      labels: [(
        "trellis.stack".to_string(),
        stack_name.to_string(),
      )]
      .into_iter()
      .collect(),
      network: Some(plan.network_name()),
    };
    client
      .create_container(&container_name, &run)
      .await
      .with_context(|| format!("create {container_name}"))?;
    events.push(event("created", &spec.name, container_name.as_str()));

    client
      .start_container(&container_name)
      .await
      .with_context(|| format!("start {container_name}"))?;
    events.push(event("started", &spec.name, container_name.as_str()));

    self
      .wait_healthy(
        client.as_ref(),
        spec,
        &host.host.ip_address,
        &container_name,
        opts.timeout,
      )
      .await?;
    events.push(event("healthy", &spec.name, container_name.as_str()));

    Ok(Placement {
      container_id: spec.id.clone(),
      container_name,
      host_id: spec.located_in_host.clone(),
    })
  }

  /// Poll until the spec's health declaration passes or the deadline
  /// expires. Specs without one are healthy once running.
  async fn wait_healthy(
    &self,
    client: &dyn crate::docker::DockerClient,
    spec: &ContainerSpec,
    host_ip: &str,
    container_name: &str,
    deadline: Duration,
  ) -> anyhow::Result<()> {
    let check = async {
      loop {
        let healthy = match &spec.health_check {
          None => client
            .inspect_container(container_name)
            .await
            .map(|summary| summary.running)
            .unwrap_or(false),
          Some(HealthCheck::Http { path, port }) => {
            let host_port = spec
              .ports
              .iter()
              .find(|p| p.container_port == *port)
              .map(|p| p.host_port)
              .unwrap_or(*port);
            let url = format!("http://{host_ip}:{host_port}{path}");
            match reqwest::get(&url).await {
              Ok(res) => res.status().is_success(),
              Err(_) => false,
            }
          }
          Some(HealthCheck::Exec { command }) => client
            .exec(container_name, command)
            .await
            .unwrap_or(false),
        };
        if healthy {
          return;
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
      }
    };
    tokio::time::timeout(deadline, check)
      .await
      .map_err(|_| {
        anyhow!(
          "{container_name} failed health check within {deadline:?}"
        )
      })
  }

  /// Persist container documents for everything that deployed. Plain
  /// saves: the deployer does its own stack union afterwards.
  async fn persist_containers(
    &self,
    plan: &DeploymentPlan,
    state: &DeploymentState,
  ) {
    for spec in &plan.specs {
      let Some(placement) = state.placements.get(&spec.name)
      else {
        continue;
      };
      let mut container = Container {
        doc: Document::new(Container::KIND, spec.id.clone()),
        name: placement.container_name.clone(),
        executable_name: spec.executable_name.clone(),
        status: ContainerStatus::Running,
        hosted_on: placement.host_id.clone(),
        ports: spec.ports.clone(),
        environment: spec.environment.clone(),
        depends_on: spec
          .depends_on
          .iter()
          .filter_map(|dep| {
            plan
              .specs
              .iter()
              .find(|s| &s.name == dep)
              .map(|s| s.id.clone())
          })
          .collect(),
        ..Default::default()
      };
      if let Ok(Some(existing)) =
        self.repo.try_get::<Container>(&spec.id).await
      {
        container.doc.rev = existing.doc.rev;
        container.created_at = existing.created_at;
      }
      if let Err(e) = self.repo.save(&mut container).await {
        warn!(
          "failed to persist container document {} | {:#}",
          spec.id, e.error
        );
      }
    }
  }

  /// Set-union the deployed container ids into the stack document,
  /// creating it on first deploy.
  async fn update_stack(
    &self,
    plan: &DeploymentPlan,
    state: &DeploymentState,
    stack_name: &str,
  ) -> anyhow::Result<()> {
    let mut stack: Stack = match self
      .repo
      .get_stack_by_name(stack_name)
      .await?
    {
      Some(stack) => stack,
      None => {
        let mut stack = plan.stack.clone();
        stack.doc.rev = String::new();
        stack.name = stack_name.to_string();
        stack
      }
    };
    for placement in state.placements.values() {
      stack.add_container(&placement.container_id);
    }
    stack.status = StackStatus::Running;
    stack.deployed_at = Some(trellis_timestamp());
    self
      .repo
      .save_stack(&mut stack)
      .await
      .map_err(|e| e.error)?;
    Ok(())
  }

  /// Terminal handling for a failed or cancelled deployment.
  async fn finish_failure(
    &self,
    mut state: DeploymentState,
    tasks: &HashMap<String, String>,
    created: Vec<(String, String)>,
    opts: &DeployOptions,
    error: anyhow::Error,
  ) -> anyhow::Result<DeploymentState> {
    // Undispatched work is cancelled, not failed.
    for task_id in tasks.values() {
      if let Ok(Some(task)) =
        self.repo.try_get::<AgentTask>(task_id).await
        && task.status == TaskStatus::Pending
      {
        self
          .transition_task(task_id, TaskStatus::Cancelled, None)
          .await;
      }
    }

    if opts.rollback_on_error {
      state.phase = "rollback".to_string();
      self.save_state(&mut state).await?;
      let rollback = self.rollback(&created, &mut state).await;
      state.rollback_state = Some(rollback);
      state.status = DeploymentStatus::RolledBack;
    } else {
      state.status = DeploymentStatus::Failed;
    }
    state.completed_at = Some(trellis_timestamp());
    state.error_message = Some(format!("{error:#}"));
    state.push_event("finished", "", format!("{error:#}"));
    self.save_state(&mut state).await?;
    Ok(state)
  }

  /// Delete every created container in reverse creation order.
  /// Best-effort: individual errors are recorded and never mask the
  /// original failure.
  async fn rollback(
    &self,
    created: &[(String, String)],
    state: &mut DeploymentState,
  ) -> RollbackState {
    let mut rollback = RollbackState::default();
    for (host_id, container_name) in created.iter().rev() {
      let result = async {
        let client = self.docker.client_for(host_id).await?;
        client.remove_container(container_name, true).await
      }
      .await;
      match result {
        Ok(()) => {
          state.push_event(
            "rollback",
            "",
            format!("removed {container_name} on {host_id}"),
          );
          rollback.removed.push(container_name.clone());
        }
        Err(e) => {
          let message = format!(
            "failed to remove {container_name} on {host_id}: {e:#}"
          );
          warn!("{message}");
          state.push_event("rollback", "", message.clone());
          rollback.errors.push(message);
        }
      }
    }
    rollback
  }

  async fn save_state(
    &self,
    state: &mut DeploymentState,
  ) -> anyhow::Result<()> {
    self
      .repo
      .save(state)
      .await
      .map_err(|e| e.error)
      .context("failed to persist deployment state")
  }

  /// Task tracking is best-effort alongside the deployment itself.
  async fn transition_task(
    &self,
    task_id: &str,
    to: TaskStatus,
    error: Option<TaskError>,
  ) {
    if task_id.is_empty() {
      return;
    }
    if let Err(e) =
      self.repo.update_task_status(task_id, to, error).await
    {
      debug!(
        "failed to transition task {task_id} to {to} | {:#}",
        e.error
      );
    }
  }
}

fn event(
  stage: &str,
  service: &str,
  message: impl Into<String>,
) -> DeploymentEvent {
  DeploymentEvent {
    ts: trellis_timestamp(),
    stage: stage.to_string(),
    service: service.to_string(),
    message: message.into(),
  }
}

/// The container's own environment plus a
/// `{SVC}_ENDPOINT=<host>:<port>` entry for every other service with
/// a published port, so services find each other across hosts.
fn container_env(
  plan: &DeploymentPlan,
  spec: &ContainerSpec,
  hosts: &HashMap<String, HostInfo>,
) -> Vec<String> {
  let mut env = spec
    .environment
    .iter()
    .map(|(k, v)| format!("{k}={v}"))
    .collect::<Vec<_>>();
  for other in &plan.specs {
    if other.name == spec.name {
      continue;
    }
    let Some(port) = other.ports.first() else {
      continue;
    };
    let Some(host) = hosts.get(&other.located_in_host) else {
      continue;
    };
    env.push(format!(
      "{}_ENDPOINT={}:{}",
      sanitize_env_key(&other.name),
      host.host.ip_address,
      port.host_port,
    ));
  }
  env
}

fn sanitize_env_key(service: &str) -> String {
  service
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() {
        c.to_ascii_uppercase()
      } else {
        '_'
      }
    })
    .collect()
}

async fn pull_with_retry(
  client: &dyn crate::docker::DockerClient,
  image: &str,
) -> anyhow::Result<()> {
  let mut backoff = Duration::from_secs(1);
  for attempt in 1..=PULL_ATTEMPTS {
    match client.pull_image(image).await {
      Ok(()) => return Ok(()),
      Err(e) if attempt == PULL_ATTEMPTS => {
        return Err(e.context(format!(
          "pull {image} failed after {PULL_ATTEMPTS} attempts"
        )));
      }
      Err(e) => {
        warn!(
          "pull {image} attempt {attempt}/{PULL_ATTEMPTS} failed, retrying | {e:#}"
        );
        tokio::time::sleep(backoff).await;
        backoff *= 2;
      }
    }
  }
  unreachable!("pull retries exhausted")
}

mod driver;

pub use driver::{
  CONTROLLER_AGENT_ID, execute_deploy_task, spawn_deploy_driver,
};

#[cfg(test)]
mod tests;
