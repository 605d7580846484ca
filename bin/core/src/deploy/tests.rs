use std::collections::HashSet;
use std::sync::Mutex;

use store::MemStore;
use trellis_client::entities::host::Host;

use crate::stack::{StaticHostResolver, compute_waves};

use super::*;

/// (host, operation, subject) triples, in call order.
type OpLog = Arc<Mutex<Vec<(String, String, String)>>>;

struct FakeDocker {
  host: String,
  log: OpLog,
  fail_create: Arc<HashSet<String>>,
}

#[async_trait::async_trait]
impl crate::docker::DockerClient for FakeDocker {
  async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
    self.record("pull", image);
    Ok(())
  }

  async fn create_network(
    &self,
    name: &str,
    _driver: &str,
  ) -> anyhow::Result<()> {
    self.record("network", name);
    Ok(())
  }

  async fn create_container(
    &self,
    name: &str,
    _run: &ContainerRun,
  ) -> anyhow::Result<String> {
    if self.fail_create.contains(name) {
      return Err(anyhow!("simulated create failure for {name}"));
    }
    self.record("create", name);
    Ok(format!("docker-{name}"))
  }

  async fn start_container(&self, name: &str) -> anyhow::Result<()> {
    self.record("start", name);
    Ok(())
  }

  async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
    self.record("stop", name);
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
    _force: bool,
  ) -> anyhow::Result<()> {
    self.record("remove", name);
    Ok(())
  }

  async fn inspect_container(
    &self,
    _name: &str,
  ) -> anyhow::Result<crate::docker::ContainerSummary> {
    Ok(crate::docker::ContainerSummary {
      id: None,
      state: "running".to_string(),
      running: true,
    })
  }

  async fn container_logs(
    &self,
    _name: &str,
    _tail: usize,
  ) -> anyhow::Result<String> {
    Ok(String::new())
  }

  async fn exec(
    &self,
    _container: &str,
    _command: &[String],
  ) -> anyhow::Result<bool> {
    Ok(true)
  }
}

impl FakeDocker {
  fn record(&self, op: &str, subject: &str) {
    self.log.lock().unwrap().push((
      self.host.clone(),
      op.to_string(),
      subject.to_string(),
    ));
  }
}

struct FakeFactory {
  log: OpLog,
  fail_create: Arc<HashSet<String>>,
}

#[async_trait::async_trait]
impl DockerClientFactory for FakeFactory {
  async fn client_for(
    &self,
    host_id: &str,
  ) -> anyhow::Result<Arc<dyn crate::docker::DockerClient>> {
    Ok(Arc::new(FakeDocker {
      host: host_id.to_string(),
      log: self.log.clone(),
      fail_create: self.fail_create.clone(),
    }))
  }
}

fn host_info(id: &str, ip: &str) -> HostInfo {
  HostInfo {
    host: Host {
      doc: Document::new(Host::KIND, id),
      name: id.to_string(),
      ip_address: ip.to_string(),
      ..Default::default()
    },
    ..Default::default()
  }
}

fn spec(name: &str, deps: &[&str], host: &str) -> ContainerSpec {
  ContainerSpec {
    id: format!("container-{name}"),
    name: name.to_string(),
    executable_name: format!("{name}:latest"),
    located_in_host: host.to_string(),
    depends_on: deps.iter().map(ToString::to_string).collect(),
    ..Default::default()
  }
}

fn plan_for(specs: Vec<ContainerSpec>) -> DeploymentPlan {
  let waves = compute_waves(&specs).unwrap();
  DeploymentPlan {
    stack: Stack {
      name: "teststack".to_string(),
      ..Default::default()
    },
    waves,
    specs,
    hosts_resolved: true,
    ..Default::default()
  }
}

fn harness(
  fail_create: &[&str],
) -> (Arc<Repo>, Deployer, OpLog) {
  let repo = Arc::new(Repo::new(Arc::new(MemStore::new())));
  let log: OpLog = Arc::new(Mutex::new(Vec::new()));
  let factory = Arc::new(FakeFactory {
    log: log.clone(),
    fail_create: Arc::new(
      fail_create.iter().map(ToString::to_string).collect(),
    ),
  });
  let resolver = Arc::new(StaticHostResolver {
    hosts: vec![
      host_info("h1", "10.0.0.1"),
      host_info("h2", "10.0.0.2"),
      host_info("h3", "10.0.0.3"),
    ],
  });
  let deployer = Deployer::new(repo.clone(), factory, resolver);
  (repo, deployer, log)
}

fn create_position(log: &OpLog, name: &str) -> usize {
  log
    .lock()
    .unwrap()
    .iter()
    .position(|(_, op, subject)| op == "create" && subject == name)
    .unwrap_or_else(|| panic!("{name} was never created"))
}

#[tokio::test]
async fn waves_deploy_in_dependency_order() {
  let (repo, deployer, log) = harness(&[]);
  let plan = plan_for(vec![
    spec("web", &["api"], "h1"),
    spec("api", &["db", "cache"], "h1"),
    spec("db", &[], "h1"),
    spec("cache", &[], "h1"),
  ]);

  let state = deployer
    .deploy(plan, DeployOptions::default(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(state.status, DeploymentStatus::Running);
  assert_eq!(state.progress, 100);
  assert_eq!(state.placements.len(), 4);
  assert!(state.completed_at.is_some());

  // Wave 0 (cache, db) strictly precedes api, which precedes web.
  let api = create_position(&log, "teststack-api");
  assert!(create_position(&log, "teststack-db") < api);
  assert!(create_position(&log, "teststack-cache") < api);
  assert!(api < create_position(&log, "teststack-web"));

  // Every dependency edge is visible in the event log: the
  // dependent's create is never earlier than the dependency's
  // healthy.
  let ts = |stage: &str, service: &str| {
    state
      .events
      .iter()
      .find(|e| e.stage == stage && e.service == service)
      .unwrap_or_else(|| panic!("no {stage} event for {service}"))
      .ts
  };
  for (dependent, dependency) in
    [("web", "api"), ("api", "db"), ("api", "cache")]
  {
    assert!(ts("created", dependent) >= ts("healthy", dependency));
  }

  // The stack document unioned all four container ids.
  let stack = repo
    .get_stack_by_name("teststack")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(stack.status, StackStatus::Running);
  assert_eq!(stack.containers.len(), 4);
  assert!(stack.deployed_at.is_some());

  // Tracking tasks walked the machine to completed.
  let task: AgentTask = repo
    .get(&format!("{}-web", state.doc.id))
    .await
    .unwrap();
  assert_eq!(task.status, TaskStatus::Completed);
  assert!(task.started_at.is_some());
}

#[tokio::test]
async fn mid_wave_failure_rolls_back_in_reverse_order() {
  let (repo, deployer, log) = harness(&["teststack-api"]);
  let plan = plan_for(vec![
    spec("web", &["api"], "h1"),
    spec("api", &["db", "cache"], "h1"),
    spec("db", &[], "h1"),
    spec("cache", &[], "h1"),
  ]);

  let state = deployer
    .deploy(plan, DeployOptions::default(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(state.status, DeploymentStatus::RolledBack);
  assert!(
    state.error_message.as_deref().unwrap().contains("api")
  );

  // Wave 0 containers were created, then removed in reverse
  // creation order.
  let ops = log.lock().unwrap().clone();
  let created = ops
    .iter()
    .filter(|(_, op, _)| op == "create")
    .map(|(_, _, name)| name.clone())
    .collect::<Vec<_>>();
  let removed = ops
    .iter()
    .filter(|(_, op, _)| op == "remove")
    .map(|(_, _, name)| name.clone())
    .collect::<Vec<_>>();
  assert_eq!(created.len(), 2);
  assert_eq!(
    removed,
    created.iter().rev().cloned().collect::<Vec<_>>()
  );
  let rollback = state.rollback_state.as_ref().unwrap();
  assert_eq!(rollback.removed, removed);
  assert!(rollback.errors.is_empty());

  // api failed, web (never dispatched) was cancelled.
  let api: AgentTask = repo
    .get(&format!("{}-api", state.doc.id))
    .await
    .unwrap();
  assert_eq!(api.status, TaskStatus::Failed);
  let web: AgentTask = repo
    .get(&format!("{}-web", state.doc.id))
    .await
    .unwrap();
  assert_eq!(web.status, TaskStatus::Cancelled);

  // No container documents were persisted for the failed deploy.
  assert!(
    repo
      .try_get::<Container>("container-db")
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn failure_without_rollback_marks_failed() {
  let (_repo, deployer, log) = harness(&["teststack-api"]);
  let plan = plan_for(vec![
    spec("api", &["db"], "h1"),
    spec("db", &[], "h1"),
  ]);

  let state = deployer
    .deploy(
      plan,
      DeployOptions {
        rollback_on_error: false,
        ..Default::default()
      },
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(state.status, DeploymentStatus::Failed);
  assert!(state.rollback_state.is_none());
  let ops = log.lock().unwrap().clone();
  assert!(!ops.iter().any(|(_, op, _)| op == "remove"));
}

#[tokio::test]
async fn cross_host_deploy_injects_service_endpoints() {
  let (_repo, deployer, _log) = harness(&[]);
  let mut api = spec("api", &[], "h2");
  api.ports = vec![trellis_client::entities::container::PortMapping {
    host_port: 8080,
    container_port: 80,
    ..Default::default()
  }];
  let web = spec("web", &["api"], "h1");
  let plan = plan_for(vec![api, web]);

  let env = container_env(
    &plan,
    plan.specs.iter().find(|s| s.name == "web").unwrap(),
    &[
      ("h1".to_string(), host_info("h1", "10.0.0.1")),
      ("h2".to_string(), host_info("h2", "10.0.0.2")),
    ]
    .into_iter()
    .collect(),
  );
  assert!(env.contains(&"API_ENDPOINT=10.0.0.2:8080".to_string()));

  let state = deployer
    .deploy(plan, DeployOptions::default(), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(state.placements["api"].host_id, "h2");
  assert_eq!(state.placements["web"].host_id, "h1");
}

#[tokio::test]
async fn cross_host_stack_emits_expected_events() {
  use trellis_client::entities::stack::StackDefinition;

  // Three nginx services pinned manually to three hosts.
  let definition = StackDefinition {
    context: "https://schema.org".to_string(),
    graph: vec![
      serde_json::json!({
        "@type": "ItemList",
        "@id": "stack-nginx-multihost",
        "name": "nginx-multihost",
        "deployment": { "placementStrategy": "manual" },
      }),
      serde_json::json!({
        "@type": "SoftwareApplication",
        "@id": "container-nginx-1",
        "name": "nginx-1",
        "executableName": "nginx:1.27",
        "locatedInHost": "h1",
      }),
      serde_json::json!({
        "@type": "SoftwareApplication",
        "@id": "container-nginx-2",
        "name": "nginx-2",
        "executableName": "nginx:1.27",
        "locatedInHost": "h2",
      }),
      serde_json::json!({
        "@type": "SoftwareApplication",
        "@id": "container-nginx-3",
        "name": "nginx-3",
        "executableName": "nginx:1.27",
        "locatedInHost": "h3",
      }),
    ],
  };

  let repo: &'static Repo =
    Box::leak(Box::new(Repo::new(Arc::new(MemStore::new()))));
  let hub: &'static crate::ws::Hub =
    Box::leak(Box::new(crate::ws::Hub::new()));
  let (_id, mut events) = hub.subscribe();
  let broadcaster =
    tokio::spawn(crate::ws::run_broadcaster(repo, hub));

  // The stack document exists before the deploy, so the deployer's
  // union shows up as an update.
  let mut stack = Stack {
    doc: Document::new(Stack::KIND, "stack-nginx-multihost"),
    name: "nginx-multihost".to_string(),
    ..Default::default()
  };
  repo.save_stack(&mut stack).await.unwrap();

  let resolver = StaticHostResolver {
    hosts: vec![
      host_info("h1", "10.0.0.1"),
      host_info("h2", "10.0.0.2"),
      host_info("h3", "10.0.0.3"),
    ],
  };
  let plan = crate::stack::parse_stack_definition(
    &definition,
    &resolver,
  )
  .await
  .unwrap();
  assert!(plan.hosts_resolved);

  let log: OpLog = Arc::new(Mutex::new(Vec::new()));
  let deployer = Deployer::new(
    Arc::new(Repo::new(repo.store_arc())),
    Arc::new(FakeFactory {
      log: log.clone(),
      fail_create: Arc::new(HashSet::new()),
    }),
    Arc::new(resolver),
  );
  let state = deployer
    .deploy(plan, DeployOptions::default(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(state.status, DeploymentStatus::Running);
  assert_eq!(state.placements.len(), 3);
  let hosts = state
    .placements
    .values()
    .map(|p| p.host_id.as_str())
    .collect::<HashSet<_>>();
  assert_eq!(hosts, HashSet::from(["h1", "h2", "h3"]));

  let stack = repo
    .get_stack_by_name("nginx-multihost")
    .await
    .unwrap()
    .unwrap();
  let ids = stack.containers.iter().collect::<HashSet<_>>();
  assert_eq!(ids.len(), 3);

  // Drain the hub subscriber: exactly three container.created and
  // one stack.updated must come through.
  let mut container_created = 0;
  let mut stack_updated = 0;
  while let Ok(Some(event)) = tokio::time::timeout(
    Duration::from_secs(5),
    events.recv(),
  )
  .await
  {
    match event.kind.as_str() {
      "container.created" => container_created += 1,
      "stack.updated" => stack_updated += 1,
      _ => {}
    }
    if container_created == 3 && stack_updated == 1 {
      break;
    }
  }
  assert_eq!((container_created, stack_updated), (3, 1));
  broadcaster.abort();
}

#[tokio::test]
async fn cancellation_stops_before_the_next_wave() {
  let (_repo, deployer, log) = harness(&[]);
  let plan = plan_for(vec![
    spec("web", &["db"], "h1"),
    spec("db", &[], "h1"),
  ]);
  let cancel = CancellationToken::new();
  cancel.cancel();

  let state = deployer
    .deploy(
      plan,
      DeployOptions {
        rollback_on_error: false,
        ..Default::default()
      },
      cancel,
    )
    .await
    .unwrap();

  assert_eq!(state.status, DeploymentStatus::Failed);
  assert!(
    state
      .error_message
      .as_deref()
      .unwrap()
      .contains("cancelled")
  );
  assert!(
    !log.lock().unwrap().iter().any(|(_, op, _)| op == "create")
  );
}
