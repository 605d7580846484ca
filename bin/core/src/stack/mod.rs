use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_client::entities::{
  Entity,
  container::PortMapping,
  host::HostInfo,
  stack::{Stack, StackDefinition},
};

use crate::repo::Repo;

/// Graph node `@type`s recognized by the parser.
const CONTAINER_KINDS: &[&str] = &["SoftwareApplication", "Container"];
const NETWORK_KINDS: &[&str] =
  &["Network", "ComputerNetwork", "DockerNetwork"];
const VOLUME_KINDS: &[&str] = &["Volume", "DataVolume"];

/// One container of a stack definition, extracted from the `@graph`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
  #[serde(rename = "@id", default)]
  pub id: String,

  /// The service name. Dependencies reference this, not `@id`.
  #[serde(default)]
  pub name: String,

  /// The image to run.
  #[serde(default)]
  pub executable_name: String,

  /// Host `@id` this service is pinned to. Empty specs are placed by
  /// the placement resolver.
  #[serde(default)]
  pub located_in_host: String,

  #[serde(default)]
  pub ports: Vec<PortMapping>,

  #[serde(default)]
  pub environment: IndexMap<String, String>,

  /// Service names which must be healthy before this one starts.
  #[serde(default)]
  pub depends_on: Vec<String>,

  #[serde(default)]
  pub health_check: Option<HealthCheck>,

  #[serde(default)]
  pub volumes: Vec<String>,
}

/// How the deployer decides a started container is healthy. Specs
/// without a declaration are treated healthy once started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
  Http {
    #[serde(default = "default_health_path")]
    path: String,
    port: u16,
  },
  Exec {
    command: Vec<String>,
  },
}

fn default_health_path() -> String {
  String::from("/")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub driver: String,
}

/// The parser / planner output the deployer consumes.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
  pub stack: Stack,
  pub specs: Vec<ContainerSpec>,
  pub network: Option<NetworkSpec>,
  pub volumes: Vec<Value>,
  /// Dependency waves: indexes into `specs`. Wave k only depends on
  /// waves `< k`; within a wave there is no ordering.
  pub waves: Vec<Vec<usize>>,
  /// Whether every spec carries a host assignment yet.
  pub hosts_resolved: bool,
  /// Non-fatal parse hints.
  pub warnings: Vec<String>,
}

impl DeploymentPlan {
  pub fn network_name(&self) -> String {
    match &self.network {
      Some(network) if !network.name.is_empty() => {
        network.name.clone()
      }
      _ => format!("{}-network", self.stack.name),
    }
  }

  pub fn network_driver(&self) -> &str {
    match &self.network {
      Some(network) if !network.driver.is_empty() => {
        &network.driver
      }
      _ => "bridge",
    }
  }

  /// Host `@id`s participating in the plan.
  pub fn target_hosts(&self) -> Vec<&str> {
    let mut hosts = self
      .specs
      .iter()
      .map(|s| s.located_in_host.as_str())
      .filter(|h| !h.is_empty())
      .collect::<Vec<_>>();
    hosts.sort_unstable();
    hosts.dedup();
    hosts
  }
}

/// The host resolver capability consumed by the planner and the
/// placement resolver.
#[async_trait]
pub trait HostResolver: Send + Sync {
  async fn resolve_host(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<HostInfo>>;

  async fn list_hosts(&self) -> anyhow::Result<Vec<HostInfo>>;
}

/// Resolver backed by the repository's host documents.
pub struct RepoHostResolver {
  pub repo: Arc<Repo>,
}

#[async_trait]
impl HostResolver for RepoHostResolver {
  async fn resolve_host(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<HostInfo>> {
    let infos = self.repo.host_infos().await?;
    Ok(infos.into_iter().find(|info| info.host.doc.id == id))
  }

  async fn list_hosts(&self) -> anyhow::Result<Vec<HostInfo>> {
    self.repo.host_infos().await
  }
}

/// Fixed host set resolver, for tests and plan dry runs.
pub struct StaticHostResolver {
  pub hosts: Vec<HostInfo>,
}

#[async_trait]
impl HostResolver for StaticHostResolver {
  async fn resolve_host(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<HostInfo>> {
    Ok(
      self
        .hosts
        .iter()
        .find(|info| info.host.doc.id == id)
        .cloned(),
    )
  }

  async fn list_hosts(&self) -> anyhow::Result<Vec<HostInfo>> {
    Ok(self.hosts.clone())
  }
}

/// Expand a `@graph` stack definition into a typed deployment plan:
/// partition the graph, resolve pinned hosts, compute dependency
/// waves. Fatal problems are collected and surfaced together.
pub async fn parse_stack_definition(
  def: &StackDefinition,
  resolver: &dyn HostResolver,
) -> anyhow::Result<DeploymentPlan> {
  let mut errors = Vec::new();
  let mut warnings = Vec::new();

  let mut stack_nodes = Vec::new();
  let mut specs: Vec<ContainerSpec> = Vec::new();
  let mut networks = Vec::new();
  let mut volumes = Vec::new();

  for node in &def.graph {
    let kind = node
      .get("@type")
      .and_then(Value::as_str)
      .unwrap_or_default();
    if kind == Stack::KIND {
      stack_nodes.push(node);
    } else if CONTAINER_KINDS.contains(&kind) {
      match serde_json::from_value::<ContainerSpec>(node.clone()) {
        Ok(spec) => {
          if spec.name.is_empty() {
            errors.push(format!(
              "container node {} is missing a service name",
              spec.id
            ));
          } else if spec.executable_name.is_empty() {
            errors.push(format!(
              "service {} is missing an image",
              spec.name
            ));
          } else if specs.iter().any(|s| s.name == spec.name) {
            errors
              .push(format!("duplicate service name {}", spec.name));
          } else {
            specs.push(spec);
          }
        }
        Err(e) => {
          errors.push(format!("invalid container node: {e}"))
        }
      }
    } else if NETWORK_KINDS.contains(&kind) {
      networks.push(node);
    } else if VOLUME_KINDS.contains(&kind) {
      volumes.push(node.clone());
    } else if kind.is_empty() {
      errors.push("graph node is missing '@type'".to_string());
    } else {
      warnings.push(format!("ignoring graph node of type {kind}"));
    }
  }

  let stack = match stack_nodes.as_slice() {
    [node] => {
      match serde_json::from_value::<Stack>((*node).clone()) {
        Ok(stack) if stack.name.is_empty() => {
          errors.push("stack node is missing a name".to_string());
          Stack::default()
        }
        Ok(stack) => stack,
        Err(e) => {
          errors.push(format!("invalid stack node: {e}"));
          Stack::default()
        }
      }
    }
    [] => {
      errors
        .push("definition has no ItemList stack node".to_string());
      Stack::default()
    }
    _ => {
      errors.push(format!(
        "definition has {} stack nodes, expected one",
        stack_nodes.len()
      ));
      Stack::default()
    }
  };

  let network = match networks.as_slice() {
    [] => None,
    [node] => {
      match serde_json::from_value::<NetworkSpec>((*node).clone()) {
        Ok(network) => Some(network),
        Err(e) => {
          errors.push(format!("invalid network node: {e}"));
          None
        }
      }
    }
    _ => {
      errors.push(format!(
        "definition has {} network nodes, at most one allowed",
        networks.len()
      ));
      None
    }
  };

  let mut hosts_resolved = true;
  for spec in &specs {
    if spec.located_in_host.is_empty() {
      hosts_resolved = false;
      continue;
    }
    match resolver.resolve_host(&spec.located_in_host).await? {
      Some(_) => {}
      None => errors.push(format!(
        "service {} references unknown host {}",
        spec.name, spec.located_in_host
      )),
    }
  }

  let waves = match compute_waves(&specs) {
    Ok(waves) => waves,
    Err(e) => {
      errors.push(format!("{e:#}"));
      Vec::new()
    }
  };

  if !errors.is_empty() {
    return Err(anyhow!(
      "invalid stack definition: {}",
      errors.join("; ")
    ));
  }

  Ok(DeploymentPlan {
    stack,
    specs,
    network,
    volumes,
    waves,
    hosts_resolved,
    warnings,
  })
}

/// Kahn's algorithm over the `depends_on` edges. Wave k holds every
/// service whose dependencies all live in waves `< k`. Waves are
/// name-sorted for reproducible plans.
pub fn compute_waves(
  specs: &[ContainerSpec],
) -> anyhow::Result<Vec<Vec<usize>>> {
  let index_by_name = specs
    .iter()
    .enumerate()
    .map(|(i, s)| (s.name.as_str(), i))
    .collect::<HashMap<_, _>>();

  let mut indegree = vec![0usize; specs.len()];
  // dependency -> dependents
  let mut dependents = vec![Vec::<usize>::new(); specs.len()];
  for (i, spec) in specs.iter().enumerate() {
    for dep in &spec.depends_on {
      let &dep_index =
        index_by_name.get(dep.as_str()).with_context(|| {
          format!(
            "service {} depends on unknown service {dep}",
            spec.name
          )
        })?;
      if dep_index == i {
        return Err(anyhow!(
          "service {} depends on itself",
          spec.name
        ));
      }
      indegree[i] += 1;
      dependents[dep_index].push(i);
    }
  }

  let mut waves = Vec::new();
  let mut placed = 0;
  let mut current = (0..specs.len())
    .filter(|&i| indegree[i] == 0)
    .collect::<Vec<_>>();
  while !current.is_empty() {
    current.sort_by(|&a, &b| specs[a].name.cmp(&specs[b].name));
    let mut next = Vec::new();
    for &i in &current {
      for &dependent in &dependents[i] {
        indegree[dependent] -= 1;
        if indegree[dependent] == 0 {
          next.push(dependent);
        }
      }
    }
    placed += current.len();
    waves.push(std::mem::replace(&mut current, next));
  }

  if placed != specs.len() {
    let cycle = specs
      .iter()
      .enumerate()
      .filter(|(i, _)| indegree[*i] > 0)
      .map(|(_, s)| s.name.as_str())
      .collect::<Vec<_>>()
      .join(", ");
    return Err(anyhow!(
      "dependency cycle between services: {cycle}"
    ));
  }
  Ok(waves)
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use trellis_client::entities::{Document, host::Host};

  use super::*;

  fn spec(name: &str, deps: &[&str]) -> ContainerSpec {
    ContainerSpec {
      id: format!("container-{name}"),
      name: name.to_string(),
      executable_name: format!("{name}:latest"),
      depends_on: deps.iter().map(ToString::to_string).collect(),
      ..Default::default()
    }
  }

  fn host_info(id: &str) -> HostInfo {
    HostInfo {
      host: Host {
        doc: Document::new(Host::KIND, id),
        name: id.to_string(),
        ip_address: "10.0.0.1".to_string(),
        ..Default::default()
      },
      ..Default::default()
    }
  }

  fn wave_names(
    specs: &[ContainerSpec],
    waves: &[Vec<usize>],
  ) -> Vec<Vec<String>> {
    waves
      .iter()
      .map(|wave| {
        wave.iter().map(|&i| specs[i].name.clone()).collect()
      })
      .collect()
  }

  #[test]
  fn waves_follow_the_dependency_graph() {
    // web -> api -> db, cache -> api.
    let specs = vec![
      spec("web", &["api"]),
      spec("api", &["db", "cache"]),
      spec("db", &[]),
      spec("cache", &[]),
    ];
    let waves = compute_waves(&specs).unwrap();
    assert_eq!(
      wave_names(&specs, &waves),
      vec![vec!["cache", "db"], vec!["api"], vec!["web"]]
    );
  }

  #[test]
  fn cycles_are_detected() {
    let specs = vec![
      spec("a", &["b"]),
      spec("b", &["c"]),
      spec("c", &["a"]),
    ];
    let err = compute_waves(&specs).unwrap_err();
    assert!(err.to_string().contains("cycle"));
  }

  #[test]
  fn unknown_dependency_is_an_error() {
    let specs = vec![spec("web", &["ghost"])];
    let err = compute_waves(&specs).unwrap_err();
    assert!(err.to_string().contains("unknown service ghost"));
  }

  fn definition(graph: Vec<serde_json::Value>) -> StackDefinition {
    StackDefinition {
      context: "https://schema.org".to_string(),
      graph,
    }
  }

  #[tokio::test]
  async fn parses_a_full_definition() {
    let resolver = StaticHostResolver {
      hosts: vec![host_info("host-a")],
    };
    let def = definition(vec![
      json!({
        "@type": "ItemList",
        "@id": "stack-blog",
        "name": "blog",
        "datacenter": "eu-1",
        "deployment": { "placementStrategy": "manual" },
      }),
      json!({
        "@type": "SoftwareApplication",
        "@id": "container-blog-db",
        "name": "db",
        "executableName": "postgres:17",
        "locatedInHost": "host-a",
      }),
      json!({
        "@type": "SoftwareApplication",
        "@id": "container-blog-web",
        "name": "web",
        "executableName": "ghost:5",
        "locatedInHost": "host-a",
        "dependsOn": ["db"],
        "healthCheck": { "type": "http", "path": "/", "port": 2368 },
      }),
      json!({
        "@type": "Network",
        "name": "blog-net",
        "driver": "bridge",
      }),
    ]);
    let plan =
      parse_stack_definition(&def, &resolver).await.unwrap();
    assert_eq!(plan.stack.name, "blog");
    assert_eq!(plan.specs.len(), 2);
    assert!(plan.hosts_resolved);
    assert_eq!(plan.network_name(), "blog-net");
    assert_eq!(
      wave_names(&plan.specs, &plan.waves),
      vec![vec!["db"], vec!["web"]]
    );
  }

  #[test]
  fn container_specs_survive_a_serialize_round_trip() {
    let mut original = spec("web", &["api"]);
    original.located_in_host = "host-a".to_string();
    original.health_check = Some(HealthCheck::Http {
      path: "/healthz".to_string(),
      port: 8080,
    });
    let value = serde_json::to_value(&original).unwrap();
    let parsed: ContainerSpec =
      serde_json::from_value(value).unwrap();
    assert_eq!(parsed, original);
  }

  #[tokio::test]
  async fn unknown_host_fails_the_parse() {
    let resolver = StaticHostResolver { hosts: Vec::new() };
    let def = definition(vec![
      json!({ "@type": "ItemList", "@id": "s", "name": "s" }),
      json!({
        "@type": "SoftwareApplication",
        "@id": "c",
        "name": "web",
        "executableName": "nginx:1.27",
        "locatedInHost": "host-missing",
      }),
    ]);
    let err = parse_stack_definition(&def, &resolver)
      .await
      .unwrap_err();
    assert!(err.to_string().contains("unknown host host-missing"));
  }
}
