//! The Docker capability consumed by the deployer and the agent
//! manager. The trait pins the methods; whether a client talks to a
//! local socket or a remote daemon is the factory's concern.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
  ContainerCreateBody, ExecConfig, HostConfig, NetworkCreateRequest,
  PortBinding,
};
use bollard::query_parameters::{
  CreateContainerOptions, CreateImageOptions, LogsOptions,
  RemoveContainerOptions,
};
use dashmap::DashMap;
use futures_util::StreamExt;
use indexmap::IndexMap;
use trellis_client::entities::container::PortMapping;

use crate::repo::Repo;

/// Everything the deployer needs to run on one host.
#[derive(Debug, Clone, Default)]
pub struct ContainerRun {
  pub image: String,
  /// `KEY=value` pairs.
  pub env: Vec<String>,
  pub ports: Vec<PortMapping>,
  pub labels: IndexMap<String, String>,
  pub network: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
  pub id: Option<String>,
  pub state: String,
  pub running: bool,
}

#[async_trait]
pub trait DockerClient: Send + Sync {
  async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

  async fn create_network(
    &self,
    name: &str,
    driver: &str,
  ) -> anyhow::Result<()>;

  /// Returns the created container id.
  async fn create_container(
    &self,
    name: &str,
    run: &ContainerRun,
  ) -> anyhow::Result<String>;

  async fn start_container(&self, name: &str) -> anyhow::Result<()>;

  async fn stop_container(&self, name: &str) -> anyhow::Result<()>;

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
  ) -> anyhow::Result<()>;

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerSummary>;

  async fn container_logs(
    &self,
    name: &str,
    tail: usize,
  ) -> anyhow::Result<String>;

  /// Run a command in the container, returning whether it exited 0.
  async fn exec(
    &self,
    container: &str,
    command: &[String],
  ) -> anyhow::Result<bool>;
}

/// Hands out a [DockerClient] per host.
#[async_trait]
pub trait DockerClientFactory: Send + Sync {
  async fn client_for(
    &self,
    host_id: &str,
  ) -> anyhow::Result<Arc<dyn DockerClient>>;
}

/// Factory backed by [AgentConfig][trellis_client::entities::agent::AgentConfig]
/// documents: each host's `docker_socket` decides the transport.
/// Clients are cached per socket.
pub struct BollardFactory {
  repo: Arc<Repo>,
  clients: DashMap<String, Arc<BollardClient>>,
}

impl BollardFactory {
  pub fn new(repo: Arc<Repo>) -> BollardFactory {
    BollardFactory {
      repo,
      clients: DashMap::new(),
    }
  }
}

#[async_trait]
impl DockerClientFactory for BollardFactory {
  async fn client_for(
    &self,
    host_id: &str,
  ) -> anyhow::Result<Arc<dyn DockerClient>> {
    let socket = self
      .repo
      .agent_config_for_host(host_id)
      .await?
      .map(|config| config.docker_socket)
      .unwrap_or_default();
    if let Some(client) = self.clients.get(&socket) {
      return Ok(client.clone());
    }
    let client = Arc::new(BollardClient::connect(&socket)?);
    self.clients.insert(socket, client.clone());
    Ok(client)
  }
}

pub struct BollardClient {
  docker: Docker,
}

impl BollardClient {
  /// Empty socket means the local daemon. `tcp://` / `http://`
  /// sockets connect over the network, anything else is treated as a
  /// unix socket path.
  pub fn connect(socket: &str) -> anyhow::Result<BollardClient> {
    let docker = if socket.is_empty() {
      Docker::connect_with_defaults()
        .context("failed to connect to local docker daemon")?
    } else if socket.starts_with("tcp://")
      || socket.starts_with("http://")
    {
      Docker::connect_with_http(
        socket,
        120,
        bollard::API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to docker daemon at {socket}")
      })?
    } else {
      let path = socket.trim_start_matches("unix://");
      Docker::connect_with_socket(
        path,
        120,
        bollard::API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to docker socket {path}")
      })?
    };
    Ok(BollardClient { docker })
  }
}

fn split_image_tag(image: &str) -> (String, String) {
  match image.rsplit_once(':') {
    // A ':' inside the registry host (eg localhost:5000/img) is not
    // a tag separator.
    Some((name, tag)) if !tag.contains('/') => {
      (name.to_string(), tag.to_string())
    }
    _ => (image.to_string(), String::from("latest")),
  }
}

#[async_trait]
impl DockerClient for BollardClient {
  async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
    let (from_image, tag) = split_image_tag(image);
    let options = CreateImageOptions {
      from_image: Some(from_image),
      tag: Some(tag),
      ..Default::default()
    };
    let mut stream =
      self.docker.create_image(Some(options), None, None);
    while let Some(progress) = stream.next().await {
      let progress =
        progress.with_context(|| format!("pull {image}"))?;
      trace!("pull {image}: {:?}", progress.status);
    }
    Ok(())
  }

  async fn create_network(
    &self,
    name: &str,
    driver: &str,
  ) -> anyhow::Result<()> {
    let res = self
      .docker
      .create_network(NetworkCreateRequest {
        name: name.to_string(),
        driver: Some(driver.to_string()),
        ..Default::default()
      })
      .await;
    match res {
      Ok(_) => Ok(()),
      // Recreating an existing network is fine.
      Err(bollard::errors::Error::DockerResponseServerError {
        status_code: 409,
        ..
      }) => Ok(()),
      Err(e) => {
        Err(e).with_context(|| format!("create network {name}"))
      }
    }
  }

  async fn create_container(
    &self,
    name: &str,
    run: &ContainerRun,
  ) -> anyhow::Result<String> {
    let mut port_bindings =
      HashMap::<String, Option<Vec<PortBinding>>>::new();
    for port in &run.ports {
      port_bindings.insert(
        format!("{}/{}", port.container_port, port.protocol),
        Some(vec![PortBinding {
          host_ip: None,
          host_port: Some(port.host_port.to_string()),
        }]),
      );
    }
    let body = ContainerCreateBody {
      image: Some(run.image.clone()),
      env: (!run.env.is_empty()).then(|| run.env.clone()),
      labels: (!run.labels.is_empty()).then(|| {
        run
          .labels
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect()
      }),
      host_config: Some(HostConfig {
        port_bindings: (!port_bindings.is_empty())
          .then_some(port_bindings),
        network_mode: run.network.clone(),
        ..Default::default()
      }),
      ..Default::default()
    };
    let response = self
      .docker
      .create_container(
        Some(CreateContainerOptions {
          name: Some(name.to_string()),
          ..Default::default()
        }),
        body,
      )
      .await
      .with_context(|| format!("create container {name}"))?;
    for warning in response.warnings {
      warn!("create container {name}: {warning}");
    }
    Ok(response.id)
  }

  async fn start_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .start_container(name, None)
      .await
      .with_context(|| format!("start container {name}"))
  }

  async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .stop_container(name, None)
      .await
      .with_context(|| format!("stop container {name}"))
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(
        name,
        Some(RemoveContainerOptions {
          force,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("remove container {name}"))
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<ContainerSummary> {
    let container = self
      .docker
      .inspect_container(name, None)
      .await
      .with_context(|| format!("inspect container {name}"))?;
    let state = container.state.unwrap_or_default();
    Ok(ContainerSummary {
      id: container.id,
      state: state
        .status
        .map(|s| s.to_string())
        .unwrap_or_default(),
      running: state.running.unwrap_or(false),
    })
  }

  async fn container_logs(
    &self,
    name: &str,
    tail: usize,
  ) -> anyhow::Result<String> {
    let options = LogsOptions {
      stdout: true,
      stderr: true,
      tail: tail.to_string(),
      ..Default::default()
    };
    let mut stream = self.docker.logs(name, Some(options));
    let mut out = String::new();
    while let Some(line) = stream.next().await {
      let line =
        line.with_context(|| format!("logs for {name}"))?;
      out.push_str(&String::from_utf8_lossy(&line.into_bytes()));
    }
    Ok(out)
  }

  async fn exec(
    &self,
    container: &str,
    command: &[String],
  ) -> anyhow::Result<bool> {
    let exec = self
      .docker
      .create_exec(
        container,
        ExecConfig {
          cmd: Some(command.to_vec()),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          ..Default::default()
        },
      )
      .await
      .with_context(|| format!("create exec in {container}"))?;
    let results = self
      .docker
      .start_exec(&exec.id, None)
      .await
      .with_context(|| format!("start exec in {container}"))?;
    if let bollard::exec::StartExecResults::Attached {
      mut output,
      ..
    } = results
    {
      while let Some(chunk) = output.next().await {
        if chunk.is_err() {
          break;
        }
      }
    }
    let inspect = self
      .docker
      .inspect_exec(&exec.id)
      .await
      .with_context(|| format!("inspect exec in {container}"))?;
    Ok(inspect.exit_code == Some(0))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_tag_splitting() {
    assert_eq!(
      split_image_tag("nginx:1.27"),
      ("nginx".to_string(), "1.27".to_string())
    );
    assert_eq!(
      split_image_tag("nginx"),
      ("nginx".to_string(), "latest".to_string())
    );
    assert_eq!(
      split_image_tag("localhost:5000/app"),
      ("localhost:5000/app".to_string(), "latest".to_string())
    );
    assert_eq!(
      split_image_tag("localhost:5000/app:v2"),
      ("localhost:5000/app".to_string(), "v2".to_string())
    );
  }
}
