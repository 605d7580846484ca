use std::sync::{Arc, OnceLock};

use store::{DocStore, HttpStore, MemStore};

use crate::{
  agents::AgentManager,
  config::core_config,
  docker::{BollardFactory, DockerClientFactory},
  repo::Repo,
  ws::Hub,
};

static REPO: OnceLock<Arc<Repo>> = OnceLock::new();
static DOCKER: OnceLock<Arc<dyn DockerClientFactory>> =
  OnceLock::new();

/// Connect the document store and wire the repository + docker
/// factory. Crashes on store init failure, by design: the controller
/// is useless without its store.
pub async fn init_store() {
  let config = &core_config().store;
  let store: Arc<dyn DocStore> = if config.memory {
    info!("using embedded in-memory store (dev mode)");
    Arc::new(MemStore::new())
  } else {
    Arc::new(
      HttpStore::init(config)
        .await
        .expect("failed to initialize document store"),
    )
  };
  let repo = Arc::new(Repo::new(store));
  DOCKER
    .set(Arc::new(BollardFactory::new(repo.clone())))
    .ok();
  REPO.set(repo).ok();
}

pub fn repo() -> &'static Repo {
  REPO.get().expect("repo accessed before init_store")
}

pub fn repo_arc() -> Arc<Repo> {
  REPO
    .get()
    .expect("repo accessed before init_store")
    .clone()
}

pub fn docker_factory() -> Arc<dyn DockerClientFactory> {
  DOCKER
    .get()
    .expect("docker factory accessed before init_store")
    .clone()
}

pub fn hub() -> &'static Hub {
  static HUB: OnceLock<Hub> = OnceLock::new();
  HUB.get_or_init(Hub::new)
}

pub fn agents() -> &'static AgentManager {
  static AGENTS: OnceLock<AgentManager> = OnceLock::new();
  AGENTS.get_or_init(AgentManager::new)
}
