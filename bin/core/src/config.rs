use std::sync::OnceLock;

use anyhow::Context;
use trellis_client::entities::{
  config::{CoreConfig, Env, StoreConfig},
  logger::LogConfig,
};

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = match envy::from_env()
      .context("Failed to parse Trellis Core environment")
    {
      Ok(env) => env,
      Err(e) => {
        panic!("{e:?}");
      }
    };
    let config = match &env.trellis_config_path {
      Some(path) => {
        let contents = std::fs::read_to_string(path)
          .unwrap_or_else(|e| {
            panic!("Failed to read config file at {path:?} | {e:?}")
          });
        toml::from_str::<CoreConfig>(&contents).unwrap_or_else(|e| {
          panic!("Failed to parse config file at {path:?} | {e:?}")
        })
      }
      None => CoreConfig::default(),
    };

    // Recreating CoreConfig here makes sure all env overrides are
    // applied.
    CoreConfig {
      bind_ip: env.trellis_bind_ip.unwrap_or(config.bind_ip),
      port: env.trellis_port.unwrap_or(config.port),
      timezone: env.trellis_timezone.unwrap_or(config.timezone),
      store: StoreConfig {
        uri: env.trellis_store_uri.unwrap_or(config.store.uri),
        db_name: env
          .trellis_store_db_name
          .unwrap_or(config.store.db_name),
        username: env
          .trellis_store_username
          .unwrap_or(config.store.username),
        password: env
          .trellis_store_password
          .unwrap_or(config.store.password),
        memory: env.trellis_store_memory.unwrap_or(config.store.memory),
      },
      keep_tasks_for_hours: env
        .trellis_keep_tasks_for_hours
        .unwrap_or(config.keep_tasks_for_hours),
      cleanup_batch_size: env
        .trellis_cleanup_batch_size
        .unwrap_or(config.cleanup_batch_size),
      agent_stale_after: env
        .trellis_agent_stale_after
        .unwrap_or(config.agent_stale_after),
      logging: LogConfig {
        level: env
          .trellis_logging_level
          .unwrap_or(config.logging.level),
        stdio: env
          .trellis_logging_stdio
          .unwrap_or(config.logging.stdio),
        pretty: env
          .trellis_logging_pretty
          .unwrap_or(config.logging.pretty),
        otlp_endpoint: env
          .trellis_logging_otlp_endpoint
          .unwrap_or(config.logging.otlp_endpoint),
        opentelemetry_service_name: env
          .trellis_logging_opentelemetry_service_name
          .unwrap_or(config.logging.opentelemetry_service_name),
      },
      pretty_startup_config: env
        .trellis_pretty_startup_config
        .unwrap_or(config.pretty_startup_config),
    }
  })
}
