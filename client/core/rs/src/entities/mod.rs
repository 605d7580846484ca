use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Subtypes of [ScheduledAction][action::ScheduledAction].
pub mod action;
/// Subtypes of [AgentConfig][agent::AgentConfig].
pub mod agent;
/// [CoreConfig][config::CoreConfig] and its environment overrides.
pub mod config;
/// Subtypes of [Container][container::Container].
pub mod container;
/// Subtypes of [DeploymentState][deployment::DeploymentState].
pub mod deployment;
/// The change event schema pushed to hub subscribers.
pub mod event;
/// Subtypes of [Host][host::Host].
pub mod host;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Subtypes of [Stack][stack::Stack].
pub mod stack;
/// Subtypes of [AgentTask][task::AgentTask].
pub mod task;
/// Subtypes of [User][user::User].
pub mod user;

/// The JSON-LD context stamped onto documents which arrive without one.
pub const SCHEMA_ORG_CONTEXT: &str = "https://schema.org";

/// Current unix timestamp in milliseconds.
pub fn trellis_timestamp() -> i64 {
  async_timing_util::unix_timestamp_ms() as i64
}

/// Generate a document id: `<prefix>-<uuid>`.
pub fn new_document_id(prefix: &str) -> String {
  format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// The shared JSON-LD header embedded in every persisted entity.
///
/// `@id` is the primary key, stable across revisions. `_rev` is the
/// MVCC revision token: saves carry the expected prior revision and
/// fail on mismatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
  /// The JSON-LD context, eg `https://schema.org`.
  #[serde(
    rename = "@context",
    default,
    skip_serializing_if = "String::is_empty"
  )]
  pub context: String,

  /// The type discriminator, eg `SoftwareApplication`.
  #[serde(
    rename = "@type",
    default,
    skip_serializing_if = "String::is_empty"
  )]
  pub kind: String,

  /// The primary key.
  #[serde(
    rename = "@id",
    default,
    skip_serializing_if = "String::is_empty"
  )]
  pub id: String,

  /// The MVCC revision token. Empty for documents never saved.
  #[serde(
    rename = "_rev",
    default,
    skip_serializing_if = "String::is_empty"
  )]
  pub rev: String,
}

impl Document {
  pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Document {
    Document {
      context: SCHEMA_ORG_CONTEXT.to_string(),
      kind: kind.into(),
      id: id.into(),
      rev: String::new(),
    }
  }
}

/// Implemented by every persisted entity. The repository uses it for
/// default stamping (`@context`, `@type`, timestamps) and revision
/// handling, without knowing the concrete type.
pub trait Entity:
  Serialize + DeserializeOwned + Send + Sync + 'static
{
  /// The canonical `@type` stamped onto new documents.
  const KIND: &'static str;

  fn doc(&self) -> &Document;

  fn doc_mut(&mut self) -> &mut Document;

  /// Every `@type` belonging to this entity.
  /// [Host][host::Host] stores under more than one.
  fn kinds() -> &'static [&'static str] {
    &[Self::KIND]
  }

  /// Whether a stored `@type` belongs to this entity.
  fn kind_matches(kind: &str) -> bool {
    Self::kinds().contains(&kind)
  }

  /// Stamp create / update timestamps where the entity carries them.
  fn touch(&mut self, _now: i64) {}
}
