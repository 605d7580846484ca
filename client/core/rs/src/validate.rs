//! Structural JSON-LD validation.
//!
//! Operates on raw bytes so the boundary can reject a document before
//! it is deserialized into an entity. Checks the `@context` / `@type`
//! / `@id` envelope plus per-entity field constraints; it does not
//! perform semantic expansion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONTAINER_TYPES: &[&str] =
  &["SoftwareApplication", "Container"];
pub const CONTAINER_STATUSES: &[&str] = &[
  "running",
  "stopped",
  "paused",
  "restarting",
  "exited",
  "dead",
  "created",
  "removing",
];
pub const PORT_PROTOCOLS: &[&str] = &["tcp", "udp", "sctp"];
pub const HOST_TYPES: &[&str] = &["ComputerSystem", "Server", "Host"];
pub const HOST_STATUSES: &[&str] =
  &["active", "inactive", "maintenance", "unreachable"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
  pub valid: bool,
  #[serde(default)]
  pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
  pub field: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<Value>,
}

impl ValidationReport {
  pub fn ok() -> ValidationReport {
    ValidationReport {
      valid: true,
      errors: Vec::new(),
    }
  }

  fn push(
    &mut self,
    field: impl Into<String>,
    message: impl Into<String>,
    value: Option<Value>,
  ) {
    self.valid = false;
    self.errors.push(FieldError {
      field: field.into(),
      message: message.into(),
      value,
    });
  }
}

/// Validate a raw container document.
pub fn validate_container(bytes: &[u8]) -> ValidationReport {
  let mut report = ValidationReport::ok();
  let Some(value) = parse(bytes, &mut report) else {
    return report;
  };
  validate_envelope(&value, &mut report);
  check_type(&value, CONTAINER_TYPES, &mut report);

  require_string(&value, "name", &mut report);
  require_string(&value, "executableName", &mut report);
  require_string(&value, "hostedOn", &mut report);
  check_enum(&value, "status", CONTAINER_STATUSES, &mut report);

  if let Some(ports) = value.get("ports") {
    match ports.as_array() {
      Some(ports) => {
        for (i, port) in ports.iter().enumerate() {
          validate_port(port, i, &mut report);
        }
      }
      None => report.push(
        "ports",
        "must be an array of port mappings",
        Some(ports.clone()),
      ),
    }
  }

  report
}

/// Validate a raw host document.
pub fn validate_host(bytes: &[u8]) -> ValidationReport {
  let mut report = ValidationReport::ok();
  let Some(value) = parse(bytes, &mut report) else {
    return report;
  };
  validate_envelope(&value, &mut report);
  check_type(&value, HOST_TYPES, &mut report);

  require_string(&value, "name", &mut report);
  check_enum(&value, "status", HOST_STATUSES, &mut report);

  match value.get("ipAddress").and_then(Value::as_str) {
    Some(ip) if is_valid_ip(ip) => {}
    Some(ip) => report.push(
      "ipAddress",
      "not a valid IPv4 or IPv6 address",
      Some(Value::String(ip.to_string())),
    ),
    None => {
      report.push("ipAddress", "required field is missing", None)
    }
  }

  check_non_negative(&value, "cpu", &mut report);
  check_non_negative(&value, "memory", &mut report);

  report
}

fn parse(
  bytes: &[u8],
  report: &mut ValidationReport,
) -> Option<Value> {
  match serde_json::from_slice::<Value>(bytes) {
    Ok(Value::Object(map)) => Some(Value::Object(map)),
    Ok(other) => {
      report.push("$", "document must be a JSON object", Some(other));
      None
    }
    Err(e) => {
      report.push("$", format!("invalid JSON: {e}"), None);
      None
    }
  }
}

/// Each missing envelope member produces its own error.
fn validate_envelope(value: &Value, report: &mut ValidationReport) {
  for field in ["@context", "@type", "@id"] {
    match value.get(field).and_then(Value::as_str) {
      Some(s) if !s.is_empty() => {}
      _ => report.push(field, "required field is missing", None),
    }
  }
}

fn check_type(
  value: &Value,
  allowed: &[&str],
  report: &mut ValidationReport,
) {
  // A missing @type was already reported by the envelope check.
  if let Some(kind) = value.get("@type").and_then(Value::as_str)
    && !kind.is_empty()
    && !allowed.contains(&kind)
  {
    report.push(
      "@type",
      format!("must be one of {allowed:?}"),
      Some(Value::String(kind.to_string())),
    );
  }
}

fn require_string(
  value: &Value,
  field: &str,
  report: &mut ValidationReport,
) {
  match value.get(field) {
    Some(Value::String(_)) => {}
    Some(other) => report.push(
      field,
      "must be a string",
      Some(other.clone()),
    ),
    None => report.push(field, "required field is missing", None),
  }
}

fn check_enum(
  value: &Value,
  field: &str,
  allowed: &[&str],
  report: &mut ValidationReport,
) {
  if let Some(v) = value.get(field) {
    match v.as_str() {
      Some(s) if allowed.contains(&s) => {}
      _ => report.push(
        field,
        format!("must be one of {allowed:?}"),
        Some(v.clone()),
      ),
    }
  }
}

fn check_non_negative(
  value: &Value,
  field: &str,
  report: &mut ValidationReport,
) {
  if let Some(v) = value.get(field) {
    match v.as_f64() {
      Some(n) if n >= 0.0 => {}
      _ => report.push(
        field,
        "must be a number >= 0",
        Some(v.clone()),
      ),
    }
  }
}

fn validate_port(
  port: &Value,
  index: usize,
  report: &mut ValidationReport,
) {
  for field in ["hostPort", "containerPort"] {
    let path = format!("ports[{index}].{field}");
    match port.get(field).and_then(Value::as_i64) {
      Some(n) if (0..=65_535).contains(&n) => {}
      Some(n) => report.push(
        path,
        "must be in range [0, 65535]",
        Some(Value::from(n)),
      ),
      None => report.push(path, "must be an integer port", None),
    }
  }
  if let Some(protocol) = port.get("protocol") {
    match protocol.as_str() {
      Some(p) if PORT_PROTOCOLS.contains(&p) => {}
      _ => report.push(
        format!("ports[{index}].protocol"),
        format!("must be one of {PORT_PROTOCOLS:?}"),
        Some(protocol.clone()),
      ),
    }
  }
}

/// IPv4: exactly four `0 ..= 255` octets. Anything containing `:` is
/// accepted as IPv6.
fn is_valid_ip(ip: &str) -> bool {
  if ip.contains(':') {
    return true;
  }
  let octets = ip.split('.').collect::<Vec<_>>();
  octets.len() == 4
    && octets.iter().all(|o| {
      !o.is_empty()
        && o.len() <= 3
        && o.bytes().all(|b| b.is_ascii_digit())
        && o.parse::<u16>().is_ok_and(|n| n <= 255)
    })
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn container_fixture() -> Value {
    json!({
      "@context": "https://schema.org",
      "@type": "SoftwareApplication",
      "@id": "container-web-1",
      "name": "web-1",
      "executableName": "nginx:1.27",
      "hostedOn": "host-a",
      "status": "running",
      "ports": [
        { "hostPort": 8080, "containerPort": 80, "protocol": "tcp" }
      ]
    })
  }

  #[test]
  fn valid_container_passes() {
    let bytes = serde_json::to_vec(&container_fixture()).unwrap();
    let report = validate_container(&bytes);
    assert!(report.valid, "{:?}", report.errors);
  }

  #[test]
  fn missing_envelope_members_each_get_an_error() {
    let report = validate_container(br#"{ "name": "web" }"#);
    assert!(!report.valid);
    for field in ["@context", "@type", "@id"] {
      assert!(
        report.errors.iter().any(|e| e.field == field),
        "no error for {field}"
      );
    }
  }

  #[test]
  fn unparseable_body_is_a_single_root_error() {
    let report = validate_container(b"{ not json");
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].field, "$");
  }

  #[test]
  fn bad_status_and_port_range_are_flagged() {
    let mut doc = container_fixture();
    doc["status"] = json!("zombie");
    doc["ports"][0]["hostPort"] = json!(70_000);
    let bytes = serde_json::to_vec(&doc).unwrap();
    let report = validate_container(&bytes);
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.field == "status"));
    assert!(
      report
        .errors
        .iter()
        .any(|e| e.field == "ports[0].hostPort")
    );
  }

  #[test]
  fn host_ip_validation() {
    for (ip, ok) in [
      ("10.0.0.1", true),
      ("255.255.255.255", true),
      ("256.0.0.1", false),
      ("10.0.0", false),
      ("fe80::1", true),
      ("::1", true),
      ("not-an-ip", false),
    ] {
      let doc = json!({
        "@context": "https://schema.org",
        "@type": "ComputerSystem",
        "@id": "host-a",
        "name": "host-a",
        "ipAddress": ip,
        "status": "active",
        "cpu": 8,
        "memory": 32768
      });
      let report =
        validate_host(&serde_json::to_vec(&doc).unwrap());
      assert_eq!(report.valid, ok, "{ip}: {:?}", report.errors);
    }
  }

  #[test]
  fn negative_host_resources_rejected() {
    let doc = json!({
      "@context": "https://schema.org",
      "@type": "ComputerSystem",
      "@id": "host-a",
      "name": "host-a",
      "ipAddress": "10.0.0.1",
      "cpu": -1
    });
    let report = validate_host(&serde_json::to_vec(&doc).unwrap());
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.field == "cpu"));
  }

  #[test]
  fn round_trip_through_the_entity_stays_valid() {
    use crate::entities::container::Container;
    let bytes = serde_json::to_vec(&container_fixture()).unwrap();
    let parsed: Container = serde_json::from_slice(&bytes).unwrap();
    let reserialized = serde_json::to_vec(&parsed).unwrap();
    assert!(validate_container(&reserialized).valid);
  }
}
