//! Placement: map every unbound container spec of a plan onto
//! exactly one host.

use std::collections::HashMap;

use anyhow::anyhow;
use indexmap::IndexMap;
use trellis_client::entities::{
  host::HostInfo, stack::PlacementStrategy,
};

use crate::stack::DeploymentPlan;

/// Weights of the auto strategy score
/// `cpu * CPU_WEIGHT + memory * MEMORY_WEIGHT + containers * COUNT_WEIGHT`.
/// Resource pressure dominates raw container counts.
pub const CPU_WEIGHT: f64 = 0.4;
pub const MEMORY_WEIGHT: f64 = 0.4;
pub const COUNT_WEIGHT: f64 = 0.2;

/// Assign a host to every unbound spec in the plan, per the stack's
/// placement strategy. Host constraints filter the eligible set
/// first; an empty set fails with `NO_SUITABLE_HOST`.
pub fn resolve_placements(
  plan: &mut DeploymentPlan,
  hosts: &[HostInfo],
) -> anyhow::Result<()> {
  let unbound = plan
    .specs
    .iter()
    .enumerate()
    .filter(|(_, s)| s.located_in_host.is_empty())
    .map(|(i, _)| i)
    .collect::<Vec<_>>();
  if unbound.is_empty() {
    plan.hosts_resolved = true;
    return Ok(());
  }

  let strategy = plan.stack.deployment.placement_strategy;
  if strategy == PlacementStrategy::Manual {
    let names = unbound
      .iter()
      .map(|&i| plan.specs[i].name.as_str())
      .collect::<Vec<_>>()
      .join(", ");
    return Err(anyhow!(
      "manual placement requires a host on every service; missing for: {names}"
    ));
  }

  let mut eligible = hosts
    .iter()
    .filter(|info| info.host.status.schedulable())
    .filter(|info| {
      matches_constraints(
        info,
        &plan.stack.deployment.host_constraints,
      )
    })
    .filter(|info| {
      strategy != PlacementStrategy::Datacenter
        || info.host.location == plan.stack.datacenter
    })
    .collect::<Vec<_>>();
  // Deterministic order: strategies tiebreak / rotate over host id.
  eligible.sort_by(|a, b| a.host.doc.id.cmp(&b.host.doc.id));

  if eligible.is_empty() {
    return Err(anyhow!(
      "NO_SUITABLE_HOST: no eligible host for stack {} under {strategy} placement",
      plan.stack.name
    ));
  }

  match strategy {
    PlacementStrategy::Auto => {
      // Assignments made here count toward the load of later picks.
      let mut extra = HashMap::<String, u64>::new();
      for i in unbound {
        let picked = eligible
          .iter()
          .min_by(|a, b| {
            let sa = auto_score(a, &extra);
            let sb = auto_score(b, &extra);
            sa.partial_cmp(&sb)
              .unwrap_or(std::cmp::Ordering::Equal)
              .then_with(|| a.host.doc.id.cmp(&b.host.doc.id))
          })
          .expect("eligible checked non-empty");
        let id = picked.host.doc.id.clone();
        *extra.entry(id.clone()).or_default() += 1;
        plan.specs[i].located_in_host = id;
      }
    }
    PlacementStrategy::Spread | PlacementStrategy::Datacenter => {
      for (n, i) in unbound.into_iter().enumerate() {
        plan.specs[i].located_in_host =
          eligible[n % eligible.len()].host.doc.id.clone();
      }
    }
    PlacementStrategy::Manual => unreachable!(),
  }

  plan.hosts_resolved = true;
  Ok(())
}

fn auto_score(
  info: &HostInfo,
  extra: &HashMap<String, u64>,
) -> f64 {
  let count = info.current_load.container_count
    + extra.get(&info.host.doc.id).copied().unwrap_or(0);
  info.current_load.cpu_usage * CPU_WEIGHT
    + info.current_load.memory_usage * MEMORY_WEIGHT
    + count as f64 * COUNT_WEIGHT
}

/// Constraint values support wildcard patterns, or regex when
/// wrapped with `\`.
fn matches_constraints(
  info: &HostInfo,
  constraints: &IndexMap<String, String>,
) -> bool {
  constraints.iter().all(|(key, pattern)| {
    let Some(value) = info.labels.get(key) else {
      return false;
    };
    if pattern.len() > 2
      && pattern.starts_with('\\')
      && pattern.ends_with('\\')
    {
      match regex::Regex::new(&pattern[1..pattern.len() - 1]) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
          warn!("invalid host constraint regex {pattern} | {e}");
          false
        }
      }
    } else {
      match wildcard::Wildcard::new(pattern.as_bytes()) {
        Ok(wildcard) => wildcard.is_match(value.as_bytes()),
        Err(e) => {
          warn!("invalid host constraint pattern {pattern} | {e}");
          false
        }
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use trellis_client::entities::{
    Document, Entity,
    host::{Host, HostLoad},
    stack::{DeploymentConfig, Stack},
  };

  use crate::stack::ContainerSpec;

  use super::*;

  fn host(id: &str, location: &str, count: u64) -> HostInfo {
    HostInfo {
      host: Host {
        doc: Document::new(Host::KIND, id),
        name: id.to_string(),
        location: location.to_string(),
        ..Default::default()
      },
      current_load: HostLoad {
        container_count: count,
        ..Default::default()
      },
      labels: [
        ("location".to_string(), location.to_string()),
        ("name".to_string(), id.to_string()),
      ]
      .into_iter()
      .collect(),
      ..Default::default()
    }
  }

  fn plan(
    strategy: PlacementStrategy,
    services: usize,
  ) -> DeploymentPlan {
    DeploymentPlan {
      stack: Stack {
        name: "web".to_string(),
        datacenter: "eu-1".to_string(),
        deployment: DeploymentConfig {
          placement_strategy: strategy,
          ..Default::default()
        },
        ..Default::default()
      },
      specs: (0..services)
        .map(|i| ContainerSpec {
          id: format!("c{i}"),
          name: format!("svc-{i}"),
          executable_name: "nginx:1.27".to_string(),
          ..Default::default()
        })
        .collect(),
      ..Default::default()
    }
  }

  fn assignments(plan: &DeploymentPlan) -> Vec<&str> {
    plan
      .specs
      .iter()
      .map(|s| s.located_in_host.as_str())
      .collect()
  }

  #[test]
  fn spread_balances_within_one() {
    let hosts =
      vec![host("h1", "eu-1", 0), host("h2", "eu-1", 0)];
    let mut plan = plan(PlacementStrategy::Spread, 5);
    resolve_placements(&mut plan, &hosts).unwrap();
    let mut counts = HashMap::<&str, usize>::new();
    for h in assignments(&plan) {
      *counts.entry(h).or_default() += 1;
    }
    // ceil(5/2) = 3 and floor(5/2) = 2.
    let mut sizes = counts.values().copied().collect::<Vec<_>>();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 3]);
  }

  #[test]
  fn auto_prefers_the_least_loaded_and_is_deterministic() {
    let hosts = vec![
      host("h-busy", "eu-1", 10),
      host("h-idle-b", "eu-1", 0),
      host("h-idle-a", "eu-1", 0),
    ];
    let mut plan = plan(PlacementStrategy::Auto, 1);
    resolve_placements(&mut plan, &hosts).unwrap();
    // Equal scores tiebreak lexicographically by host id.
    assert_eq!(assignments(&plan), vec!["h-idle-a"]);
  }

  #[test]
  fn datacenter_restricts_then_spreads() {
    let hosts = vec![
      host("h1", "eu-1", 0),
      host("h2", "us-1", 0),
      host("h3", "eu-1", 0),
    ];
    let mut plan = plan(PlacementStrategy::Datacenter, 4);
    resolve_placements(&mut plan, &hosts).unwrap();
    for h in assignments(&plan) {
      assert!(h == "h1" || h == "h3");
    }
  }

  #[test]
  fn empty_eligible_set_is_no_suitable_host() {
    let hosts = vec![host("h1", "us-1", 0)];
    let mut plan = plan(PlacementStrategy::Datacenter, 1);
    let err =
      resolve_placements(&mut plan, &hosts).unwrap_err();
    assert!(err.to_string().contains("NO_SUITABLE_HOST"));
  }

  #[test]
  fn constraints_filter_with_wildcards() {
    let mut labeled = host("h1", "eu-1", 0);
    labeled
      .labels
      .insert("tier".to_string(), "backend-large".to_string());
    let hosts = vec![labeled, host("h2", "eu-1", 0)];

    let mut plan = plan(PlacementStrategy::Spread, 2);
    plan
      .stack
      .deployment
      .host_constraints
      .insert("tier".to_string(), "backend-*".to_string());
    resolve_placements(&mut plan, &hosts).unwrap();
    assert_eq!(assignments(&plan), vec!["h1", "h1"]);
  }

  #[test]
  fn manual_with_unbound_services_errors() {
    let hosts = vec![host("h1", "eu-1", 0)];
    let mut plan = plan(PlacementStrategy::Manual, 1);
    let err =
      resolve_placements(&mut plan, &hosts).unwrap_err();
    assert!(err.to_string().contains("manual placement"));
  }
}
