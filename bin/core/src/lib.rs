//! # Trellis Core
//!
//! The central controller of the Trellis container orchestrator:
//! typed repository over the MVCC document store, stack parsing and
//! placement, the wave deployer, the task subsystem, the scheduled
//! action engine, the change broadcaster and the agent directory.
//!
//! The HTTP API surface consuming these modules lives outside this
//! crate; the binary serves only the websocket event endpoint and the
//! background loops.

#[macro_use]
extern crate tracing;

pub mod agents;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod placement;
pub mod repo;
pub mod schedule;
pub mod stack;
pub mod startup;
pub mod state;
pub mod task;
pub mod ws;
