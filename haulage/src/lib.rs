//! `haulage` — in-line traffic accountant and prepaid-balance enforcer for
//! subscriber networks.
//!
//! The binary (`main.rs`) is a thin CLI shell; everything that matters
//! lives here so it can be driven from integration tests without spawning
//! a process. See `SPEC_FULL.md` for the component breakdown (C1–C8).

pub mod capture;
pub mod classify;
pub mod config;
pub mod db;
pub mod dns_extract;
pub mod effector;
pub mod enforcement;
pub mod error;
pub mod flow_aggregator;
pub mod model;
pub mod store;
pub mod subscriber_aggregator;
pub mod supervisor;
