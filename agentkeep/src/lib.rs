#![cfg_attr(docsrs, feature(doc_cfg))]
//! A durable, multi-tenant runtime for language-model agent runs.
//!
//! Runs are event-sourced: every observable fact (a model token, a tool
//! call, a suspension) is appended to a per-run log and persisted before
//! the run's state machine advances, so a run can be resumed from its last
//! checkpoint after a crash or a worker restart.

pub mod agent;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod llm;
pub mod prelude;
pub mod scope;
pub mod store;
pub mod swarm;
pub mod tool;
pub mod types;
