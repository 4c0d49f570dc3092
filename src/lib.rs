//! Academic timetable engine.
//!
//! A job flows through clustering, per-cluster feasibility solving, genetic
//! optimization of the soft objectives, Q-learning refinement and a final
//! conflict-resolution pass. [`jobs::JobManager`] owns job lifecycles and
//! [`server`] exposes them over HTTP.

pub mod cache;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod feasibility;
pub mod hardware;
pub mod jobs;
pub mod learning;
pub mod memory;
pub mod objectives;
pub mod optimizer;
pub mod orchestrator;
pub mod progress;
pub mod provider;
pub mod resolver;
pub mod server;
pub mod solver;
pub mod validation;
pub mod workqueue;

pub use error::{EngineError, Result};
