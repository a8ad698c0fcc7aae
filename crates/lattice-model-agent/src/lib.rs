//! Per-node model download agent
//!
//! Runs as a DaemonSet on every node of a node group. The agent reconciles the
//! `LocalModelNode` named after its node: it launches download jobs into the
//! node group volume, reports per-model download status and removes model
//! folders that are no longer wanted.

#![deny(missing_docs)]

pub mod client;
mod controller;
pub mod filesystem;
pub mod job;

pub use client::{AgentKube, AgentKubeImpl};
pub use controller::{error_policy, reconcile, AgentContext, ERROR_REQUEUE};
pub use filesystem::{LocalFilesystem, ModelFilesystem};
pub use job::{node_job_selector, MAX_DOWNLOAD_JOBS};
