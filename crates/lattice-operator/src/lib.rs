//! Lattice local model cache operator
//!
//! One binary, two modes:
//! - `controller`: cache, namespace cache and node-group controllers
//! - `agent`: the per-node download agent

#![deny(missing_docs)]

pub mod controller_runner;
pub mod startup;
