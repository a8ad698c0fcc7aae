//! Startup helpers run before the controllers start

pub mod crds;

pub use crds::{crds_yaml, ensure_crds};
