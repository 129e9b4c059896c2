//! wuflow: workunit lifecycle pipeline.
//!
//! Daemons that shepherd redundantly-computed workunits through their
//! server-side lifecycle: transitioning, assimilation, file deletion,
//! archival purge, and proportional-share feeding, all over a shared
//! persistent job store.

pub mod assimilator;
pub mod config;
pub mod daemon;
pub mod error;
pub mod feeder;
pub mod file_deleter;
pub mod model;
pub mod purge;
pub mod store;
pub mod transitioner;
