//! topocache - hardware topology detection for HPC partitions
//!
//! Detects the processor and accelerator layout of every partition of a
//! configured system, either on this host or through a one-node scheduler
//! job, and caches the result on disk.

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod system;
pub mod topology;
pub mod ui;

pub use error::{TopoError, TopoResult};
