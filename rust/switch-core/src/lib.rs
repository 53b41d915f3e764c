// rust/switch-core/src/lib.rs

//! Switch Control Plane - Core Library
//!
//! This crate keeps the worker, slot and multicast state of an aggregating
//! switch consistent across jobs: admission and removal of workers, clearing
//! between jobs, and the table programming behind both.

pub mod config;
pub mod error;
pub mod retry;

// Re-export commonly used types for convenience
pub use config::{ControllerConfig, JobConfiguration};
pub use error::{ControlError, Result};

pub mod dataplane;
pub use dataplane::{MemoryDataplane, TableClient, TableOps};

pub mod job;
pub use job::{Admission, AdmitRequest, JobCoordinator, JobDescription, Phase, Worker, WorkerAddress, WorkerRole};
