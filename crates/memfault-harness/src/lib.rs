//! Fault sweep harness for memfault.
//!
//! This crate provides:
//! - Workloads: allocation patterns run through an allocator slot
//! - Sweep: drive a workload through every injection point of a fault plan
//! - Reports: machine-readable sweep results with a stable digest
//! - Structured logging: JSONL records for sweep steps and overlay journals

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod structured_log;
pub mod sweep;
pub mod workloads;

pub use error::{HarnessError, WorkloadError};
pub use report::{StepClass, SweepReport, SweepStep, SweepSummary};
pub use sweep::{FaultSweep, SweepOptions};
pub use workloads::{Workload, workload_by_name};
