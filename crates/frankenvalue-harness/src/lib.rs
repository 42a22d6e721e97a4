//! Stress and convergence harness for frankenvalue.
//!
//! This crate provides:
//! - Convergence runs: many threads racing on first reads must agree on one value
//! - Churn runs: seeded random get/remove/put traffic checked against a model,
//!   with cache-array invariants inspected after every step
//! - JSON reports for both, consumed by the `harness` binary

#![forbid(unsafe_code)]

pub mod churn;
pub mod converge;
pub mod error;

pub use churn::{ChurnParams, ChurnReport, XorShift64, check_snapshot, run_churn};
pub use converge::{ConvergeParams, ConvergeReport, run_converge};
pub use error::HarnessError;
