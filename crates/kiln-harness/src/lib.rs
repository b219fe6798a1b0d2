//! # kiln-harness
//!
//! VM-based validation harness for freshly built embedded Linux images.
//!
//! The harness boots an image in an ephemeral QEMU instance, drives it
//! through a sequence of bounded test scenarios over SSH, collects runtime
//! metrics, persists the results, and classifies regressions against the
//! previous run.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       kiln-harness                        │
//! │  ┌───────────────┐  ┌────────────────┐  ┌──────────────┐  │
//! │  │InstanceManager│─▶│ ScenarioEngine │─▶│ ResultStore  │  │
//! │  └───────┬───────┘  └───────┬────────┘  └──────┬───────┘  │
//! │          │                  │                  │          │
//! │     port allocator     RemoteShell        Comparator      │
//! │                        + metrics                          │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                      qemu-system-* / ssh
//! ```
//!
//! Scenarios against one instance run strictly sequentially (they share
//! guest state); independent instances may be launched and torn down
//! concurrently. Every blocking operation accepts a cancellation token,
//! and cancellation is always reported distinctly from a timeout.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod arch;
pub mod compare;
pub mod config;
pub mod error;
pub mod image;
pub mod instance;
pub mod manager;
pub mod metrics;
pub mod ports;
pub mod results;
pub mod scenario;
pub mod scenarios;
pub mod shell;

pub use arch::GuestArch;
pub use compare::{
    DurationStatus, TestComparison, TestComparisonDetail, TestStatus, compare_results,
};
pub use config::{HarnessConfig, SshCredentials};
pub use error::{HarnessError, Result};
pub use image::ImageArtifact;
pub use instance::{Instance, InstanceId, InstancePorts, InstanceState};
pub use manager::InstanceManager;
pub use metrics::{TestMetrics, collect_system_metrics};
pub use results::{ResultStore, RunRecord, TestResult};
pub use scenario::{Scenario, ScenarioContext, ScenarioRegistry, run_all, run_scenario};
pub use shell::{CommandOutput, RemoteShell};
