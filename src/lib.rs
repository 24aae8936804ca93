//! cvrun: run controller for JSON-described automation runs.
//!
//! A run manifest lists testsets, each a group of numbered test cases. The
//! controller logs in to a commcell, runs the testsets on a pool of testset
//! workers (each testset with its own pool of test case workers), collects
//! every outcome, and reports the run as HTML, mail and an optional
//! database upload.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Manifest**: Parse and normalise the JSON run description
//! - **Testcase**: The `TestCase` contract, the id registry, command-backed cases
//! - **Connector**: Commcell login sessions and results upload
//! - **Orchestrator**: Work queues, the results aggregate, the run phases
//! - **Report**: HTML report, console tables, mail
//!
//! # Example
//!
//! ```no_run
//! use cvrun::config::load_config;
//! use cvrun::manifest::parse_manifest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("automation.toml"))?;
//!     let manifest = parse_manifest(std::path::Path::new("run.json"))?;
//!     // ... set up registry, connector, notifier, then RunController::run ...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod shell;
pub mod testcase;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use connector::{Connector, Session};
pub use manifest::{RunFilter, RunManifest, parse_manifest};
pub use orchestrator::{RunController, RunOutcome};
pub use report::{Notifier, Reporter};
pub use testcase::{TestCase, TestCaseRegistry, TestContext, TestStatus};
