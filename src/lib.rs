//! Ancientt - an automated network testing tool
//!
//! Ancientt schedules probe tools (iperf3, pingparsing) across a fleet of
//! hosts, captures their output, parses it into a uniform tabular data
//! model and fans the results out to pluggable persistence backends
//! (CSV, SQLite, plain dumps).
//!
//! The pipeline per configured test: a *tester* plans rounds of
//! server/client task pairs, a *runner* executes them on a substrate
//! (remote shell over an inventory, or a mock), a *parser* turns raw
//! output frames into tables and every configured *output* persists them.
//!
//! # Example
//!
//! ```rust,no_run
//! use ancientt::{cancel, Config, Registry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("testdefinition.yaml")?;
//!     let registry = Registry::with_defaults();
//!
//!     let (_cancel_src, cancel_token) = cancel::channel();
//!     let report = ancientt::pipeline::run_config(&config, &registry, cancel_token).await?;
//!
//!     for test in &report.tests {
//!         test.log();
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod executor;
pub mod hostsfilter;
pub mod models;
pub mod outputs;
pub mod parsers;
pub mod pipeline;
pub mod registry;
pub mod runners;
pub mod template;
pub mod testers;

pub use config::Config;
pub use models::{Data, Environment, Host, Input, Plan, Status};
pub use pipeline::{run_config, RunReport, TestReport};
pub use registry::Registry;
