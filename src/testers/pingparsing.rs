//! pingparsing tester: clients ping the round's server host and report
//! the parsed statistics as JSON.
//!
//! There is no real server process to speak to, but the plan keeps the
//! server-task shape: the server side runs a plain `sleep` covering the
//! ping deadline so the substrate's readiness probe has a process to
//! observe and the usual server lifecycle applies.

use anyhow::Result;

use super::{assemble_plan, Tester};
use crate::config::{PingParsing as PingParsingConfig, Test};
use crate::models::{Environment, Host, Plan, Ports};

pub const NAME: &str = "pingparsing";

#[derive(Debug)]
pub struct PingParsing {
    config: PingParsingConfig,
}

impl PingParsing {
    pub fn new(test: &Test) -> Result<Box<dyn Tester>> {
        Ok(Box::new(PingParsing {
            config: test.pingparsing.clone().unwrap_or_default(),
        }))
    }

    fn server_command(&self, _server: &Host) -> (String, Vec<String>) {
        // Placeholder process; long enough to outlive every client run.
        let lifetime = self.config.deadline.saturating_mul(2).max(30);
        ("sleep".to_string(), vec![lifetime.to_string()])
    }

    fn client_command(&self, _server: &Host, _client: &Host) -> (String, Vec<String>) {
        (
            "pingparsing".to_string(),
            vec![
                "{{ .ServerAddressV4 }}".to_string(),
                format!("--count={}", self.config.count),
                "--timestamp=epoch".to_string(),
            ],
        )
    }
}

impl Tester for PingParsing {
    fn plan(&self, env: &Environment, test: &Test) -> Result<Plan> {
        assemble_plan(
            env,
            test,
            Ports::default(),
            &|server| self.server_command(server),
            &|server, client| self.client_command(server, client),
        )
    }
}
