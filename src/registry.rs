//! Explicit name-to-factory registry for the four pluggable roles.
//!
//! Built once at program entry and passed to the orchestrator; resolving
//! an unknown name is a configuration error.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::config::{Config, OutputConfig, Test};
use crate::outputs::{self, Output};
use crate::parsers::{self, Parser};
use crate::runners::{self, Runner};
use crate::testers::{self, Tester};

pub type TesterFactory = fn(&Test) -> Result<Box<dyn Tester>>;
pub type RunnerFactory = fn(&Config) -> Result<Box<dyn Runner>>;
pub type ParserFactory = fn(&Test) -> Result<Box<dyn Parser>>;
pub type OutputFactory = fn(&OutputConfig) -> Result<Box<dyn Output>>;

#[derive(Default)]
pub struct Registry {
    testers: HashMap<&'static str, TesterFactory>,
    runners: HashMap<&'static str, RunnerFactory>,
    parsers: HashMap<&'static str, ParserFactory>,
    outputs: HashMap<&'static str, OutputFactory>,
}

impl Registry {
    /// An empty registry; backends are added explicitly
    pub fn new() -> Self {
        Registry::default()
    }

    /// A registry with every built-in backend registered
    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();

        registry.register_tester(testers::iperf3::NAME, testers::iperf3::IPerf3::new);
        registry.register_tester(
            testers::pingparsing::NAME,
            testers::pingparsing::PingParsing::new,
        );

        registry.register_runner(runners::ansible::NAME, runners::ansible::Ansible::new);
        registry.register_runner(runners::mock::NAME, runners::mock::MockRunner::new);

        registry.register_parser(parsers::iperf3::NAME, parsers::iperf3::IPerf3Parser::new);
        registry.register_parser(
            parsers::pingparsing::NAME,
            parsers::pingparsing::PingParsingParser::new,
        );

        registry.register_output(outputs::csv::NAME, outputs::csv::CsvOutput::new);
        registry.register_output(outputs::sqlite::NAME, outputs::sqlite::SqliteOutput::new);
        registry.register_output(outputs::dump::NAME, outputs::dump::DumpOutput::new);

        registry
    }

    pub fn register_tester(&mut self, name: &'static str, factory: TesterFactory) {
        self.testers.insert(name, factory);
    }

    pub fn register_runner(&mut self, name: &'static str, factory: RunnerFactory) {
        self.runners.insert(name, factory);
    }

    pub fn register_parser(&mut self, name: &'static str, factory: ParserFactory) {
        self.parsers.insert(name, factory);
    }

    pub fn register_output(&mut self, name: &'static str, factory: OutputFactory) {
        self.outputs.insert(name, factory);
    }

    pub fn tester(&self, name: &str, test: &Test) -> Result<Box<dyn Tester>> {
        match self.testers.get(name) {
            Some(factory) => factory(test),
            None => bail!("unknown tester {name:?}"),
        }
    }

    pub fn runner(&self, name: &str, config: &Config) -> Result<Box<dyn Runner>> {
        match self.runners.get(name) {
            Some(factory) => factory(config),
            None => bail!("unknown runner {name:?}"),
        }
    }

    pub fn parser(&self, name: &str, test: &Test) -> Result<Box<dyn Parser>> {
        match self.parsers.get(name) {
            Some(factory) => factory(test),
            None => bail!("unknown parser {name:?}"),
        }
    }

    pub fn output(&self, name: &str, out_cfg: &OutputConfig) -> Result<Box<dyn Output>> {
        match self.outputs.get(name) {
            Some(factory) => factory(out_cfg),
            None => bail!("unknown output {name:?}"),
        }
    }
}
