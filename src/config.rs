//! Declarative test definition, loaded from a YAML file.
//!
//! Field names follow the original camelCase file format so existing test
//! definitions keep working.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Host;

/// Top-level test definition document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub runner: RunnerConfig,
    pub tests: Vec<Test>,
    /// Continue with the remaining tests when one fails fatally
    /// (e.g. host discovery errors out)
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Which substrate executes the tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub name: String,
    #[serde(default)]
    pub ansible: Option<AnsibleRunner>,
    #[serde(default)]
    pub mock: Option<MockRunner>,
}

/// Agent substrate settings: remote execution over an inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleRunner {
    pub inventory_file_path: String,
    #[serde(default = "default_ansible_command")]
    pub ansible_command: String,
    #[serde(default = "default_ansible_inventory_command")]
    pub ansible_inventory_command: String,
    #[serde(default)]
    pub groups: AnsibleGroups,
    /// Workers used to gather host facts in parallel
    #[serde(default = "default_parallel_host_fact_calls")]
    pub parallel_host_fact_calls: usize,
    /// Readiness probe attempts before a server task counts as failed
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Inventory group names for the two host roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleGroups {
    pub server: String,
    pub clients: String,
}

impl Default for AnsibleGroups {
    fn default() -> Self {
        AnsibleGroups {
            server: "server".into(),
            clients: "clients".into(),
        }
    }
}

/// Deadlines for the two kinds of command invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Short operations: inventory listing, fact gathering, probes
    #[serde(default = "default_command_timeout", with = "humantime_duration")]
    pub command_timeout: Duration,
    /// Long operations: the actual test task runs
    #[serde(default = "default_task_command_timeout", with = "humantime_duration")]
    pub task_command_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            command_timeout: default_command_timeout(),
            task_command_timeout: default_task_command_timeout(),
        }
    }
}

/// Mock substrate settings: a canned host universe, no external I/O
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRunner {
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// One configured test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    /// Free-form label used in logs; falls back to the type
    #[serde(default)]
    pub name: String,
    /// Tester to run, e.g. `iperf3`
    #[serde(rename = "type")]
    pub test_type: String,
    #[serde(default)]
    pub run_options: RunOptions,
    pub hosts: TestHosts,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub iperf3: Option<IPerf3>,
    #[serde(default)]
    pub pingparsing: Option<PingParsing>,
}

impl Test {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.test_type
        } else {
            &self.name
        }
    }
}

/// Execution mode within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Wait for each client task before starting the next
    Sequential,
    /// Launch all client tasks concurrently, join at the end
    Parallel,
}

/// How rounds and their client fan-out are run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// Delay between rounds; zero/absent means none
    #[serde(default, with = "humantime_opt_duration")]
    pub interval: Option<Duration>,
    #[serde(default = "default_mode")]
    pub mode: RunMode,
    /// Cap on concurrent client tasks in parallel mode; 0 means unbounded
    #[serde(default)]
    pub parallel_count: usize,
    /// Keep going with the next round after a round failed
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            rounds: default_rounds(),
            interval: None,
            mode: default_mode(),
            parallel_count: 0,
            continue_on_error: false,
        }
    }
}

/// Server and client selection for a test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestHosts {
    #[serde(default)]
    pub servers: Vec<HostSelector>,
    #[serde(default)]
    pub clients: Vec<HostSelector>,
}

/// One selection predicate over the discovered host universe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSelector {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub random: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// iperf3 tester settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPerf3 {
    #[serde(default)]
    pub udp: bool,
    /// `--time` passed to the client, in seconds
    #[serde(default = "default_iperf3_duration")]
    pub duration: u32,
    /// `--interval` passed to the client, in seconds
    #[serde(default = "default_iperf3_interval")]
    pub interval: u32,
    #[serde(default)]
    pub additional_flags: AdditionalFlags,
}

impl Default for IPerf3 {
    fn default() -> Self {
        IPerf3 {
            udp: false,
            duration: default_iperf3_duration(),
            interval: default_iperf3_interval(),
            additional_flags: AdditionalFlags::default(),
        }
    }
}

/// Extra flags appended to the generated commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFlags {
    #[serde(default)]
    pub server: Vec<String>,
    #[serde(default)]
    pub clients: Vec<String>,
}

/// pingparsing tester settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingParsing {
    /// Number of echo requests per client run
    #[serde(default = "default_ping_count")]
    pub count: u32,
    /// Overall deadline per client run, in seconds
    #[serde(default = "default_ping_deadline")]
    pub deadline: u32,
}

impl Default for PingParsing {
    fn default() -> Self {
        PingParsing {
            count: default_ping_count(),
            deadline: default_ping_deadline(),
        }
    }
}

/// One persistence backend subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub name: String,
    #[serde(default)]
    pub csv: Option<FilePath>,
    #[serde(default)]
    pub sqlite: Option<Sqlite>,
    #[serde(default)]
    pub dump: Option<FilePath>,
}

/// Target directory plus templated file name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePath {
    /// Directory the files are placed in; created if missing
    #[serde(default = "default_file_path")]
    pub file_path: String,
    /// Name pattern; empty means the backend default
    #[serde(default)]
    pub name_pattern: String,
}

/// SQLite backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sqlite {
    #[serde(flatten)]
    pub file: FilePath,
    /// Table name pattern; empty means the backend default
    #[serde(default)]
    pub table_name_pattern: String,
}

impl Config {
    /// Load and validate a test definition file
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read test definition {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse test definition {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that must hold before any execution starts
    pub fn validate(&self) -> Result<()> {
        if self.runner.name.is_empty() {
            bail!("runner.name must be set");
        }
        if self.tests.is_empty() {
            bail!("at least one test must be configured");
        }
        for test in &self.tests {
            if test.test_type.is_empty() {
                bail!("every test needs a type");
            }
            if test.hosts.servers.is_empty() || test.hosts.clients.is_empty() {
                bail!(
                    "test {:?} needs at least one servers and one clients selector",
                    test.display_name()
                );
            }
            for output in &test.outputs {
                if output.name.is_empty() {
                    bail!("test {:?} has an output without a name", test.display_name());
                }
            }
        }
        Ok(())
    }
}

fn default_ansible_command() -> String {
    "ansible".into()
}

fn default_ansible_inventory_command() -> String {
    "ansible-inventory".into()
}

fn default_parallel_host_fact_calls() -> usize {
    num_cpus::get().min(8)
}

fn default_command_retries() -> u32 {
    10
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_task_command_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

fn default_rounds() -> usize {
    1
}

fn default_mode() -> RunMode {
    RunMode::Sequential
}

fn default_iperf3_duration() -> u32 {
    10
}

fn default_iperf3_interval() -> u32 {
    1
}

fn default_ping_count() -> u32 {
    10
}

fn default_ping_deadline() -> u32 {
    15
}

fn default_file_path() -> String {
    ".".into()
}

/// Durations as humantime strings, e.g. `10s` or `45m`
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Optional durations as humantime strings; `0s` or absence mean none
mod humantime_opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let parsed = humantime::parse_duration(&raw).map_err(serde::de::Error::custom)?;
                Ok((!parsed.is_zero()).then_some(parsed))
            }
        }
    }
}
