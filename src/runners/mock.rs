//! Mock substrate: canned hosts, baked output frames, no external I/O.
//!
//! Runs the same round state machine as the real substrates and records
//! an event trace, so tests can assert ordering guarantees (server ready
//! before clients, clients finished before server stopped) without any
//! processes being spawned.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{drive_plan, RoundSubstrate, Runner};
use crate::cancel::CancelToken;
use crate::config::{Config, RunOptions, Test};
use crate::hostsfilter::filter_hosts_list;
use crate::models::{Environment, Host, Input, Payload, Plan, Task};

pub const NAME: &str = "mock";

/// Baked client output: the shape of `iperf3 --json`, enough for the
/// iperf3 parser to produce a table.
pub const CANNED_IPERF3_OUTPUT: &str = r#"{
  "intervals": [
    {"sum": {"start": 0.0, "end": 1.0, "bytes": 131072000, "bits_per_second": 1048576000.0, "retransmits": 0, "omitted": false}},
    {"sum": {"start": 1.0, "end": 2.0, "bytes": 140509184, "bits_per_second": 1124073472.0, "retransmits": 1, "omitted": false}}
  ],
  "end": {
    "sum_sent": {"start": 0.0, "end": 2.0, "bytes": 271581184, "bits_per_second": 1086324736.0, "retransmits": 1},
    "sum_received": {"start": 0.0, "end": 2.0, "bytes": 270532608, "bits_per_second": 1082130432.0}
  }
}"#;

/// Observable lifecycle points of a mock run
#[derive(Debug, Clone)]
pub enum MockEvent {
    ServerLaunched { round: usize, host: String, at: Instant },
    ServerReady { round: usize, host: String, at: Instant },
    ClientStarted { round: usize, host: String, at: Instant },
    ClientFinished { round: usize, host: String, at: Instant },
    ServerStopped { round: usize, host: String, at: Instant },
}

pub type MockEvents = Arc<Mutex<Vec<MockEvent>>>;

/// Knobs for failure injection and timing in tests
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// The n-th readiness probe of every server task succeeds (1 = first)
    pub ready_after_probes: u32,
    pub probe_retries: u32,
    pub probe_spacing: Duration,
    pub launch_grace: Duration,
    /// Time each client task spends "running"
    pub client_delay: Duration,
    /// Server tasks that fail to launch, keyed by (round, host name)
    pub server_launch_failures: HashSet<(usize, String)>,
    /// Server tasks error out when their cancellation fires, like a
    /// process reporting its own forced termination
    pub server_error_on_stop: bool,
    /// Client tasks that fail to start, keyed by (round, host name)
    pub client_failures: HashSet<(usize, String)>,
    /// Raw bytes every successful client run produces
    pub client_payload: Vec<u8>,
    /// Emit payloads as live streams instead of buffered bytes
    pub stream_payloads: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            ready_after_probes: 1,
            probe_retries: 5,
            probe_spacing: Duration::ZERO,
            launch_grace: Duration::ZERO,
            client_delay: Duration::ZERO,
            server_launch_failures: HashSet::new(),
            server_error_on_stop: false,
            client_failures: HashSet::new(),
            client_payload: CANNED_IPERF3_OUTPUT.as_bytes().to_vec(),
            stream_payloads: false,
        }
    }
}

pub struct MockRunner {
    universe: Vec<Host>,
    substrate: Arc<MockSubstrate>,
    run_options: RunOptions,
}

impl MockRunner {
    /// Registry factory: hosts come from the `mock` runner block, falling
    /// back to a small loopback fleet.
    pub fn new(config: &Config) -> Result<Box<dyn Runner>> {
        let hosts = config
            .runner
            .mock
            .as_ref()
            .map(|mock| mock.hosts.clone())
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or_else(default_universe);
        Ok(Box::new(MockRunner::with_behavior(
            hosts,
            MockBehavior::default(),
        )))
    }

    pub fn with_behavior(universe: Vec<Host>, behavior: MockBehavior) -> Self {
        MockRunner {
            universe,
            substrate: Arc::new(MockSubstrate {
                behavior,
                probe_counts: Mutex::new(HashMap::new()),
                events: Arc::new(Mutex::new(Vec::new())),
            }),
            run_options: RunOptions::default(),
        }
    }

    /// Handle on the recorded event trace; stays valid after the runner
    /// is handed to the orchestrator.
    pub fn events(&self) -> MockEvents {
        self.substrate.events.clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn get_hosts_for_test(&self, test: &Test) -> Result<Environment> {
        let mut env = Environment::default();
        for selector in &test.hosts.servers {
            for host in filter_hosts_list(&self.universe, selector)? {
                env.servers.entry(host.name.clone()).or_insert(host);
            }
        }
        for selector in &test.hosts.clients {
            for host in filter_hosts_list(&self.universe, selector)? {
                env.clients.entry(host.name.clone()).or_insert(host);
            }
        }
        Ok(env)
    }

    async fn prepare(&mut self, run_opts: &RunOptions, _plan: &Plan) -> Result<()> {
        self.run_options = run_opts.clone();
        Ok(())
    }

    async fn execute(
        &self,
        plan: &Plan,
        parser_tx: mpsc::Sender<Input>,
        cancel: CancelToken,
    ) -> Result<()> {
        drive_plan(
            self.substrate.clone(),
            plan,
            &self.run_options,
            &parser_tx,
            &cancel,
        )
        .await
    }

    async fn cleanup(&self, _plan: &Plan) -> Result<()> {
        tracing::debug!("mock runner has nothing to clean up");
        Ok(())
    }
}

struct MockSubstrate {
    behavior: MockBehavior,
    probe_counts: Mutex<HashMap<(usize, String), u32>>,
    events: MockEvents,
}

impl MockSubstrate {
    fn record(&self, event: MockEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl RoundSubstrate for MockSubstrate {
    async fn run_server(&self, round: usize, task: &Task, cancel: CancelToken) -> Result<()> {
        let key = (round, task.host.name.clone());
        if self.behavior.server_launch_failures.contains(&key) {
            bail!("mock server on {} failed to launch", task.host.name);
        }

        self.record(MockEvent::ServerLaunched {
            round,
            host: task.host.name.clone(),
            at: Instant::now(),
        });

        cancel.cancelled().await;

        self.record(MockEvent::ServerStopped {
            round,
            host: task.host.name.clone(),
            at: Instant::now(),
        });

        if self.behavior.server_error_on_stop {
            bail!("mock server on {} was killed", task.host.name);
        }
        Ok(())
    }

    async fn probe_server(&self, round: usize, task: &Task, _cancel: CancelToken) -> Result<()> {
        let key = (round, task.host.name.clone());
        if self.behavior.server_launch_failures.contains(&key) {
            bail!("mock server on {} is not running", task.host.name);
        }

        let attempts = {
            let mut counts = self.probe_counts.lock().unwrap();
            let entry = counts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts < self.behavior.ready_after_probes {
            bail!(
                "mock server on {} not ready (probe {attempts})",
                task.host.name
            );
        }

        if attempts == self.behavior.ready_after_probes {
            self.record(MockEvent::ServerReady {
                round,
                host: task.host.name.clone(),
                at: Instant::now(),
            });
        }
        Ok(())
    }

    async fn run_client(&self, round: usize, task: &Task, _cancel: CancelToken) -> Result<Payload> {
        let key = (round, task.host.name.clone());
        if self.behavior.client_failures.contains(&key) {
            bail!("mock client on {} failed to start", task.host.name);
        }

        self.record(MockEvent::ClientStarted {
            round,
            host: task.host.name.clone(),
            at: Instant::now(),
        });

        if !self.behavior.client_delay.is_zero() {
            tokio::time::sleep(self.behavior.client_delay).await;
        }

        self.record(MockEvent::ClientFinished {
            round,
            host: task.host.name.clone(),
            at: Instant::now(),
        });

        let bytes = self.behavior.client_payload.clone();
        if self.behavior.stream_payloads {
            Ok(Payload::Stream(Box::new(std::io::Cursor::new(bytes))))
        } else {
            Ok(Payload::Bytes(bytes))
        }
    }

    fn probe_retries(&self) -> u32 {
        self.behavior.probe_retries
    }

    fn probe_spacing(&self) -> Duration {
        self.behavior.probe_spacing
    }

    fn launch_grace(&self) -> Duration {
        self.behavior.launch_grace
    }

    fn additional_info(&self) -> String {
        "mock".to_string()
    }
}

fn default_universe() -> Vec<Host> {
    (1..=3)
        .map(|i| {
            let mut host = Host::new(format!("mock-host-{i}"));
            host.addresses.ipv4 = vec!["127.0.0.1".to_string()];
            host
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostSelector;

    fn test_with_selectors() -> Test {
        serde_yaml::from_str(
            "type: iperf3\nhosts:\n  servers: [{count: 1}]\n  clients: [{all: true}]\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn discovery_applies_selectors() {
        let runner = MockRunner::with_behavior(default_universe(), MockBehavior::default());
        let env = runner
            .get_hosts_for_test(&test_with_selectors())
            .await
            .unwrap();
        assert_eq!(env.servers.len(), 1);
        assert_eq!(env.clients.len(), 3);
        assert!(env.servers.contains_key("mock-host-1"));
    }

    #[tokio::test]
    async fn discovery_is_idempotent() {
        let runner = MockRunner::with_behavior(default_universe(), MockBehavior::default());
        let test = test_with_selectors();
        let a = runner.get_hosts_for_test(&test).await.unwrap();
        let b = runner.get_hosts_for_test(&test).await.unwrap();
        assert_eq!(
            a.servers.keys().collect::<Vec<_>>(),
            b.servers.keys().collect::<Vec<_>>()
        );
        assert_eq!(
            a.clients.keys().collect::<Vec<_>>(),
            b.clients.keys().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn named_selector_misses_are_errors() {
        let runner = MockRunner::with_behavior(default_universe(), MockBehavior::default());
        let mut test = test_with_selectors();
        test.hosts.servers = vec![HostSelector {
            name: Some("missing".into()),
            ..Default::default()
        }];
        assert!(runner.get_hosts_for_test(&test).await.is_err());
    }
}
