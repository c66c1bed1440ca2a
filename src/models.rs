use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// A reachable target machine in the test fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    /// Unique host name
    pub name: String,
    /// Labels used for host selection
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Known network addresses of the host
    #[serde(default)]
    pub addresses: IpAddresses,
}

/// IP addresses of a host, the first entry of each family is the default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAddresses {
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Default (first) IPv4 address, if any
    pub fn default_ipv4(&self) -> Option<&str> {
        self.addresses.ipv4.first().map(String::as_str)
    }

    /// Default (first) IPv6 address, if any
    pub fn default_ipv6(&self) -> Option<&str> {
        self.addresses.ipv6.first().map(String::as_str)
    }
}

/// Discovered hosts partitioned into server and client sets. A host may
/// appear in both sets.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub servers: BTreeMap<String, Host>,
    pub clients: BTreeMap<String, Host>,
}

/// TCP/UDP ports a server task listens on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default)]
    pub tcp: Vec<u16>,
    #[serde(default)]
    pub udp: Vec<u16>,
}

/// A single command invocation on a single host. Server tasks carry the
/// client invocations of their round as `sub_tasks` and own the round's
/// `status`.
#[derive(Debug, Clone)]
pub struct Task {
    pub host: Host,
    pub command: String,
    pub args: Vec<String>,
    pub ports: Ports,
    pub sub_tasks: Vec<Task>,
    pub status: Option<Arc<Status>>,
}

impl Task {
    pub fn status(&self) -> &Arc<Status> {
        self.status
            .as_ref()
            .expect("server task is always built with a status")
    }
}

/// One entry of a round: either a server task (with nested client tasks)
/// or a pure inter-round delay.
#[derive(Debug, Clone)]
pub enum PlanStep {
    Task(Task),
    Sleep(Duration),
}

/// Precomputed test schedule: rounds x (server task + client subtasks)
#[derive(Debug, Clone)]
pub struct Plan {
    /// Tester name the plan was built for
    pub tester: String,
    /// Plan creation time, used as run identifier and name-pattern variable
    pub test_start_time: DateTime<Utc>,
    /// Union of all hosts touched by the plan, keyed by name
    pub affected_servers: BTreeMap<String, Host>,
    /// Tasks per round; `commands.len()` equals the configured rounds
    pub commands: Vec<Vec<PlanStep>>,
}

impl Plan {
    /// Iterate over all server tasks of the plan
    pub fn server_tasks(&self) -> impl Iterator<Item = &Task> {
        self.commands.iter().flatten().filter_map(|step| match step {
            PlanStep::Task(task) => Some(task),
            PlanStep::Sleep(_) => None,
        })
    }
}

/// Per-task success/failure bookkeeping, mutated concurrently from the
/// client tasks of a round
#[derive(Debug, Default)]
pub struct Status {
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Clone, Default)]
struct StatusInner {
    successful: StatusHosts,
    failed: StatusHosts,
    errors: BTreeMap<String, Vec<String>>,
}

/// Counters per host name, servers and clients tracked independently
#[derive(Debug, Clone, Default)]
pub struct StatusHosts {
    pub servers: BTreeMap<String, u32>,
    pub clients: BTreeMap<String, u32>,
}

/// Point-in-time copy of a [`Status`] for reporting and assertions
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub successful: StatusHosts,
    pub failed: StatusHosts,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl Status {
    pub fn add_successful_server(&self, host: &Host) {
        let mut inner = self.inner.lock().unwrap();
        *inner.successful.servers.entry(host.name.clone()).or_insert(0) += 1;
    }

    pub fn add_successful_client(&self, host: &Host) {
        let mut inner = self.inner.lock().unwrap();
        *inner.successful.clients.entry(host.name.clone()).or_insert(0) += 1;
    }

    pub fn add_failed_server(&self, host: &Host, err: &anyhow::Error) {
        let mut inner = self.inner.lock().unwrap();
        *inner.failed.servers.entry(host.name.clone()).or_insert(0) += 1;
        inner
            .errors
            .entry(host.name.clone())
            .or_default()
            .push(format!("{err:#}"));
    }

    pub fn add_failed_client(&self, host: &Host, err: &anyhow::Error) {
        let mut inner = self.inner.lock().unwrap();
        *inner.failed.clients.entry(host.name.clone()).or_insert(0) += 1;
        inner
            .errors
            .entry(host.name.clone())
            .or_default()
            .push(format!("{err:#}"));
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().unwrap();
        StatusSnapshot {
            successful: inner.successful.clone(),
            failed: inner.failed.clone(),
            errors: inner.errors.clone(),
        }
    }
}

/// Raw output of one client run, handed from a runner to a parser.
/// The parser takes ownership of the payload, stream included.
pub struct Input {
    pub test_start_time: DateTime<Utc>,
    /// Wall-clock time just before the client was invoked
    pub test_time: DateTime<Utc>,
    /// Zero-based round index
    pub round: usize,
    pub payload: Payload,
    pub tester: String,
    pub server_host: String,
    pub client_host: String,
    pub additional_info: String,
}

/// Exactly one of a live byte stream or pre-buffered bytes per frame.
/// Dropping the stream closes it.
pub enum Payload {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Bytes(Vec<u8>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Stream(_) => f.write_str("Payload::Stream(..)"),
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
        }
    }
}

/// Parsed tabular result of one frame, shared read-only by all outputs
#[derive(Debug, Clone)]
pub struct Data {
    pub tester: String,
    pub server_host: String,
    pub client_host: String,
    pub test_start_time: DateTime<Utc>,
    pub table: Table,
}

/// Column-oriented table: `headers[i]` describes `columns[i]`
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<Column>,
    pub columns: Vec<Column>,
}

/// A labeled, ordered sequence of cells
#[derive(Debug, Clone, Default)]
pub struct Column {
    pub label: String,
    pub rows: Vec<serde_json::Value>,
}

impl Column {
    pub fn new(label: impl Into<String>, rows: Vec<serde_json::Value>) -> Self {
        Column {
            label: label.into(),
            rows,
        }
    }
}

/// Render an any-typed cell the way it should appear in flat file output.
/// Numbers keep their JSON formatting, strings lose their quotes.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
