//! Agent substrate: tasks run as remote shell invocations over an
//! inventory, readiness is a remote `pgrep`, output is captured from
//! stdout with the agent's JSON envelope stripped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::bytes::Regex;
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};

use super::{drive_plan, RoundSubstrate, Runner};
use crate::cancel::CancelToken;
use crate::config::{AnsibleRunner as AnsibleConfig, Config, RunOptions, Test};
use crate::executor::{CommandExecutor, ExecOpts, Executor};
use crate::hostsfilter::filter_hosts_list;
use crate::models::{Environment, Host, Input, IpAddresses, Payload, Plan, Task};

pub const NAME: &str = "ansible";

static HEAD_CLEAN: OnceLock<Regex> = OnceLock::new();
static TAIL_CLEAN: OnceLock<Regex> = OnceLock::new();

fn head_clean() -> &'static Regex {
    HEAD_CLEAN.get_or_init(|| Regex::new(r"(?sm)^.*(=> \{| >>$\n\{)").expect("valid regex"))
}

fn tail_clean() -> &'static Regex {
    TAIL_CLEAN.get_or_init(|| Regex::new(r"(?sm)(^\}.*)").expect("valid regex"))
}

/// Strip the agent's wrapping envelope (banner before the JSON payload,
/// trailing lines after the closing brace) from captured output.
fn clean_output(raw: &[u8]) -> Vec<u8> {
    let headless = head_clean().replace(raw, &b"{"[..]);
    tail_clean().replace(&headless, &b"}"[..]).into_owned()
}

pub struct Ansible {
    shared: Arc<AnsibleShared>,
    run_options: RunOptions,
}

struct AnsibleShared {
    config: AnsibleConfig,
    executor: Box<dyn Executor>,
    additional_info: Mutex<String>,
}

impl Ansible {
    /// Registry factory
    pub fn new(config: &Config) -> Result<Box<dyn Runner>> {
        let conf = config
            .runner
            .ansible
            .clone()
            .ok_or_else(|| anyhow!("runner {NAME} requires an ansible config block"))?;
        Ok(Box::new(Ansible::with_executor(
            conf,
            Box::new(CommandExecutor::new("runner:ansible")),
        )))
    }

    pub(crate) fn with_executor(config: AnsibleConfig, executor: Box<dyn Executor>) -> Self {
        Ansible {
            shared: Arc::new(AnsibleShared {
                config,
                executor,
                additional_info: Mutex::new(String::new()),
            }),
            run_options: RunOptions::default(),
        }
    }

    /// List the inventory and resolve the configured server/clients groups
    /// to host names.
    async fn list_inventory(&self) -> Result<(Vec<String>, Vec<String>)> {
        let shared = &self.shared;
        let out = shared
            .executor
            .execute_with_output(
                "list hosts from inventory",
                &shared.config.ansible_inventory_command,
                &[
                    format!("--inventory={}", shared.config.inventory_file_path),
                    "--list".to_string(),
                ],
                ExecOpts::with_timeout(shared.config.timeouts.command_timeout),
            )
            .await?;

        let inventory: serde_json::Value = serde_json::from_slice(&clean_output(&out))
            .context("failed to parse inventory listing as JSON")?;

        let servers = hosts_for_group(&inventory, &shared.config.groups.server);
        let clients = hosts_for_group(&inventory, &shared.config.groups.clients);
        Ok((servers, clients))
    }
}

/// Resolve a group to its hosts, following `children` groups.
fn hosts_for_group(inventory: &serde_json::Value, group: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut pending = vec![group.to_string()];
    let mut visited = std::collections::BTreeSet::new();

    while let Some(group) = pending.pop() {
        if !visited.insert(group.clone()) {
            continue;
        }
        let Some(entry) = inventory.get(&group) else {
            continue;
        };
        if let Some(list) = entry.get("hosts").and_then(|h| h.as_array()) {
            hosts.extend(list.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        if let Some(children) = entry.get("children").and_then(|c| c.as_array()) {
            pending.extend(children.iter().filter_map(|v| v.as_str().map(String::from)));
        }
    }

    hosts.sort();
    hosts.dedup();
    hosts
}

/// Shape of the facts the setup module returns for the default interfaces
#[derive(Debug, Deserialize)]
struct Facts {
    ansible_facts: NetworkFacts,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkFacts {
    #[serde(default)]
    ansible_default_ipv4: AddressFact,
    #[serde(default)]
    ansible_default_ipv6: AddressFact,
}

#[derive(Debug, Default, Deserialize)]
struct AddressFact {
    #[serde(default)]
    address: String,
}

impl AnsibleShared {
    fn inventory_arg(&self) -> String {
        format!("--inventory={}", self.config.inventory_file_path)
    }

    fn shell_args(&self, host: &str, command: &str, args: &[String]) -> Vec<String> {
        vec![
            self.inventory_arg(),
            host.to_string(),
            "--module-name=shell".to_string(),
            format!("--args={} {}", command, args.join(" ")),
        ]
    }

    /// Gather the default IPv4/IPv6 addresses of one host from its facts
    async fn host_network_addresses(&self, host: &str, cancel: CancelToken) -> Result<IpAddresses> {
        tracing::debug!(hostname = host, "retrieving host facts");

        let out = self
            .executor
            .execute_with_output(
                "gather host network facts",
                &self.config.ansible_command,
                &[
                    self.inventory_arg(),
                    host.to_string(),
                    "--module-name=setup".to_string(),
                    "--args=gather_subset=!all,!any,network".to_string(),
                ],
                ExecOpts {
                    timeout: Some(self.config.timeouts.command_timeout),
                    cancel: Some(cancel),
                },
            )
            .await?;

        let facts: Facts = serde_json::from_slice(&clean_output(&out))
            .with_context(|| format!("failed to parse facts for host {host}"))?;

        let mut addresses = IpAddresses::default();
        if !facts.ansible_facts.ansible_default_ipv4.address.is_empty() {
            addresses
                .ipv4
                .push(facts.ansible_facts.ansible_default_ipv4.address);
        }
        if !facts.ansible_facts.ansible_default_ipv6.address.is_empty() {
            addresses
                .ipv6
                .push(facts.ansible_facts.ansible_default_ipv6.address);
        }
        if addresses.ipv4.is_empty() && addresses.ipv6.is_empty() {
            bail!("no default IP addresses for host {host}");
        }

        tracing::debug!(hostname = host, "retrieved host facts");
        Ok(addresses)
    }
}

#[async_trait]
impl Runner for Ansible {
    async fn get_hosts_for_test(&self, test: &Test) -> Result<Environment> {
        let (server_names, client_names) = self.list_inventory().await?;

        let mut unique: Vec<String> = server_names
            .iter()
            .chain(client_names.iter())
            .cloned()
            .collect();
        unique.sort();
        unique.dedup();

        // Facts are gathered in parallel; the first failed worker aborts
        // the whole discovery.
        let semaphore = Arc::new(Semaphore::new(
            self.shared.config.parallel_host_fact_calls.max(1),
        ));
        let known: Arc<Mutex<BTreeMap<String, Host>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let (cancel_src, cancel_token) = crate::cancel::channel();

        let mut workers = Vec::with_capacity(unique.len());
        for name in unique {
            let shared = self.shared.clone();
            let semaphore = semaphore.clone();
            let known = known.clone();
            let cancel = cancel_token.clone();
            workers.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("fact worker pool closed"))?;
                let addresses = shared.host_network_addresses(&name, cancel).await?;
                let mut host = Host::new(name.clone());
                host.addresses = addresses;
                known.lock().unwrap().insert(name, host);
                Ok::<_, anyhow::Error>(())
            }));
        }

        let mut first_err = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        cancel_src.cancel();
                        first_err = Some(err);
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        cancel_src.cancel();
                        first_err = Some(anyhow!(err).context("fact worker panicked"));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err.context("errors in retrieving host facts"));
        }

        let known = known.lock().unwrap();
        let server_universe = hosts_from_names(&server_names, &known)?;
        let client_universe = hosts_from_names(&client_names, &known)?;

        let mut env = Environment::default();
        for selector in &test.hosts.servers {
            for host in filter_hosts_list(&server_universe, selector)? {
                env.servers.entry(host.name.clone()).or_insert(host);
            }
        }
        for selector in &test.hosts.clients {
            for host in filter_hosts_list(&client_universe, selector)? {
                env.clients.entry(host.name.clone()).or_insert(host);
            }
        }
        Ok(env)
    }

    async fn prepare(&mut self, run_opts: &RunOptions, _plan: &Plan) -> Result<()> {
        self.run_options = run_opts.clone();

        let out = self
            .shared
            .executor
            .execute_with_output(
                "get ansible version",
                &self.shared.config.ansible_command,
                &["--version".to_string()],
                ExecOpts::with_timeout(self.shared.config.timeouts.command_timeout),
            )
            .await?;

        let out = String::from_utf8_lossy(&out);
        if let Some(banner) = out.lines().find(|line| line.starts_with("ansible ")) {
            *self.shared.additional_info.lock().unwrap() = banner.to_string();
        }
        Ok(())
    }

    async fn execute(
        &self,
        plan: &Plan,
        parser_tx: mpsc::Sender<Input>,
        cancel: CancelToken,
    ) -> Result<()> {
        drive_plan(
            self.shared.clone(),
            plan,
            &self.run_options,
            &parser_tx,
            &cancel,
        )
        .await
    }

    async fn cleanup(&self, _plan: &Plan) -> Result<()> {
        // Remote shell invocations leave nothing behind to delete.
        Ok(())
    }
}

fn hosts_from_names(names: &[String], known: &BTreeMap<String, Host>) -> Result<Vec<Host>> {
    names
        .iter()
        .map(|name| {
            known.get(name).cloned().ok_or_else(|| {
                anyhow!("host {name:?} not found in the gathered hosts list, this should not have happened")
            })
        })
        .collect()
}

#[async_trait]
impl RoundSubstrate for AnsibleShared {
    async fn run_server(&self, _round: usize, task: &Task, cancel: CancelToken) -> Result<()> {
        self.executor
            .execute(
                "run main task command",
                &self.config.ansible_command,
                &self.shell_args(&task.host.name, &task.command, &task.args),
                ExecOpts::with_cancel(cancel),
            )
            .await
    }

    async fn probe_server(&self, _round: usize, task: &Task, cancel: CancelToken) -> Result<()> {
        self.executor
            .execute(
                "check if main task is running",
                &self.config.ansible_command,
                &self.shell_args(&task.host.name, "pgrep", &[task.command.clone()]),
                ExecOpts {
                    timeout: Some(self.config.timeouts.command_timeout),
                    cancel: Some(cancel),
                },
            )
            .await
    }

    async fn run_client(&self, _round: usize, task: &Task, cancel: CancelToken) -> Result<Payload> {
        let out = self
            .executor
            .execute_with_output(
                "run sub task command",
                &self.config.ansible_command,
                &self.shell_args(&task.host.name, &task.command, &task.args),
                ExecOpts {
                    timeout: Some(self.config.timeouts.task_command_timeout),
                    cancel: Some(cancel),
                },
            )
            .await?;

        Ok(Payload::Bytes(clean_output(&out)))
    }

    fn probe_retries(&self) -> u32 {
        self.config.command_retries
    }

    fn additional_info(&self) -> String {
        self.additional_info.lock().unwrap().clone()
    }
}
