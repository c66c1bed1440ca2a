//! Test planning: turn a discovered [`Environment`] and a test config into
//! an executable [`Plan`].

pub mod iperf3;
pub mod pingparsing;

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;

use crate::config::Test;
use crate::models::{Environment, Host, Plan, PlanStep, Ports, Status, Task};

/// Canonical port the generated server commands listen on. Copied into the
/// server args and into the `ServerPort` template variable at run time.
pub const DEFAULT_SERVER_PORT: u16 = 5601;

/// A tester knows one probe tool's command line. Planning is a pure
/// function of the environment and the test config.
pub trait Tester: Send + Sync + std::fmt::Debug {
    fn plan(&self, env: &Environment, test: &Test) -> Result<Plan>;
}

/// Shared plan assembly: rounds x (one server task per server host, with
/// one client subtask per client host), interleaved with the configured
/// inter-round delay.
///
/// Hosts are iterated in lexicographic name order so repeated planning over
/// the same environment yields structurally equal plans.
pub(crate) fn assemble_plan(
    env: &Environment,
    test: &Test,
    ports: Ports,
    build_server: &dyn Fn(&Host) -> (String, Vec<String>),
    build_client: &dyn Fn(&Host, &Host) -> (String, Vec<String>),
) -> Result<Plan> {
    let rounds = test.run_options.rounds;
    if rounds == 0 {
        bail!("test {:?} configures zero rounds", test.display_name());
    }

    let mut plan = Plan {
        tester: test.test_type.clone(),
        test_start_time: Utc::now(),
        affected_servers: Default::default(),
        commands: Vec::with_capacity(rounds),
    };

    for round in 0..rounds {
        let mut steps = Vec::new();

        for server in env.servers.values() {
            plan.affected_servers
                .entry(server.name.clone())
                .or_insert_with(|| server.clone());

            let (command, args) = build_server(server);
            let mut main_task = Task {
                host: server.clone(),
                command,
                args,
                ports: ports.clone(),
                sub_tasks: Vec::new(),
                status: Some(Arc::new(Status::default())),
            };

            for client in env.clients.values() {
                plan.affected_servers
                    .entry(client.name.clone())
                    .or_insert_with(|| client.clone());

                let (command, args) = build_client(server, client);
                main_task.sub_tasks.push(Task {
                    host: client.clone(),
                    command,
                    args,
                    ports: ports.clone(),
                    sub_tasks: Vec::new(),
                    status: None,
                });
            }

            steps.push(PlanStep::Task(main_task));
        }

        if round != rounds - 1 {
            if let Some(interval) = test.run_options.interval {
                steps.push(PlanStep::Sleep(interval));
            }
        }

        plan.commands.push(steps);
    }

    Ok(plan)
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::time::Duration;

    fn noop_build(_: &Host) -> (String, Vec<String>) {
        ("true".into(), Vec::new())
    }

    fn noop_build_client(_: &Host, _: &Host) -> (String, Vec<String>) {
        ("true".into(), Vec::new())
    }

    #[test]
    fn one_round_per_configured_round() {
        let env = environment(&["s1"], &["c1", "c2"]);
        let test = test_config("iperf3", 3);
        let plan =
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).unwrap();
        assert_eq!(plan.commands.len(), 3);
    }

    #[test]
    fn every_server_task_pairs_all_clients() {
        let env = environment(&["s1", "s2"], &["c1", "c2", "c3"]);
        let test = test_config("iperf3", 2);
        let plan =
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).unwrap();

        for task in plan.server_tasks() {
            assert_eq!(task.sub_tasks.len(), 3);
            assert!(task.status.is_some());
        }
        assert_eq!(plan.server_tasks().count(), 4);
        assert_eq!(plan.affected_servers.len(), 5);
    }

    #[test]
    fn sleep_is_appended_between_rounds_only() {
        let env = environment(&["s1"], &["c1"]);
        let mut test = test_config("iperf3", 3);
        test.run_options.interval = Some(Duration::from_secs(10));
        let plan =
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).unwrap();

        let sleeps_per_round: Vec<usize> = plan
            .commands
            .iter()
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| matches!(s, PlanStep::Sleep(_)))
                    .count()
            })
            .collect();
        assert_eq!(sleeps_per_round, vec![1, 1, 0]);
    }

    #[test]
    fn zero_rounds_is_an_error() {
        let env = environment(&["s1"], &["c1"]);
        let test = test_config("iperf3", 0);
        assert!(
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).is_err()
        );
    }

    #[test]
    fn empty_environment_yields_empty_rounds() {
        let env = Environment::default();
        let test = test_config("iperf3", 2);
        let plan =
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).unwrap();
        assert_eq!(plan.commands.len(), 2);
        assert!(plan.commands.iter().all(|steps| steps.is_empty()));
        assert!(plan.affected_servers.is_empty());
    }

    #[test]
    fn host_iteration_is_lexicographic() {
        let env = environment(&["s2", "s1"], &["c2", "c1"]);
        let test = test_config("iperf3", 1);
        let plan =
            assemble_plan(&env, &test, Ports::default(), &noop_build, &noop_build_client).unwrap();

        let servers: Vec<&str> = plan
            .server_tasks()
            .map(|task| task.host.name.as_str())
            .collect();
        assert_eq!(servers, vec!["s1", "s2"]);

        let clients: Vec<&str> = plan
            .server_tasks()
            .next()
            .unwrap()
            .sub_tasks
            .iter()
            .map(|task| task.host.name.as_str())
            .collect();
        assert_eq!(clients, vec!["c1", "c2"]);
    }
}
