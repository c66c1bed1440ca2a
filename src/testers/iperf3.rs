//! iperf3 tester: generates `iperf3 --server` / `iperf3 --client` pairs.

use anyhow::Result;

use super::{assemble_plan, Tester, DEFAULT_SERVER_PORT};
use crate::config::{IPerf3 as IPerf3Config, Test};
use crate::models::{Environment, Host, Plan, Ports};

pub const NAME: &str = "iperf3";

#[derive(Debug)]
pub struct IPerf3 {
    config: IPerf3Config,
}

impl IPerf3 {
    pub fn new(test: &Test) -> Result<Box<dyn Tester>> {
        Ok(Box::new(IPerf3 {
            config: test.iperf3.clone().unwrap_or_default(),
        }))
    }

    fn server_command(&self, _server: &Host) -> (String, Vec<String>) {
        let mut args = vec![
            "--json".to_string(),
            "--port={{ .ServerPort }}".to_string(),
            "--server".to_string(),
        ];
        if self.config.udp {
            args.push("--udp".to_string());
        }
        args.extend(self.config.additional_flags.server.iter().cloned());
        ("iperf3".to_string(), args)
    }

    fn client_command(&self, _server: &Host, _client: &Host) -> (String, Vec<String>) {
        let mut args = vec![
            format!("--time={}", self.config.duration),
            format!("--interval={}", self.config.interval),
            "--json".to_string(),
            "--port={{ .ServerPort }}".to_string(),
            "--client={{ .ServerAddressV4 }}".to_string(),
        ];
        if self.config.udp {
            args.push("--udp".to_string());
        }
        args.extend(self.config.additional_flags.clients.iter().cloned());
        ("iperf3".to_string(), args)
    }
}

impl Tester for IPerf3 {
    fn plan(&self, env: &Environment, test: &Test) -> Result<Plan> {
        let ports = if self.config.udp {
            Ports {
                udp: vec![DEFAULT_SERVER_PORT],
                ..Default::default()
            }
        } else {
            Ports {
                tcp: vec![DEFAULT_SERVER_PORT],
                ..Default::default()
            }
        };

        assemble_plan(
            env,
            test,
            ports,
            &|server| self.server_command(server),
            &|server, client| self.client_command(server, client),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanStep;
    use crate::testers::testutil::{environment, test_config};

    #[test]
    fn plans_server_and_client_commands() {
        let test = test_config("iperf3", 2);
        let tester = IPerf3::new(&test).unwrap();
        let env = environment(&["s1"], &["c1", "c2"]);

        let plan = tester.plan(&env, &test).unwrap();
        assert_eq!(plan.tester, "iperf3");
        assert_eq!(plan.commands.len(), 2);

        let PlanStep::Task(main_task) = &plan.commands[0][0] else {
            panic!("first step must be the server task");
        };
        assert_eq!(main_task.command, "iperf3");
        assert!(main_task.args.contains(&"--server".to_string()));
        assert!(main_task.args.contains(&"--port={{ .ServerPort }}".to_string()));
        assert_eq!(main_task.ports.tcp, vec![DEFAULT_SERVER_PORT]);

        assert_eq!(main_task.sub_tasks.len(), 2);
        let client = &main_task.sub_tasks[0];
        assert!(client.args.contains(&"--client={{ .ServerAddressV4 }}".to_string()));
        assert!(client.args.contains(&"--time=10".to_string()));
    }

    #[test]
    fn udp_switches_flag_and_ports() {
        let mut test = test_config("iperf3", 1);
        test.iperf3 = Some(crate::config::IPerf3 {
            udp: true,
            ..Default::default()
        });
        let tester = IPerf3::new(&test).unwrap();
        let env = environment(&["s1"], &["c1"]);

        let plan = tester.plan(&env, &test).unwrap();
        let PlanStep::Task(main_task) = &plan.commands[0][0] else {
            panic!("first step must be the server task");
        };
        assert!(main_task.args.contains(&"--udp".to_string()));
        assert_eq!(main_task.ports.udp, vec![DEFAULT_SERVER_PORT]);
        assert!(main_task.ports.tcp.is_empty());
        assert!(main_task.sub_tasks[0].args.contains(&"--udp".to_string()));
    }

    #[test]
    fn additional_flags_are_appended() {
        let mut test = test_config("iperf3", 1);
        test.iperf3 = Some(crate::config::IPerf3 {
            additional_flags: crate::config::AdditionalFlags {
                server: vec!["--one-off".into()],
                clients: vec!["--reverse".into()],
            },
            ..Default::default()
        });
        let tester = IPerf3::new(&test).unwrap();
        let env = environment(&["s1"], &["c1"]);

        let plan = tester.plan(&env, &test).unwrap();
        let PlanStep::Task(main_task) = &plan.commands[0][0] else {
            panic!("first step must be the server task");
        };
        assert_eq!(main_task.args.last().unwrap(), "--one-off");
        assert_eq!(main_task.sub_tasks[0].args.last().unwrap(), "--reverse");
    }

    #[test]
    fn planning_twice_is_structurally_equal() {
        let test = test_config("iperf3", 2);
        let tester = IPerf3::new(&test).unwrap();
        let env = environment(&["s1", "s2"], &["c1"]);

        let a = tester.plan(&env, &test).unwrap();
        let b = tester.plan(&env, &test).unwrap();

        assert_eq!(a.commands.len(), b.commands.len());
        for (ra, rb) in a.commands.iter().zip(&b.commands) {
            assert_eq!(ra.len(), rb.len());
            for (sa, sb) in ra.iter().zip(rb) {
                match (sa, sb) {
                    (PlanStep::Task(ta), PlanStep::Task(tb)) => {
                        assert_eq!(ta.host.name, tb.host.name);
                        assert_eq!(ta.command, tb.command);
                        assert_eq!(ta.args, tb.args);
                        assert_eq!(ta.sub_tasks.len(), tb.sub_tasks.len());
                    }
                    (PlanStep::Sleep(da), PlanStep::Sleep(db)) => assert_eq!(da, db),
                    _ => panic!("plans diverged structurally"),
                }
            }
        }
    }
}
