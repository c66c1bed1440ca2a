//! End-to-end pipeline runs over the mock substrate.

use std::collections::HashSet;
use std::time::Duration;

use ancientt::cancel::CancelToken;
use ancientt::config::{Config, FilePath, OutputConfig, Test};
use ancientt::models::{Host, Payload};
use ancientt::pipeline::{run_config, run_test};
use ancientt::runners::mock::{MockBehavior, MockEvent, MockRunner};
use ancientt::runners::Runner;
use ancientt::Registry;
use tokio::sync::mpsc;

fn universe() -> Vec<Host> {
    ["s1", "c1", "c2"]
        .iter()
        .map(|name| {
            let mut host = Host::new(*name);
            host.addresses.ipv4 = vec!["192.0.2.1".into()];
            host
        })
        .collect()
}

fn test_definition(rounds: usize, mode: &str) -> Test {
    let raw = format!(
        r#"
type: iperf3
runOptions:
  rounds: {rounds}
  mode: {mode}
hosts:
  servers:
    - name: s1
  clients:
    - name: c1
    - name: c2
"#
    );
    serde_yaml::from_str(&raw).unwrap()
}

fn csv_output(dir: &std::path::Path) -> OutputConfig {
    OutputConfig {
        name: "csv".into(),
        csv: Some(FilePath {
            file_path: dir.to_string_lossy().into_owned(),
            name_pattern: String::new(),
        }),
        sqlite: None,
        dump: None,
    }
}

/// Sequential happy path: 2 rounds x 1 server x 2 clients.
#[tokio::test]
async fn mock_happy_path_counts_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let mut test = test_definition(2, "sequential");
    test.outputs = vec![csv_output(dir.path())];

    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), MockBehavior::default());

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();

    assert!(report.execution_error.is_none());
    assert_eq!(report.rounds.len(), 2);
    for entry in &report.rounds {
        assert_eq!(entry.server, "s1");
        assert_eq!(entry.status.successful.servers.get("s1"), Some(&1));
        assert_eq!(entry.status.successful.clients.get("c1"), Some(&1));
        assert_eq!(entry.status.successful.clients.get("c2"), Some(&1));
        assert!(entry.status.failed.servers.is_empty());
        assert!(entry.status.failed.clients.is_empty());
    }

    // 2 pair files plus the parser's aggregate summary frame.
    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files.len(), 3);
    assert!(files.iter().any(|f| f.ends_with("-iperf3-s1_c1.csv")));
    assert!(files.iter().any(|f| f.ends_with("-iperf3-s1_c2.csv")));
    assert!(files.iter().any(|f| f.ends_with("-iperf3-all_all.csv")));

    // Each pair file: header + 2 rounds x 2 intervals.
    let pair_file = files.iter().find(|f| f.ends_with("s1_c1.csv")).unwrap();
    let content = std::fs::read_to_string(dir.path().join(pair_file)).unwrap();
    assert_eq!(content.lines().count(), 5);
}

/// The runner emits exactly one frame per client run, with that round's
/// index and the client/server names attached.
#[tokio::test]
async fn one_frame_per_client_run() {
    let test = test_definition(2, "sequential");
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), MockBehavior::default());

    let env = runner.get_hosts_for_test(&test).await.unwrap();
    let tester = registry.tester("iperf3", &test).unwrap();
    let plan = tester.plan(&env, &test).unwrap();

    let (in_tx, mut in_rx) = mpsc::channel(16);
    runner.prepare(&test.run_options, &plan).await.unwrap();
    runner
        .execute(&plan, in_tx, CancelToken::never())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(input) = in_rx.recv().await {
        assert_eq!(input.server_host, "s1");
        assert_eq!(input.tester, "iperf3");
        assert_eq!(input.test_start_time, plan.test_start_time);
        match &input.payload {
            Payload::Bytes(bytes) => assert!(!bytes.is_empty()),
            Payload::Stream(_) => panic!("mock default payload is buffered"),
        }
        seen.push((input.round, input.client_host.clone()));
    }

    let expected: HashSet<(usize, String)> = [
        (0, "c1".to_string()),
        (0, "c2".to_string()),
        (1, "c1".to_string()),
        (1, "c2".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
}

/// Parallel mode: both clients run between server readiness and server
/// shutdown, and every ordering guarantee of the round state machine
/// holds.
#[tokio::test]
async fn parallel_clients_run_inside_the_server_lifetime() {
    let mut test = test_definition(2, "parallel");
    test.outputs = Vec::new();

    let behavior = MockBehavior {
        client_delay: Duration::from_millis(30),
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);
    let events = runner.events();

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();
    for entry in &report.rounds {
        assert_eq!(entry.status.successful.clients.len(), 2);
        assert!(entry.status.failed.clients.is_empty());
    }

    let events = events.lock().unwrap();
    for round in 0..2 {
        let ready_at = events
            .iter()
            .find_map(|e| match e {
                MockEvent::ServerReady { round: r, at, .. } if *r == round => Some(*at),
                _ => None,
            })
            .expect("server became ready");
        let stopped_at = events
            .iter()
            .find_map(|e| match e {
                MockEvent::ServerStopped { round: r, at, .. } if *r == round => Some(*at),
                _ => None,
            })
            .expect("server was stopped");

        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MockEvent::ClientStarted { round: r, at, .. } if *r == round => Some(*at),
                _ => None,
            })
            .collect();
        let finishes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MockEvent::ClientFinished { round: r, at, .. } if *r == round => Some(*at),
                _ => None,
            })
            .collect();

        assert_eq!(starts.len(), 2);
        assert!(starts.iter().all(|start| *start >= ready_at));
        assert!(starts.iter().all(|start| *start <= stopped_at));
        assert!(finishes.iter().all(|finish| *finish <= stopped_at));
    }
}

/// Round 1's server fails to launch; with continueOnError the remaining
/// rounds still run and the failure is recorded.
#[tokio::test]
async fn continue_on_error_runs_remaining_rounds() {
    let mut test = test_definition(3, "sequential");
    test.run_options.continue_on_error = true;

    let mut behavior = MockBehavior {
        probe_retries: 1,
        ..Default::default()
    };
    behavior
        .server_launch_failures
        .insert((0, "s1".to_string()));

    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();
    assert!(report.execution_error.is_none());
    assert_eq!(report.rounds.len(), 3);

    let failed: u32 = report
        .rounds
        .iter()
        .map(|r| r.status.failed.servers.get("s1").copied().unwrap_or(0))
        .sum();
    let successful: u32 = report
        .rounds
        .iter()
        .map(|r| r.status.successful.servers.get("s1").copied().unwrap_or(0))
        .sum();
    assert!(failed >= 1);
    assert_eq!(successful, 2);

    // The failed round recorded its error verbatim.
    let errors = &report.rounds[0].status.errors["s1"];
    assert!(errors.iter().any(|e| e.contains("not running") || e.contains("failed to launch")));
}

/// Without continueOnError the first failing round aborts execution.
#[tokio::test]
async fn first_failure_aborts_without_continue_on_error() {
    let test = test_definition(3, "sequential");

    let mut behavior = MockBehavior {
        probe_retries: 1,
        ..Default::default()
    };
    behavior
        .server_launch_failures
        .insert((0, "s1".to_string()));

    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();
    assert!(report.execution_error.is_some());

    let successful: u32 = report
        .rounds
        .iter()
        .map(|r| r.status.successful.servers.get("s1").copied().unwrap_or(0))
        .sum();
    assert_eq!(successful, 0);
}

/// The server only becomes ready on the third probe; clients still run
/// and nothing is recorded as failed.
#[tokio::test]
async fn readiness_retry_eventually_succeeds() {
    let mut test = test_definition(1, "sequential");
    test.outputs = Vec::new();

    let behavior = MockBehavior {
        ready_after_probes: 3,
        probe_retries: 5,
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);
    let events = runner.events();

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();

    let entry = &report.rounds[0];
    assert!(entry.status.failed.servers.is_empty());
    assert!(entry.status.failed.clients.is_empty());
    assert_eq!(entry.status.successful.clients.len(), 2);

    // Server lifetime covers every client run.
    let events = events.lock().unwrap();
    let stopped_at = events
        .iter()
        .find_map(|e| match e {
            MockEvent::ServerStopped { at, .. } => Some(*at),
            _ => None,
        })
        .unwrap();
    assert!(events
        .iter()
        .filter_map(|e| match e {
            MockEvent::ClientFinished { at, .. } => Some(*at),
            _ => None,
        })
        .all(|finish| finish <= stopped_at));
}

/// Exhausted readiness probes fail the round's server.
#[tokio::test]
async fn readiness_exhaustion_fails_the_server() {
    let mut test = test_definition(1, "sequential");
    test.run_options.continue_on_error = true;

    let behavior = MockBehavior {
        ready_after_probes: 10,
        probe_retries: 2,
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();

    let entry = &report.rounds[0];
    assert_eq!(entry.status.failed.servers.get("s1"), Some(&1));
    assert!(entry.status.successful.clients.is_empty());
}

/// Server errors raised strictly after the cancellation are suppressed
/// and never reach the status counters.
#[tokio::test]
async fn server_errors_after_cancellation_are_suppressed() {
    let mut test = test_definition(2, "sequential");
    test.outputs = Vec::new();

    let behavior = MockBehavior {
        server_error_on_stop: true,
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();

    assert!(report.execution_error.is_none());
    for entry in &report.rounds {
        assert!(entry.status.failed.servers.is_empty());
        assert_eq!(entry.status.successful.servers.get("s1"), Some(&1));
        assert!(entry.status.errors.is_empty());
    }
}

/// parallelCount=1 serializes the fan-out even in parallel mode.
#[tokio::test]
async fn parallel_count_caps_concurrency() {
    let mut test = test_definition(1, "parallel");
    test.run_options.parallel_count = 1;

    let behavior = MockBehavior {
        client_delay: Duration::from_millis(30),
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);
    let events = runner.events();

    run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();

    let events = events.lock().unwrap();
    let mut in_flight: i32 = 0;
    let mut max_in_flight = 0;
    for event in events.iter() {
        match event {
            MockEvent::ClientStarted { .. } => {
                in_flight += 1;
                max_in_flight = max_in_flight.max(in_flight);
            }
            MockEvent::ClientFinished { .. } => in_flight -= 1,
            _ => {}
        }
    }
    assert_eq!(max_in_flight, 1);
}

/// Streamed payloads flow through the parser just like buffered ones.
#[tokio::test]
async fn streamed_payloads_are_parsed_and_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut test = test_definition(1, "sequential");
    test.outputs = vec![csv_output(dir.path())];

    let behavior = MockBehavior {
        stream_payloads: true,
        ..Default::default()
    };
    let registry = Registry::with_defaults();
    let mut runner = MockRunner::with_behavior(universe(), behavior);

    let report = run_test(&test, &mut runner, &registry, CancelToken::never())
        .await
        .unwrap();
    assert!(report.rounds[0].status.failed.clients.is_empty());

    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 3);
}

/// Whole-config run through the registry-built mock runner.
#[tokio::test]
async fn run_config_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        r#"
runner:
  name: mock
  mock:
    hosts:
      - name: s1
        addresses:
          ipv4: ["192.0.2.1"]
      - name: c1
        addresses:
          ipv4: ["192.0.2.2"]
tests:
  - type: iperf3
    runOptions:
      rounds: 1
    hosts:
      servers: [{{name: s1}}]
      clients: [{{all: true}}]
    outputs:
      - name: dump
        dump:
          filePath: {}
"#,
        dir.path().display()
    );
    let config: Config = serde_yaml::from_str(&raw).unwrap();
    config.validate().unwrap();

    let registry = Registry::with_defaults();
    let report = run_config(&config, &registry, CancelToken::never())
        .await
        .unwrap();

    assert!(!report.failed());
    assert_eq!(report.tests.len(), 1);
    assert!(std::fs::read_dir(dir.path()).unwrap().count() >= 2);

    // Unknown runner names are configuration errors.
    let mut bad = config.clone();
    bad.runner.name = "kubernetes".into();
    assert!(run_config(&bad, &registry, CancelToken::never())
        .await
        .is_err());
}
