//! Per-test orchestration: wire tester, runner, parser and outputs into a
//! pipeline over channels, then aggregate the recorded status.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::config::{Config, Test};
use crate::models::{Data, Input, Plan, PlanStep, StatusSnapshot};
use crate::registry::Registry;
use crate::runners::Runner;

const CHANNEL_CAPACITY: usize = 100;

/// Status of one round's server task after execution
#[derive(Debug, Clone)]
pub struct RoundStatus {
    pub round: usize,
    pub server: String,
    pub status: StatusSnapshot,
}

/// Everything observed while running one configured test
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub name: String,
    pub tester: String,
    pub rounds: Vec<RoundStatus>,
    /// Fatal error that prevented (or aborted) the pipeline
    pub error: Option<String>,
    /// Non-fatal early return from the runner, failures are in `rounds`
    pub execution_error: Option<String>,
}

impl TestReport {
    pub fn log(&self) {
        for entry in &self.rounds {
            let s = &entry.status;
            tracing::info!(
                test = %self.name,
                round = entry.round,
                server = %entry.server,
                successful_servers = s.successful.servers.values().sum::<u32>(),
                failed_servers = s.failed.servers.values().sum::<u32>(),
                successful_clients = s.successful.clients.values().sum::<u32>(),
                failed_clients = s.failed.clients.values().sum::<u32>(),
                "round status"
            );
            for (host, errors) in &s.errors {
                for error in errors {
                    tracing::warn!(test = %self.name, host = %host, error = %error, "recorded failure");
                }
            }
        }
        if let Some(error) = &self.execution_error {
            tracing::warn!(test = %self.name, error = %error, "runner returned early");
        }
        if let Some(error) = &self.error {
            tracing::error!(test = %self.name, error = %error, "test failed");
        }
    }
}

/// Outcome of a whole configuration run
#[derive(Debug, Default)]
pub struct RunReport {
    pub tests: Vec<TestReport>,
}

impl RunReport {
    /// True when any test hit a fatal error
    pub fn failed(&self) -> bool {
        self.tests.iter().any(|t| t.error.is_some())
    }
}

/// Run every configured test. A fatal per-test error aborts the run
/// unless the top-level `continueOnError` is set.
pub async fn run_config(
    config: &Config,
    registry: &Registry,
    cancel: CancelToken,
) -> Result<RunReport> {
    let mut report = RunReport::default();

    for test in &config.tests {
        if cancel.is_cancelled() {
            tracing::warn!("aborting remaining tests");
            break;
        }
        tracing::info!(test = %test.display_name(), "starting test");

        let mut runner = registry
            .runner(&config.runner.name, config)
            .context("failed to construct runner")?;

        match run_test(test, runner.as_mut(), registry, cancel.clone()).await {
            Ok(test_report) => report.tests.push(test_report),
            Err(err) => {
                if !config.continue_on_error {
                    return Err(err);
                }
                tracing::error!(
                    test = %test.display_name(),
                    error = format!("{err:#}"),
                    "continuing with next test after error"
                );
                report.tests.push(TestReport {
                    name: test.display_name().to_string(),
                    tester: test.test_type.clone(),
                    error: Some(format!("{err:#}")),
                    ..Default::default()
                });
            }
        }
    }

    Ok(report)
}

/// Run a single test against an already constructed runner.
///
/// Errors are fatal (discovery, planning, component resolution, prepare);
/// plan-execution failures land in the report's status counters instead.
pub async fn run_test(
    test: &Test,
    runner: &mut dyn Runner,
    registry: &Registry,
    cancel: CancelToken,
) -> Result<TestReport> {
    let env = runner
        .get_hosts_for_test(test)
        .await
        .context("host discovery failed")?;
    tracing::info!(
        servers = env.servers.len(),
        clients = env.clients.len(),
        "discovered hosts"
    );

    let tester = registry.tester(&test.test_type, test)?;
    let plan = tester.plan(&env, test).context("planning failed")?;

    let parser = registry.parser(&test.test_type, test)?;
    let mut outputs = Vec::with_capacity(test.outputs.len());
    for out_cfg in &test.outputs {
        outputs.push((
            out_cfg.name.clone(),
            registry.output(&out_cfg.name, out_cfg)?,
        ));
    }

    let (in_tx, in_rx) = mpsc::channel::<Input>(CHANNEL_CAPACITY);
    let (data_tx, mut data_rx) = mpsc::channel::<Data>(CHANNEL_CAPACITY);

    // Parser consumer: drains frames until the input channel closes, then
    // emits the optional summary. Dropping its senders closes the data
    // channel.
    let parser_handle: JoinHandle<Result<()>> = tokio::spawn({
        let done = cancel.clone();
        async move {
            let summary_tx = data_tx.clone();
            parser.parse(done, in_rx, data_tx).await?;
            parser.summary(summary_tx).await?;
            Ok(())
        }
    });

    // One consumer per output; the fan-out task clones every frame to
    // each of them.
    let mut out_txs = Vec::with_capacity(outputs.len());
    let mut out_handles = Vec::with_capacity(outputs.len());
    for (name, output) in outputs {
        let (tx, mut rx) = mpsc::channel::<Data>(CHANNEL_CAPACITY);
        out_txs.push(tx);
        out_handles.push(tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(err) = output.write(&data).await {
                    tracing::error!(
                        output = %name,
                        error = format!("{err:#}"),
                        "output failed to persist frame"
                    );
                }
            }
            if let Err(err) = output.close().await {
                tracing::error!(output = %name, error = format!("{err:#}"), "output failed to close");
            }
        }));
    }

    let fanout_handle = tokio::spawn(async move {
        while let Some(data) = data_rx.recv().await {
            for tx in &out_txs {
                let _ = tx.send(data.clone()).await;
            }
        }
    });

    // A prepare failure means the plan never ran, which is fatal for the
    // test; an early return out of execute only shortens the run and its
    // failures are already in the status counters.
    let mut prepare_error = None;
    let mut execution_error = None;
    match runner
        .prepare(&test.run_options, &plan)
        .await
        .context("runner prepare failed")
    {
        Ok(()) => {
            if let Err(err) = runner.execute(&plan, in_tx, cancel.clone()).await {
                execution_error = Some(format!("{err:#}"));
            }
        }
        Err(err) => {
            drop(in_tx);
            prepare_error = Some(err);
        }
    }

    // Input channel is closed now; wait for the stages to drain in order.
    match parser_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = format!("{err:#}"), "parser failed"),
        Err(err) => tracing::error!(error = %err, "parser task panicked"),
    }
    let _ = fanout_handle.await;
    for handle in out_handles {
        let _ = handle.await;
    }

    if let Err(err) = runner.cleanup(&plan).await {
        tracing::error!(error = format!("{err:#}"), "runner cleanup failed");
    }

    if let Some(err) = prepare_error {
        return Err(err);
    }

    Ok(TestReport {
        name: test.display_name().to_string(),
        tester: test.test_type.clone(),
        rounds: collect_round_statuses(&plan),
        error: None,
        execution_error,
    })
}

fn collect_round_statuses(plan: &Plan) -> Vec<RoundStatus> {
    let mut rounds = Vec::new();
    for (round, steps) in plan.commands.iter().enumerate() {
        for step in steps {
            if let PlanStep::Task(task) = step {
                rounds.push(RoundStatus {
                    round,
                    server: task.host.name.clone(),
                    status: task.status().snapshot(),
                });
            }
        }
    }
    rounds
}
