//! Execution substrates and the per-round state machine shared by all of
//! them: launch the server task, probe it for readiness, fan out the
//! client tasks, then cancel the server.

pub mod ansible;
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};

use crate::cancel::{self, CancelToken};
use crate::config::{RunMode, RunOptions, Test};
use crate::models::{Environment, Input, Payload, Plan, PlanStep, Status, Task};
use crate::template::{template_task, CommandVars};
use crate::testers::DEFAULT_SERVER_PORT;

/// A runner executes a [`Plan`] on one substrate. The orchestrator calls
/// the operations in order and always calls `cleanup`, even on failure.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Discover the substrate's hosts and apply the test's selection
    /// predicates
    async fn get_hosts_for_test(&self, test: &Test) -> Result<Environment>;

    /// One-time setup before execution
    async fn prepare(&mut self, run_opts: &RunOptions, plan: &Plan) -> Result<()>;

    /// Run the plan, emitting one [`Input`] frame per client task that
    /// produced output
    async fn execute(
        &self,
        plan: &Plan,
        parser_tx: mpsc::Sender<Input>,
        cancel: CancelToken,
    ) -> Result<()>;

    /// Remove whatever the runner left behind on the substrate
    async fn cleanup(&self, plan: &Plan) -> Result<()>;
}

/// The substrate-specific operations of one round. The surrounding state
/// machine (readiness probing, fan-out, server shutdown, status
/// bookkeeping) lives in [`drive_plan`] and is identical for every
/// substrate.
#[async_trait]
pub(crate) trait RoundSubstrate: Send + Sync {
    /// Run the server task until it exits or `cancel` fires
    async fn run_server(&self, round: usize, task: &Task, cancel: CancelToken) -> Result<()>;

    /// One readiness probe attempt against the server task
    async fn probe_server(&self, round: usize, task: &Task, cancel: CancelToken) -> Result<()>;

    /// Run one client task to completion and return its raw output
    async fn run_client(&self, round: usize, task: &Task, cancel: CancelToken) -> Result<Payload>;

    /// Readiness probe attempts before the server task counts as failed
    fn probe_retries(&self) -> u32;

    /// Delay between readiness probe attempts
    fn probe_spacing(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// Grace period between launching the server task and the first probe
    fn launch_grace(&self) -> Duration {
        Duration::from_millis(250)
    }

    /// Free-form context attached to every emitted frame
    fn additional_info(&self) -> String {
        String::new()
    }
}

/// Walk the plan round by round: sleep steps delay, server tasks run the
/// round state machine. A failed round aborts unless `continueOnError`.
pub(crate) async fn drive_plan(
    substrate: Arc<dyn RoundSubstrate>,
    plan: &Plan,
    run_opts: &RunOptions,
    parser_tx: &mpsc::Sender<Input>,
    cancel: &CancelToken,
) -> Result<()> {
    let rounds = plan.commands.len();
    for (round, steps) in plan.commands.iter().enumerate() {
        tracing::info!(round = round + 1, rounds, "running commands round");
        for step in steps {
            if cancel.is_cancelled() {
                bail!("execution cancelled");
            }
            match step {
                PlanStep::Sleep(delay) => {
                    tracing::info!(?delay, "waiting before continuing with the next round");
                    tokio::select! {
                        _ = tokio::time::sleep(*delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                PlanStep::Task(main_task) => {
                    let result = run_round_task(
                        substrate.clone(),
                        plan,
                        round,
                        main_task,
                        run_opts,
                        parser_tx,
                        cancel,
                    )
                    .await;
                    if let Err(err) = result {
                        if !run_opts.continue_on_error {
                            return Err(err);
                        }
                        tracing::warn!(error = format!("{err:#}"), "continuing after error");
                    }
                }
            }
        }
    }
    Ok(())
}

/// One server task's lifecycle:
///
/// ```text
/// launch server (background) -> readiness probe (bounded retries)
///   -> fan out clients (sequential or parallel, capped by parallelCount)
///   -> cancel server
/// ```
///
/// Server errors strictly after the cancellation are suppressed via the
/// `stopped` flag, which is always set before the cancel fires.
async fn run_round_task(
    substrate: Arc<dyn RoundSubstrate>,
    plan: &Plan,
    round: usize,
    main_task: &Task,
    run_opts: &RunOptions,
    parser_tx: &mpsc::Sender<Input>,
    cancel: &CancelToken,
) -> Result<()> {
    let status = main_task.status().clone();

    let mut vars = CommandVars {
        server_port: DEFAULT_SERVER_PORT,
        ..Default::default()
    };
    if let Some(v4) = main_task.host.default_ipv4() {
        vars.server_address_v4 = v4.to_string();
    }
    if let Some(v6) = main_task.host.default_ipv6() {
        vars.server_address_v6 = v6.to_string();
    }

    let mut templated_main = main_task.clone();
    templated_main.sub_tasks.clear();
    if let Err(err) = template_task(&mut templated_main, &vars) {
        let err = err.context("failed to template main task command and/or args");
        status.add_failed_server(&main_task.host, &err);
        return Err(err);
    }

    let stopped = Arc::new(AtomicBool::new(false));
    let (main_cancel, main_token) = cancel::channel();

    let server_handle = tokio::spawn({
        let substrate = substrate.clone();
        let status = status.clone();
        let stopped = stopped.clone();
        let task = templated_main.clone();
        async move {
            if let Err(err) = substrate.run_server(round, &task, main_token).await {
                if stopped.load(Ordering::SeqCst) {
                    tracing::debug!(
                        error = format!("{err:#}"),
                        "ignored error after main task was stopped"
                    );
                } else {
                    tracing::error!(
                        host = %task.host.name,
                        error = format!("{err:#}"),
                        "error during main task run"
                    );
                    status.add_failed_server(&task.host, &err);
                }
            }
        }
    });

    tokio::time::sleep(substrate.launch_grace()).await;

    let mut ready = false;
    let tries = substrate.probe_retries();
    for attempt in 0..=tries {
        if cancel.is_cancelled() {
            break;
        }
        match substrate
            .probe_server(round, &templated_main, cancel.clone())
            .await
        {
            Ok(()) => {
                ready = true;
                break;
            }
            Err(err) => {
                tracing::info!(
                    attempt,
                    tries,
                    error = format!("{err:#}"),
                    "main task not running yet, retrying"
                );
                if attempt != tries {
                    tokio::select! {
                        _ = tokio::time::sleep(substrate.probe_spacing()) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    if !ready {
        let err = anyhow!("main test task is not running");
        status.add_failed_server(&main_task.host, &err);
        stopped.store(true, Ordering::SeqCst);
        main_cancel.cancel();
        let _ = server_handle.await;
        return Err(err);
    }

    let semaphore = (run_opts.parallel_count > 0)
        .then(|| Arc::new(Semaphore::new(run_opts.parallel_count)));

    let ctx = ClientCtx {
        substrate: substrate.clone(),
        round,
        test_start_time: plan.test_start_time,
        tester: plan.tester.clone(),
        server_host: main_task.host.name.clone(),
        status: status.clone(),
        vars,
        semaphore,
        parser_tx: parser_tx.clone(),
        cancel: cancel.clone(),
    };

    match run_opts.mode {
        RunMode::Sequential => {
            for (i, sub_task) in main_task.sub_tasks.iter().enumerate() {
                tracing::info!(
                    sub_task = i + 1,
                    of = main_task.sub_tasks.len(),
                    host = %sub_task.host.name,
                    "running sub task"
                );
                run_one_client(ctx.clone(), sub_task.clone()).await;
            }
        }
        RunMode::Parallel => {
            let mut handles = Vec::with_capacity(main_task.sub_tasks.len());
            for (i, sub_task) in main_task.sub_tasks.iter().enumerate() {
                tracing::info!(
                    sub_task = i + 1,
                    of = main_task.sub_tasks.len(),
                    host = %sub_task.host.name,
                    "running sub task"
                );
                handles.push(tokio::spawn(run_one_client(ctx.clone(), sub_task.clone())));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    status.add_successful_server(&main_task.host);
    stopped.store(true, Ordering::SeqCst);

    tracing::info!(host = %main_task.host.name, "stopping main task");
    main_cancel.cancel();
    let _ = server_handle.await;

    tracing::debug!("done running tasks for round");
    Ok(())
}

#[derive(Clone)]
struct ClientCtx {
    substrate: Arc<dyn RoundSubstrate>,
    round: usize,
    test_start_time: DateTime<Utc>,
    tester: String,
    server_host: String,
    status: Arc<Status>,
    vars: CommandVars,
    semaphore: Option<Arc<Semaphore>>,
    parser_tx: mpsc::Sender<Input>,
    cancel: CancelToken,
}

/// Template, run and record one client task. Emits exactly one frame when
/// the task produced output; a task that fails to start produces none.
async fn run_one_client(ctx: ClientCtx, sub_task: Task) {
    let _permit = match &ctx.semaphore {
        Some(semaphore) => match semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return,
        },
        None => None,
    };

    let mut task = sub_task.clone();
    if let Err(err) = template_task(&mut task, &ctx.vars) {
        let err = err.context("failed to template task command and/or args");
        tracing::error!(host = %sub_task.host.name, error = format!("{err:#}"), "client task failed");
        ctx.status.add_failed_client(&sub_task.host, &err);
        return;
    }

    let test_time = Utc::now();
    match ctx
        .substrate
        .run_client(ctx.round, &task, ctx.cancel.clone())
        .await
    {
        Ok(payload) => {
            ctx.status.add_successful_client(&task.host);
            let input = Input {
                test_start_time: ctx.test_start_time,
                test_time,
                round: ctx.round,
                payload,
                tester: ctx.tester.clone(),
                server_host: ctx.server_host.clone(),
                client_host: task.host.name.clone(),
                additional_info: ctx.substrate.additional_info(),
            };
            if ctx.parser_tx.send(input).await.is_err() {
                tracing::error!(host = %task.host.name, "parser channel closed, dropping frame");
            }
        }
        Err(err) => {
            tracing::error!(host = %task.host.name, error = format!("{err:#}"), "client task failed");
            ctx.status.add_failed_client(&task.host, &err);
        }
    }
}
