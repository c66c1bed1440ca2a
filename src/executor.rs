//! Subprocess execution with timeout and cancellation handling.
//!
//! Every command runs in its own process group so that a stubborn server
//! process (and anything it forked) can be taken down with one signal.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::cancel::CancelToken;

/// Deadline and cancellation for a single command invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Hard deadline; expiry kills the process group
    pub timeout: Option<Duration>,
    /// External cancellation; firing kills the process group
    pub cancel: Option<CancelToken>,
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        ExecOpts {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        ExecOpts {
            timeout: None,
            cancel: Some(cancel),
        }
    }
}

/// Command execution seam between runners and the operating system.
/// Swapped for a mock in runner tests.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command to completion, discarding its output
    async fn execute(&self, action: &str, command: &str, args: &[String], opts: ExecOpts)
        -> Result<()>;

    /// Run a command to completion and capture its combined output
    async fn execute_with_output(
        &self,
        action: &str,
        command: &str,
        args: &[String],
        opts: ExecOpts,
    ) -> Result<Vec<u8>>;
}

/// [`Executor`] backed by real subprocesses
pub struct CommandExecutor {
    scope: &'static str,
}

impl CommandExecutor {
    pub fn new(scope: &'static str) -> Self {
        CommandExecutor { scope }
    }

    async fn run(
        &self,
        action: &str,
        command: &str,
        args: &[String],
        opts: ExecOpts,
        capture: bool,
    ) -> Result<Vec<u8>> {
        tracing::info!(
            scope = self.scope,
            action,
            command,
            ?args,
            "executing command"
        );

        let mut cmd = Command::new(command);
        cmd.args(args).stdin(Stdio::null());
        if capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {command}"))?;
        let pid = child.id();

        let reader = if capture {
            let mut stdout = child.stdout.take();
            let mut stderr = child.stderr.take();
            Some(tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(out) = stdout.as_mut() {
                    let _ = out.read_to_end(&mut buf).await;
                }
                if let Some(err) = stderr.as_mut() {
                    let _ = err.read_to_end(&mut buf).await;
                }
                buf
            }))
        } else {
            None
        };

        let status = tokio::select! {
            status = child.wait() => {
                status.with_context(|| format!("failed to wait for {command}"))?
            }
            reason = interrupted(&opts) => {
                kill_process_group(pid);
                let _ = child.wait().await;
                if let Some(reader) = reader {
                    reader.abort();
                }
                bail!("{command} {reason}; process group killed");
            }
        };

        let output = match reader {
            Some(reader) => reader.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            let tail = String::from_utf8_lossy(&output);
            let tail = tail.trim();
            bail!(
                "{command} exited with {status}{}{}",
                if tail.is_empty() { "" } else { ": " },
                tail
            );
        }

        tracing::debug!(scope = self.scope, action, "command finished");
        Ok(output)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        action: &str,
        command: &str,
        args: &[String],
        opts: ExecOpts,
    ) -> Result<()> {
        self.run(action, command, args, opts, false).await.map(|_| ())
    }

    async fn execute_with_output(
        &self,
        action: &str,
        command: &str,
        args: &[String],
        opts: ExecOpts,
    ) -> Result<Vec<u8>> {
        self.run(action, command, args, opts, true).await
    }
}

/// Resolve when either the deadline or the cancellation fires
async fn interrupted(opts: &ExecOpts) -> &'static str {
    let cancelled = async {
        match &opts.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    match opts.timeout {
        Some(timeout) => {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => "timed out",
                _ = cancelled => "was cancelled",
            }
        }
        None => {
            cancelled.await;
            "was cancelled"
        }
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid addresses the whole process group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Test double with injectable behavior per operation, mirroring the
/// real executor's interface.
#[cfg(test)]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    type ExecFn = dyn Fn(&str, &str, &[String]) -> Result<()> + Send + Sync;
    type OutputFn = dyn Fn(&str, &str, &[String]) -> Result<Vec<u8>> + Send + Sync;

    #[derive(Default)]
    pub struct MockExecutor {
        pub on_execute: Option<Box<ExecFn>>,
        pub on_execute_with_output: Option<Box<OutputFn>>,
        /// Every (action, command, args) seen, in call order
        pub calls: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(
            &self,
            action: &str,
            command: &str,
            args: &[String],
            _opts: ExecOpts,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((action.into(), command.into(), args.to_vec()));
            match &self.on_execute {
                Some(hook) => hook(action, command, args),
                None => Ok(()),
            }
        }

        async fn execute_with_output(
            &self,
            action: &str,
            command: &str,
            args: &[String],
            _opts: ExecOpts,
        ) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push((action.into(), command.into(), args.to_vec()));
            match &self.on_execute_with_output {
                Some(hook) => hook(action, command, args),
                None => Ok(Vec::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_command_output() {
        let exec = CommandExecutor::new("test");
        let out = exec
            .execute_with_output(
                "echo",
                "sh",
                &["-c".into(), "printf hello".into()],
                ExecOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_output() {
        let exec = CommandExecutor::new("test");
        let err = exec
            .execute(
                "fail",
                "sh",
                &["-c".into(), "echo boom >&2; exit 3".into()],
                ExecOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let exec = CommandExecutor::new("test");
        let started = std::time::Instant::now();
        let err = exec
            .execute(
                "sleep",
                "sleep",
                &["30".into()],
                ExecOpts::with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let exec = CommandExecutor::new("test");
        let (src, token) = crate::cancel::channel();
        let handle = tokio::spawn(async move {
            exec.execute(
                "sleep",
                "sleep",
                &["30".into()],
                ExecOpts::with_cancel(token),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        src.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
