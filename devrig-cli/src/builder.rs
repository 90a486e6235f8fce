//! Workspace build steps, run before tasks start or restart.
//!
//! Each step is a `sh -ec` invocation in the workspace root; output lines
//! go to the status pipe so the TUI can show build progress. A non-zero
//! step fails the build and the commander aborts the lifecycle operation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as OsCommand;

use devrig_core::cancel::CancelToken;
use devrig_core::commander::Builder;
use devrig_core::error::{Result, RigError};
use devrig_core::pipe::PipeWriter;

pub struct ShellBuilder {
    steps: Vec<String>,
    dir: PathBuf,
    status: PipeWriter,
    cancel: CancelToken,
}

impl ShellBuilder {
    pub fn new(
        steps: Vec<String>,
        dir: impl Into<PathBuf>,
        status: PipeWriter,
        cancel: CancelToken,
    ) -> Self {
        Self {
            steps,
            dir: dir.into(),
            status,
            cancel,
        }
    }

    async fn run_step(&self, step: &str) -> Result<()> {
        let mut cmd = OsCommand::new("sh");
        cmd.arg("-ec")
            .arg(step)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|error| RigError::BuildFailure(format!("{step:?}: {error}")))?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let status = self.status.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    status.send_line(&line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let status = self.status.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    status.send_line(&line);
                }
            }));
        }

        let exit = tokio::select! {
            exit = child.wait() => exit,
            _ = self.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                for pump in pumps {
                    pump.abort();
                }
                return Err(RigError::BuildFailure("interrupted".into()));
            }
        };
        for pump in pumps {
            let _ = pump.await;
        }

        match exit {
            Ok(exit) if exit.success() => Ok(()),
            Ok(exit) => Err(RigError::BuildFailure(format!("{step:?}: {exit}"))),
            Err(error) => Err(RigError::BuildFailure(format!("{step:?}: {error}"))),
        }
    }
}

#[async_trait]
impl Builder for ShellBuilder {
    async fn build(&self) -> Result<()> {
        for step in &self.steps {
            if self.cancel.is_cancelled() {
                return Err(RigError::BuildFailure("interrupted".into()));
            }
            self.status.send_line(&format!("$ {step}"));
            self.run_step(step).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::io::Lines;

    use devrig_core::cancel::{cancel_pair, CancelHandle};
    use devrig_core::pipe::{pipe, PipeReader};

    fn builder_with(steps: &[&str]) -> (ShellBuilder, Lines<BufReader<PipeReader>>, CancelHandle) {
        let (handle, token) = cancel_pair();
        let (tx, rx) = pipe();
        let steps = steps.iter().map(|s| s.to_string()).collect();
        let builder = ShellBuilder::new(steps, std::env::temp_dir(), tx, token);
        (builder, BufReader::new(rx).lines(), handle)
    }

    async fn next_line(lines: &mut Lines<BufReader<PipeReader>>) -> String {
        tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("line did not arrive")
            .expect("stream error")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_echo_into_status() {
        let (builder, mut lines, _keep) = builder_with(&["echo one", "echo two"]);
        builder.build().await.unwrap();
        for expected in ["$ echo one", "one", "$ echo two", "two"] {
            assert_eq!(next_line(&mut lines).await, expected);
        }
    }

    #[tokio::test]
    async fn test_failing_step_aborts_the_rest() {
        let (builder, mut lines, _keep) = builder_with(&["echo a", "exit 3", "echo never"]);
        let err = builder.build().await.unwrap_err();
        assert!(matches!(err, RigError::BuildFailure(_)));
        for expected in ["$ echo a", "a", "$ exit 3"] {
            assert_eq!(next_line(&mut lines).await, expected);
        }
        // The third step never printed its banner.
        drop(builder);
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stderr_is_captured_too() {
        let (builder, mut lines, _keep) = builder_with(&["echo oops >&2"]);
        builder.build().await.unwrap();
        assert_eq!(next_line(&mut lines).await, "$ echo oops >&2");
        assert_eq!(next_line(&mut lines).await, "oops");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_a_long_step() {
        let (builder, _lines, handle) = builder_with(&["sleep 30"]);
        let started = Instant::now();
        let task = tokio::spawn(async move { builder.build().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RigError::BuildFailure(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
