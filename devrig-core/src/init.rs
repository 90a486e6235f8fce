//! Decorator that interleaves user shell snippets with the lifecycle of a
//! wrapped command.
//!
//! `init_once` runs at most once across the wrapper's lifetime, `init` after
//! every successful start or restart. Scripts run sequentially as
//! `sh -ec <script>` in the wrapper's working directory; output lines land
//! in the wrapper's chatter pipes, which sit in front of the inner command's
//! streams. Init failures never reach start's caller; they show up in the
//! output and the debug log.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as OsCommand;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::command::{Command, DoneSignal, OutputReader};
use crate::error::{Result, RigError};
use crate::lock;
use crate::pipe::{pipe, PipeReader, PipeWriter};

const STOP_DRAIN: Duration = Duration::from_secs(5);
const RESTART_DRAIN: Duration = Duration::from_secs(15);

pub struct InitWrapper {
    inner: Box<dyn Command>,
    init_once: Vec<String>,
    init: Vec<String>,
    dir: PathBuf,
    outer: CancelToken,

    state: Arc<Mutex<InitState>>,
    out_rx: Mutex<Option<PipeReader>>,
    err_rx: Mutex<Option<PipeReader>>,
    done_rx: watch::Receiver<bool>,
}

struct InitState {
    init_running: bool,
    once_done: bool,
    cancel: Option<CancelHandle>,
    /// Fresh per invocation; fires when that invocation has fully wound
    /// down, error or not.
    drained: Option<watch::Receiver<bool>>,
    /// Dropped after the first invocation so chained readers progress to
    /// the inner stream.
    chatter_out: Option<PipeWriter>,
    chatter_err: Option<PipeWriter>,
}

impl InitWrapper {
    pub fn new(
        inner: Box<dyn Command>,
        init_once: Vec<String>,
        init: Vec<String>,
        dir: impl Into<PathBuf>,
        outer: CancelToken,
    ) -> Self {
        let (out_tx, out_rx) = pipe();
        let (err_tx, err_rx) = pipe();
        let (done_tx, done_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(InitState {
            init_running: false,
            once_done: false,
            cancel: None,
            drained: None,
            chatter_out: Some(out_tx),
            chatter_err: Some(err_tx),
        }));

        // The wrapper is done once the inner command is done and the last
        // invocation has drained.
        let inner_done = inner.done();
        {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                inner_done.wait().await;
                let drained = lock(&state).drained.clone();
                if let Some(mut rx) = drained {
                    let _ = rx.wait_for(|gone| *gone).await;
                }
                let _ = done_tx.send(true);
            });
        }

        Self {
            inner,
            init_once,
            init,
            dir: dir.into(),
            outer,
            state,
            out_rx: Mutex::new(Some(out_rx)),
            err_rx: Mutex::new(Some(err_rx)),
            done_rx,
        }
    }

    /// Polls the inner command's running flag at 100 ms until it flips, then
    /// kicks an init invocation. Bails out without init if the inner command
    /// finished during startup or the workspace is going away.
    async fn await_running_then_init(&self) {
        let inner_done = self.inner.done();
        let mut ticker = interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.inner.running() {
                break;
            }
            if inner_done.is_done() || self.outer.is_cancelled() {
                return;
            }
        }
        self.kick_init();
    }

    /// Spawns one invocation: the runner task plus a bridge task wiring the
    /// outer cancel token to it. No-op while an invocation is in flight.
    fn kick_init(&self) {
        let (cancel_handle, cancel_token) = cancel_pair();
        let (drain_tx, drain_rx) = watch::channel(false);
        let (out, err) = {
            let mut st = lock(&self.state);
            if st.init_running {
                return;
            }
            st.init_running = true;
            st.cancel = Some(cancel_handle.clone());
            st.drained = Some(drain_rx.clone());
            (st.chatter_out.clone(), st.chatter_err.clone())
        };
        let out = out.unwrap_or_else(dead_writer);
        let err = err.unwrap_or_else(dead_writer);

        {
            // The bridge leaves with the drain so none accumulate across
            // restarts.
            let outer = self.outer.clone();
            let mut drained = drain_rx;
            tokio::spawn(async move {
                tokio::select! {
                    _ = outer.cancelled() => cancel_handle.cancel(),
                    _ = drained.wait_for(|gone| *gone) => {}
                }
            });
        }

        let state = Arc::clone(&self.state);
        let name = self.inner.name().to_string();
        let dir = self.dir.clone();
        let once_scripts = self.init_once.clone();
        let every_scripts = self.init.clone();
        tokio::spawn(async move {
            // The once-guard is consumed the moment an invocation reaches
            // it; a cancelled invocation that never got here leaves it
            // armed.
            let run_once = {
                let mut st = lock(&state);
                if st.once_done {
                    false
                } else {
                    st.once_done = true;
                    true
                }
            };

            let mut result = Ok(());
            if run_once {
                result = run_scripts(&name, &once_scripts, &dir, &out, &err, &cancel_token).await;
            }
            if result.is_ok() {
                result = run_scripts(&name, &every_scripts, &dir, &out, &err, &cancel_token).await;
            }
            if let Err(error) = &result {
                out.send_line(&format!("init: {error}"));
                debug!(command = %name, error = %error, "init aborted");
            }

            let mut st = lock(&state);
            st.init_running = false;
            st.cancel = None;
            st.chatter_out = None;
            st.chatter_err = None;
            drop(st);
            drop(out);
            drop(err);
            let _ = drain_tx.send(true);
        });
    }

    fn cancel_current_init(&self) {
        let st = lock(&self.state);
        if st.init_running {
            if let Some(handle) = &st.cancel {
                handle.cancel();
            }
        }
    }

    /// Waits for the in-flight invocation, bounded. Deliberately returns
    /// even when init did not drain in time.
    async fn drain_init(&self, limit: Duration) {
        let drained = lock(&self.state).drained.clone();
        if let Some(mut rx) = drained {
            let _ = tokio::time::timeout(limit, rx.wait_for(|gone| *gone)).await;
        }
    }
}

#[async_trait]
impl Command for InitWrapper {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await?;
        self.await_running_then_init().await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel_current_init();
        self.drain_init(STOP_DRAIN).await;
        self.inner.stop().await
    }

    async fn restart(&self) -> Result<()> {
        self.drain_init(RESTART_DRAIN).await;
        self.inner.restart().await?;
        self.await_running_then_init().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel_current_init();
        self.drain_init(STOP_DRAIN).await;
        self.inner.shutdown().await
    }

    fn running(&self) -> bool {
        self.inner.running()
    }

    fn done(&self) -> DoneSignal {
        DoneSignal::new(self.done_rx.clone())
    }

    fn stdout(&self) -> Option<OutputReader> {
        let own = lock(&self.out_rx).take()?;
        Some(match self.inner.stdout() {
            Some(inner) => Box::pin(own.chain(inner)) as OutputReader,
            None => Box::pin(own) as OutputReader,
        })
    }

    fn stderr(&self) -> Option<OutputReader> {
        let own = lock(&self.err_rx).take()?;
        Some(match self.inner.stderr() {
            Some(inner) => Box::pin(own.chain(inner)) as OutputReader,
            None => Box::pin(own) as OutputReader,
        })
    }

    fn stdin(&self) -> PipeWriter {
        self.inner.stdin()
    }
}

/// Writer into a pipe nobody reads; used once the chatter pipes have closed.
fn dead_writer() -> PipeWriter {
    let (tx, _rx) = pipe();
    tx
}

async fn run_scripts(
    name: &str,
    scripts: &[String],
    dir: &Path,
    out: &PipeWriter,
    err: &PipeWriter,
    cancel: &CancelToken,
) -> Result<()> {
    for script in scripts {
        if cancel.is_cancelled() {
            return Err(RigError::InitFailure("interrupted".into()));
        }
        out.send_line(&format!("$ {script}"));
        run_script(name, script, dir, out, err, cancel).await?;
    }
    Ok(())
}

/// Runs one script via `sh -ec` (strict on error), fanning each output line
/// into the chatter pipes and the debug log.
async fn run_script(
    name: &str,
    script: &str,
    dir: &Path,
    out: &PipeWriter,
    err: &PipeWriter,
    cancel: &CancelToken,
) -> Result<()> {
    let mut cmd = OsCommand::new("sh");
    cmd.arg("-ec")
        .arg(script)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|error| RigError::InitFailure(format!("{script:?}: {error}")))?;

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let out = out.clone();
        let name = name.to_string();
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %name, line = %line, "init");
                out.send_line(&line);
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let err = err.clone();
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err.send_line(&line);
            }
        }));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            // Trailing output is forfeit; a grandchild may still hold the
            // pipes open.
            for pump in pumps {
                pump.abort();
            }
            return Err(RigError::InitFailure("interrupted".into()));
        }
    };
    for pump in pumps {
        let _ = pump.await;
    }

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(RigError::InitFailure(format!("{script:?}: {status}"))),
        Err(error) => Err(RigError::InitFailure(format!("{script:?}: {error}"))),
    }
}
