//! One OS subprocess behind the [`Command`] contract.
//!
//! Each start forks a fresh child in its own process group and spawns a
//! waiter task that owns the handle. Stop sends SIGINT to the group and
//! waits for the waiter to report the exit; an interrupt the command asked
//! for is not an error.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as OsCommand;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use crate::command::{Command, DoneSignal, OutputReader};
use crate::error::{Result, RigError};
use crate::lock;
use crate::pipe::{pipe, PipeReader, PipeWriter};

pub struct ProcessCommand {
    name: String,
    program: String,
    args: Vec<String>,
    /// Replaces the subprocess PATH when non-empty.
    path: String,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,

    state: Arc<Mutex<ProcessState>>,

    stdout_tx: PipeWriter,
    stderr_tx: PipeWriter,
    stdin_tx: PipeWriter,
    stdout_rx: Mutex<Option<PipeReader>>,
    stderr_rx: Mutex<Option<PipeReader>>,
    stdin_rx: Arc<AsyncMutex<PipeReader>>,

    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

struct ProcessState {
    running: bool,
    /// Set by stop before the interrupt goes out; distinguishes an asked-for
    /// exit from a crash.
    interrupted: bool,
    pgid: Option<i32>,
    last_err: Option<RigError>,
    /// Fresh per start; fires when the waiter has recorded the exit.
    exited: Option<watch::Receiver<bool>>,
}

impl ProcessCommand {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        path: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let (stdout_tx, stdout_rx) = pipe();
        let (stderr_tx, stderr_rx) = pipe();
        let (stdin_tx, stdin_rx) = pipe();
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            name: name.into(),
            program: program.into(),
            args,
            path: path.into(),
            dir: None,
            env: Vec::new(),
            state: Arc::new(Mutex::new(ProcessState {
                running: false,
                interrupted: false,
                pgid: None,
                last_err: None,
                exited: None,
            })),
            stdout_tx,
            stderr_tx,
            stdin_tx,
            stdout_rx: Mutex::new(Some(stdout_rx)),
            stderr_rx: Mutex::new(Some(stderr_rx)),
            stdin_rx: Arc::new(AsyncMutex::new(stdin_rx)),
            done_tx: Arc::new(done_tx),
            done_rx,
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Blocks until the current subprocess has exited, then returns its exit
    /// error. Repeatable: later calls return the stored error again.
    pub async fn wait(&self) -> Result<()> {
        let exited = lock(&self.state).exited.clone();
        if let Some(mut rx) = exited {
            let _ = rx.wait_for(|gone| *gone).await;
        }
        match lock(&self.state).last_err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Command for ProcessCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        let mut cmd = OsCommand::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        if !self.path.is_empty() {
            cmd.env("PATH", &self.path);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        // The child leads its own process group so interrupts reach any
        // grandchildren a shell spawns.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut st = lock(&self.state);
        if st.running {
            return Err(RigError::AlreadyStarted(self.name.clone()));
        }
        let mut child = cmd.spawn().map_err(|err| RigError::Spawn {
            name: self.name.clone(),
            message: err.to_string(),
        })?;
        let pgid = child.id().map(|pid| pid as i32);
        let (exit_tx, exit_rx) = watch::channel(false);

        if let Some(stdout) = child.stdout.take() {
            spawn_output_pump(stdout, self.stdout_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_pump(stderr, self.stderr_tx.clone());
        }
        if let Some(stdin) = child.stdin.take() {
            spawn_stdin_pump(stdin, Arc::clone(&self.stdin_rx), exit_rx.clone());
        }

        st.running = true;
        st.interrupted = false;
        st.pgid = pgid;
        st.last_err = None;
        st.exited = Some(exit_rx);
        drop(st);

        let state = Arc::clone(&self.state);
        let done_tx = Arc::clone(&self.done_tx);
        let name = self.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut st = lock(&state);
            let err = exit_error(&name, status, st.interrupted);
            st.running = false;
            st.pgid = None;
            st.last_err = err.clone();
            drop(st);
            let _ = exit_tx.send(true);
            let _ = done_tx.send(true);
            match err {
                Some(err) => debug!(command = %name, error = %err, "subprocess exited"),
                None => debug!(command = %name, "subprocess exited cleanly"),
            }
        });

        debug!(command = %self.name, program = %self.program, "subprocess started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut st = lock(&self.state);
            if !st.running {
                return match st.last_err.clone() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            st.interrupted = true;
            #[cfg(unix)]
            if let Some(pgid) = st.pgid {
                // A group that is already gone is fine; the waiter has the
                // rest.
                unsafe {
                    libc::killpg(pgid, libc::SIGINT);
                }
            }
        }
        self.wait().await
    }

    async fn restart(&self) -> Result<()> {
        // stop() has waited for the old subprocess either way; an error here
        // only describes how the previous run ended.
        if let Err(err) = self.stop().await {
            debug!(command = %self.name, error = %err, "previous run ended with error");
        }
        self.start().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    fn running(&self) -> bool {
        lock(&self.state).running
    }

    fn done(&self) -> DoneSignal {
        DoneSignal::new(self.done_rx.clone())
    }

    fn stdout(&self) -> Option<OutputReader> {
        lock(&self.stdout_rx)
            .take()
            .map(|rx| Box::pin(rx) as OutputReader)
    }

    fn stderr(&self) -> Option<OutputReader> {
        lock(&self.stderr_rx)
            .take()
            .map(|rx| Box::pin(rx) as OutputReader)
    }

    fn stdin(&self) -> PipeWriter {
        self.stdin_tx.clone()
    }
}

fn spawn_output_pump(mut src: impl AsyncRead + Unpin + Send + 'static, tx: PipeWriter) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match src.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tx.send(buf[..n].to_vec()),
            }
        }
    });
}

fn spawn_stdin_pump(
    mut child_stdin: tokio::process::ChildStdin,
    slot: Arc<AsyncMutex<PipeReader>>,
    mut exited: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        // The slot is held for the lifetime of this child only; the exit
        // watch releases it for the next start.
        let mut reader = slot.lock().await;
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                res = reader.read(&mut buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if child_stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                },
                // The async block drops the non-Send watch::Ref before the
                // select arm runs, keeping the spawned future Send.
                _ = async {
                    let _ = exited.wait_for(|gone| *gone).await;
                } => break,
            }
        }
    });
}

fn exit_error(
    name: &str,
    status: std::io::Result<ExitStatus>,
    interrupted: bool,
) -> Option<RigError> {
    match status {
        Ok(status) if status.success() => None,
        Ok(status) => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if interrupted && status.signal() == Some(libc::SIGINT) {
                    return None;
                }
            }
            #[cfg(not(unix))]
            let _ = interrupted;
            Some(RigError::ProcessExit {
                name: name.to_string(),
                message: exit_reason(&status),
            })
        }
        Err(err) => Some(RigError::ProcessExit {
            name: name.to_string(),
            message: err.to_string(),
        }),
    }
}

fn exit_reason(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "exited without status".to_string(),
    }
}
