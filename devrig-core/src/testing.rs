//! In-memory test doubles and helpers for the lifecycle tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;

use crate::command::{Command, DoneSignal, OutputReader};
use crate::error::{Result, RigError};
use crate::lock;
use crate::pipe::{pipe, PipeWriter};

/// Next line from a command output stream, bounded so a broken stream fails
/// the test instead of hanging it.
pub(crate) async fn next_line(reader: &mut Lines<BufReader<OutputReader>>) -> String {
    tokio::time::timeout(Duration::from_secs(10), reader.next_line())
        .await
        .expect("line did not arrive")
        .expect("stream error")
        .expect("stream closed")
}

/// Wraps a taken output stream for line-at-a-time reading.
pub(crate) fn lines(reader: OutputReader) -> Lines<BufReader<OutputReader>> {
    BufReader::new(reader).lines()
}

/// Append-only record of lifecycle calls, shared between fakes so tests can
/// assert cross-command ordering.
#[derive(Clone, Default)]
pub(crate) struct OpLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl OpLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }
}

/// Scripted command. Records every lifecycle call as `<name>:<op>` and can
/// be told to dawdle or fail on specific operations.
pub(crate) struct FakeCommand {
    name: String,
    log: OpLog,
    start_delay: Duration,
    start_error: Option<RigError>,
    stop_error: Option<RigError>,
    running: Mutex<bool>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    stdin_tx: PipeWriter,
}

impl FakeCommand {
    pub(crate) fn new(name: &str, log: OpLog) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let (stdin_tx, _) = pipe();
        Self {
            name: name.to_string(),
            log,
            start_delay: Duration::ZERO,
            start_error: None,
            stop_error: None,
            running: Mutex::new(false),
            done_tx: Arc::new(done_tx),
            done_rx,
            stdin_tx,
        }
    }

    pub(crate) fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub(crate) fn with_start_error(mut self, error: RigError) -> Self {
        self.start_error = Some(error);
        self
    }

    pub(crate) fn with_stop_error(mut self, error: RigError) -> Self {
        self.stop_error = Some(error);
        self
    }
}

#[async_trait]
impl Command for FakeCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.log.record(format!("{}:start", self.name));
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        *lock(&self.running) = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.log.record(format!("{}:stop", self.name));
        *lock(&self.running) = false;
        let _ = self.done_tx.send(true);
        match &self.stop_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn restart(&self) -> Result<()> {
        self.log.record(format!("{}:restart", self.name));
        *lock(&self.running) = true;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.log.record(format!("{}:shutdown", self.name));
        *lock(&self.running) = false;
        let _ = self.done_tx.send(true);
        Ok(())
    }

    fn running(&self) -> bool {
        *lock(&self.running)
    }

    fn done(&self) -> DoneSignal {
        DoneSignal::new(self.done_rx.clone())
    }

    fn stdout(&self) -> Option<OutputReader> {
        None
    }

    fn stderr(&self) -> Option<OutputReader> {
        None
    }

    fn stdin(&self) -> PipeWriter {
        self.stdin_tx.clone()
    }
}
