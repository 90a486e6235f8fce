//! The uniform contract every controllable unit satisfies: one OS
//! subprocess, one compose project, or a composition of those.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::watch;

use crate::error::Result;
use crate::pipe::PipeWriter;

/// Boxed byte stream handed to whoever renders a command's output.
pub type OutputReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait Command: Send + Sync {
    /// Stable display name.
    fn name(&self) -> &str;

    /// Brings the unit up. Returns as soon as the unit is launched; it does
    /// not wait for the unit to finish.
    async fn start(&self) -> Result<()>;

    /// Takes the unit down and waits for it to be gone. Success when the
    /// unit was not running.
    async fn stop(&self) -> Result<()>;

    /// Stop then start. Succeeds even if the unit had already exited.
    async fn restart(&self) -> Result<()>;

    /// Final teardown. After this, only the done-signal has observable
    /// effect.
    async fn shutdown(&self) -> Result<()>;

    /// True only between a successful start/restart and the subsequent
    /// stop/shutdown/self-exit.
    fn running(&self) -> bool;

    /// Fires once, the first time the unit finishes, and stays fired.
    fn done(&self) -> DoneSignal;

    /// Read end of the stdout stream. Yields `None` on the second call. The
    /// stream survives restarts: a long-lived reader sees successive runs
    /// concatenated.
    fn stdout(&self) -> Option<OutputReader>;

    /// Read end of the stderr stream; same take-once rule as `stdout`.
    fn stderr(&self) -> Option<OutputReader>;

    /// Write end of the stdin stream.
    fn stdin(&self) -> PipeWriter;
}

/// One-shot completion signal backed by a watch channel.
#[derive(Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired. A dropped sender counts as fired
    /// so waiters never hang on a vanished command.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}
