//! A root command plus subordinate helpers (watchers, tailers) that live
//! and die with it. Flat, one level.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::command::{Command, DoneSignal, OutputReader};
use crate::error::Result;
use crate::pipe::PipeWriter;

pub struct CommandTree {
    root: Arc<dyn Command>,
    subs: Vec<Arc<dyn Command>>,
    done_rx: watch::Receiver<bool>,
}

impl CommandTree {
    pub fn new(root: Arc<dyn Command>, subs: Vec<Arc<dyn Command>>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let signals: Vec<DoneSignal> = std::iter::once(root.done())
            .chain(subs.iter().map(|sub| sub.done()))
            .collect();
        tokio::spawn(async move {
            for signal in signals {
                signal.wait().await;
            }
            let _ = done_tx.send(true);
        });
        Self {
            root,
            subs,
            done_rx,
        }
    }

    /// The helpers the TUI subscribes to individually.
    pub fn subordinates(&self) -> &[Arc<dyn Command>] {
        &self.subs
    }

    async fn start_subs(&self) -> Result<()> {
        let handles: Vec<_> = self
            .subs
            .iter()
            .map(|sub| {
                let sub = Arc::clone(sub);
                tokio::spawn(async move { sub.start().await })
            })
            .collect();
        let mut first_err = None;
        for handle in handles {
            if let Ok(Err(err)) = handle.await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_subs(&self) -> Option<crate::error::RigError> {
        let handles: Vec<_> = self
            .subs
            .iter()
            .map(|sub| {
                let sub = Arc::clone(sub);
                tokio::spawn(async move { sub.stop().await })
            })
            .collect();
        let mut first_err = None;
        for handle in handles {
            if let Ok(Err(err)) = handle.await {
                first_err.get_or_insert(err);
            }
        }
        first_err
    }
}

#[async_trait]
impl Command for CommandTree {
    fn name(&self) -> &str {
        self.root.name()
    }

    /// Subordinates in parallel, the root strictly after every one of them.
    async fn start(&self) -> Result<()> {
        self.start_subs().await?;
        self.root.start().await
    }

    /// Root first, then subordinates in parallel; first error wins but the
    /// rest is still attempted.
    async fn stop(&self) -> Result<()> {
        let mut first_err = self.root.stop().await.err();
        if let Some(err) = self.stop_subs().await {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn restart(&self) -> Result<()> {
        // Stop's error only describes how the previous run ended.
        if let Err(err) = self.stop().await {
            debug!(command = self.root.name(), error = %err, "tree stop before restart");
        }
        self.start().await
    }

    async fn shutdown(&self) -> Result<()> {
        let mut first_err = self.root.shutdown().await.err();
        let handles: Vec<_> = self
            .subs
            .iter()
            .map(|sub| {
                let sub = Arc::clone(sub);
                tokio::spawn(async move { sub.shutdown().await })
            })
            .collect();
        for handle in handles {
            if let Ok(Err(err)) = handle.await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn running(&self) -> bool {
        self.root.running()
    }

    fn done(&self) -> DoneSignal {
        DoneSignal::new(self.done_rx.clone())
    }

    fn stdout(&self) -> Option<OutputReader> {
        self.root.stdout()
    }

    fn stderr(&self) -> Option<OutputReader> {
        self.root.stderr()
    }

    fn stdin(&self) -> PipeWriter {
        self.root.stdin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::RigError;
    use crate::testing::{FakeCommand, OpLog};

    #[tokio::test]
    async fn test_root_starts_only_after_every_subordinate() {
        let log = OpLog::new();
        let tree = CommandTree::new(
            Arc::new(FakeCommand::new("app", log.clone())),
            vec![
                Arc::new(
                    FakeCommand::new("watcher", log.clone())
                        .with_start_delay(Duration::from_millis(80)),
                ),
                Arc::new(FakeCommand::new("tailer", log.clone())),
            ],
        );

        tree.start().await.unwrap();

        let entries = log.entries();
        assert_eq!(entries.last().map(String::as_str), Some("app:start"));
        assert!(entries.contains(&"watcher:start".to_string()));
        assert!(entries.contains(&"tailer:start".to_string()));
    }

    #[tokio::test]
    async fn test_stop_takes_root_down_first() {
        let log = OpLog::new();
        let tree = CommandTree::new(
            Arc::new(FakeCommand::new("app", log.clone())),
            vec![Arc::new(FakeCommand::new("watcher", log.clone()))],
        );

        tree.start().await.unwrap();
        let started = log.entries().len();
        tree.stop().await.unwrap();

        let entries = log.entries();
        assert_eq!(entries[started], "app:stop");
        assert!(entries.contains(&"watcher:stop".to_string()));
    }

    #[tokio::test]
    async fn test_failed_subordinate_keeps_root_down() {
        let log = OpLog::new();
        let tree = CommandTree::new(
            Arc::new(FakeCommand::new("app", log.clone())),
            vec![Arc::new(
                FakeCommand::new("watcher", log.clone()).with_start_error(RigError::Spawn {
                    name: "watcher".into(),
                    message: "scripted".into(),
                }),
            )],
        );

        assert!(tree.start().await.is_err());
        assert!(!log.entries().contains(&"app:start".to_string()));
    }

    #[tokio::test]
    async fn test_done_waits_for_root_and_subordinates() {
        let log = OpLog::new();
        let tree = CommandTree::new(
            Arc::new(FakeCommand::new("app", log.clone())),
            vec![Arc::new(FakeCommand::new("watcher", log.clone()))],
        );

        tree.start().await.unwrap();
        assert!(!tree.done().is_done());
        tree.shutdown().await.unwrap();
        tree.done().wait().await;
    }
}
