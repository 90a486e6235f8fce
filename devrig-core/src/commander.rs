//! Top-level orchestrator: fans lifecycle operations over an ordered fleet
//! of commands under single-flight reentrancy guards.
//!
//! Children are declared most-dependent first. Start walks them in reverse
//! so foundations (databases, compose environments) come up before the
//! servers that need them; stop and restart walk in declaration order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::command::{Command, DoneSignal};
use crate::error::{Result, RigError};
use crate::lock;

/// Rebuilds whatever the workspace tasks run from. Invoked before children
/// are touched on start and restart; failure aborts the operation.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self) -> Result<()>;
}

/// Builder that has nothing to build.
pub struct NoopBuilder;

#[async_trait]
impl Builder for NoopBuilder {
    async fn build(&self) -> Result<()> {
        Ok(())
    }
}

pub struct Commander {
    children: Vec<Arc<dyn Command>>,
    builder: Arc<dyn Builder>,
    cancel: CancelToken,

    starting: SingleFlight,
    stopping: SingleFlight,
    restarting: SingleFlight,

    state: Mutex<CommanderState>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

struct CommanderState {
    done: bool,
}

impl Commander {
    /// Builds the commander and spawns its two background tasks: a watchdog
    /// that turns outer cancellation into shutdown, and a done monitor that
    /// fires the done channel once the token is cancelled and every child
    /// has drained.
    pub fn new(
        cancel: CancelToken,
        builder: Arc<dyn Builder>,
        children: Vec<Arc<dyn Command>>,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        let commander = Arc::new(Self {
            children,
            builder,
            cancel,
            starting: SingleFlight::new(),
            stopping: SingleFlight::new(),
            restarting: SingleFlight::new(),
            state: Mutex::new(CommanderState { done: false }),
            done_tx: Arc::new(done_tx),
            done_rx,
        });

        {
            let this = Arc::clone(&commander);
            tokio::spawn(async move {
                this.cancel.cancelled().await;
                let _ = this.shutdown().await;
            });
        }
        {
            let this = Arc::clone(&commander);
            tokio::spawn(async move {
                this.cancel.cancelled().await;
                for child in &this.children {
                    child.done().wait().await;
                }
                let _ = this.done_tx.send(true);
            });
        }
        commander
    }

    pub fn children(&self) -> &[Arc<dyn Command>] {
        &self.children
    }

    /// Rebuild, then children in reverse declaration order; the first
    /// failing child aborts the remainder.
    pub async fn start(&self) -> Result<()> {
        if lock(&self.state).done {
            return Err(RigError::Done);
        }
        let Some(_guard) = self.starting.try_acquire() else {
            return Err(RigError::InProgress("start"));
        };
        self.builder.build().await?;
        for child in self.children.iter().rev() {
            child.start().await?;
            debug!(child = child.name(), "started");
        }
        Ok(())
    }

    /// Children in declaration order; errors are collected, the first is
    /// returned, the sequence never aborts.
    pub async fn stop(&self) -> Result<()> {
        let Some(_guard) = self.stopping.try_acquire() else {
            return Err(RigError::InProgress("stop"));
        };
        let mut first_err = None;
        for child in &self.children {
            if let Err(err) = child.stop().await {
                warn!(child = child.name(), error = %err, "stop failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Rebuild, then restart children in declaration order; the first
    /// failure aborts the remainder.
    pub async fn restart(&self) -> Result<()> {
        if lock(&self.state).done {
            return Err(RigError::Done);
        }
        let Some(_guard) = self.restarting.try_acquire() else {
            return Err(RigError::InProgress("restart"));
        };
        self.builder.build().await?;
        for child in &self.children {
            child.restart().await?;
            debug!(child = child.name(), "restarted");
        }
        Ok(())
    }

    /// Idempotent terminal teardown: every child's shutdown (errors
    /// swallowed), then the done flag and channel.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut st = lock(&self.state);
            if st.done {
                return Ok(());
            }
            st.done = true;
        }
        for child in &self.children {
            if let Err(err) = child.shutdown().await {
                debug!(child = child.name(), error = %err, "shutdown error ignored");
            }
        }
        let _ = self.done_tx.send(true);
        Ok(())
    }

    pub fn done(&self) -> DoneSignal {
        DoneSignal::new(self.done_rx.clone())
    }
}

/// At most one in-flight invocation; the second concurrent caller is turned
/// away instead of queued. Releasing is tied to guard drop so no code path
/// can forget it.
struct SingleFlight {
    busy: Arc<Mutex<bool>>,
}

impl SingleFlight {
    fn new() -> Self {
        Self {
            busy: Arc::new(Mutex::new(false)),
        }
    }

    fn try_acquire(&self) -> Option<FlightGuard> {
        let mut busy = lock(&self.busy);
        if *busy {
            return None;
        }
        *busy = true;
        Some(FlightGuard {
            busy: Arc::clone(&self.busy),
        })
    }
}

struct FlightGuard {
    busy: Arc<Mutex<bool>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        *lock(&self.busy) = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cancel::{cancel_pair, CancelHandle};
    use crate::testing::{FakeCommand, OpLog};

    struct FailingBuilder;

    #[async_trait]
    impl Builder for FailingBuilder {
        async fn build(&self) -> Result<()> {
            Err(RigError::BuildFailure("scripted".into()))
        }
    }

    /// The handle must stay alive for the duration of the test; dropping it
    /// reads as cancellation and the watchdog starts tearing down.
    fn commander_with(children: Vec<Arc<dyn Command>>) -> (Arc<Commander>, CancelHandle) {
        let (handle, token) = cancel_pair();
        (Commander::new(token, Arc::new(NoopBuilder), children), handle)
    }

    #[test]
    fn test_single_flight_turns_second_caller_away() {
        let flight = SingleFlight::new();
        let guard = flight.try_acquire();
        assert!(guard.is_some());
        assert!(flight.try_acquire().is_none());
        drop(guard);
        assert!(flight.try_acquire().is_some());
    }

    #[test]
    fn test_flight_guard_releases_on_drop_even_per_branch() {
        let flight = SingleFlight::new();
        {
            let _guard = flight.try_acquire();
        }
        assert!(flight.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_start_walks_children_in_reverse_stop_in_declaration_order() {
        let log = OpLog::new();
        let (commander, _keep) = commander_with(vec![
            Arc::new(FakeCommand::new("server", log.clone())),
            Arc::new(FakeCommand::new("worker", log.clone())),
            Arc::new(FakeCommand::new("db", log.clone())),
        ]);

        commander.start().await.unwrap();
        commander.stop().await.unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "db:start",
                "worker:start",
                "server:start",
                "server:stop",
                "worker:stop",
                "db:stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_start_is_turned_away() {
        let log = OpLog::new();
        let slow: Arc<dyn Command> = Arc::new(
            FakeCommand::new("slow", log.clone()).with_start_delay(Duration::from_millis(300)),
        );
        let (commander, _keep) = commander_with(vec![slow]);

        let first = {
            let commander = Arc::clone(&commander);
            tokio::spawn(async move { commander.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            commander.start().await,
            Err(RigError::InProgress("start"))
        );
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_after_shutdown_is_refused() {
        let log = OpLog::new();
        let (commander, _keep) =
            commander_with(vec![Arc::new(FakeCommand::new("only", log.clone()))]);

        commander.shutdown().await.unwrap();

        assert_eq!(commander.start().await, Err(RigError::Done));
        assert_eq!(commander.restart().await, Err(RigError::Done));
        assert!(commander.done().is_done());
    }

    #[tokio::test]
    async fn test_builder_failure_leaves_children_untouched() {
        let log = OpLog::new();
        let (_handle, token) = cancel_pair();
        let commander = Commander::new(
            token,
            Arc::new(FailingBuilder),
            vec![Arc::new(FakeCommand::new("app", log.clone()))],
        );

        assert!(matches!(
            commander.start().await,
            Err(RigError::BuildFailure(_))
        ));
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_child_start_aborts_the_rest() {
        let log = OpLog::new();
        let (commander, _keep) = commander_with(vec![
            Arc::new(FakeCommand::new("app", log.clone())),
            Arc::new(
                FakeCommand::new("mid", log.clone())
                    .with_start_error(RigError::Spawn {
                        name: "mid".into(),
                        message: "scripted".into(),
                    }),
            ),
            Arc::new(FakeCommand::new("base", log.clone())),
        ]);

        assert!(commander.start().await.is_err());
        // Reverse order reaches base then mid; app is never attempted.
        assert_eq!(log.entries(), vec!["base:start", "mid:start"]);
    }

    #[tokio::test]
    async fn test_stop_keeps_going_past_a_failing_child() {
        let log = OpLog::new();
        let failing = RigError::ProcessExit {
            name: "first".into(),
            message: "exit status 3".into(),
        };
        let (commander, _keep) = commander_with(vec![
            Arc::new(FakeCommand::new("first", log.clone()).with_stop_error(failing.clone())),
            Arc::new(FakeCommand::new("second", log.clone())),
        ]);

        commander.start().await.unwrap();

        assert_eq!(commander.stop().await, Err(failing));
        let entries = log.entries();
        assert!(entries.contains(&"first:stop".to_string()));
        assert!(entries.contains(&"second:stop".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let log = OpLog::new();
        let (commander, _keep) =
            commander_with(vec![Arc::new(FakeCommand::new("only", log.clone()))]);

        commander.shutdown().await.unwrap();
        commander.shutdown().await.unwrap();

        assert_eq!(log.entries(), vec!["only:shutdown"]);
    }

    #[tokio::test]
    async fn test_cancellation_shuts_down_and_fires_done() {
        let log = OpLog::new();
        let (handle, token) = cancel_pair();
        let commander = Commander::new(
            token,
            Arc::new(NoopBuilder),
            vec![
                Arc::new(FakeCommand::new("a", log.clone())),
                Arc::new(FakeCommand::new("b", log.clone())),
            ],
        );

        commander.start().await.unwrap();
        handle.cancel();
        commander.done().wait().await;

        let entries = log.entries();
        assert!(entries.contains(&"a:shutdown".to_string()));
        assert!(entries.contains(&"b:shutdown".to_string()));
    }
}
