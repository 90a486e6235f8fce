//! A declared container project behind the [`Command`] contract.
//!
//! The controller never talks to a container engine directly; it drives an
//! injected [`ComposeRuntime`] and fans that runtime's log stream into its
//! stdout pipe. The docker-backed implementation lives in the CLI crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::command::{Command, DoneSignal, OutputReader};
use crate::error::{Result, RigError};
use crate::lock;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::ports::PortResolution;
use crate::project::ComposeProject;

/// Container-runtime operations the controller depends on.
#[async_trait]
pub trait ComposeRuntime: Send + Sync {
    async fn up(&self, project: &ComposeProject) -> Result<()>;

    async fn down(&self, project: &ComposeProject) -> Result<()>;

    /// Streams logs for every service container into `consumer`, following
    /// new output until the containers go away or `cancel` fires.
    /// Cancellation is a clean return, not an error.
    async fn logs(
        &self,
        project: &ComposeProject,
        consumer: Arc<dyn LogConsumer>,
        cancel: CancelToken,
    ) -> Result<()>;
}

/// Sink for container log traffic.
pub trait LogConsumer: Send + Sync {
    /// A container has come into view.
    fn register(&self, container: &str);

    /// One line of container output.
    fn log(&self, container: &str, line: &str);

    /// Out-of-band status, e.g. stream errors.
    fn status(&self, container: &str, message: &str);
}

/// Fans container log traffic into a command's stdout pipe, one prefixed
/// line per callback.
struct PipeLogConsumer {
    out: PipeWriter,
}

impl LogConsumer for PipeLogConsumer {
    fn register(&self, container: &str) {
        self.out.send_line(&format!("[{container}] attached"));
    }

    fn log(&self, container: &str, line: &str) {
        self.out.send_line(&format!("[{container}] {line}"));
    }

    fn status(&self, container: &str, message: &str) {
        self.out.send_line(&format!("[{container}] {message}"));
    }
}

pub struct ComposeCommand {
    name: String,
    project: ComposeProject,
    runtime: Arc<dyn ComposeRuntime>,

    state: Mutex<ComposeState>,

    stdout_tx: PipeWriter,
    stderr_tx: PipeWriter,
    stdin_tx: PipeWriter,
    stdout_rx: Mutex<Option<PipeReader>>,
    stderr_rx: Mutex<Option<PipeReader>>,
    // Parked so stdin writes go nowhere instead of erroring.
    _stdin_rx: Mutex<Option<PipeReader>>,

    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

struct ComposeState {
    running: bool,
    log_cancel: Option<CancelHandle>,
}

impl ComposeCommand {
    /// Conflict and remap summaries, when present, are written to the stdout
    /// pipe here so the UI shows them before any container log line.
    pub fn new(
        project: ComposeProject,
        runtime: Arc<dyn ComposeRuntime>,
        resolution: Option<&PortResolution>,
    ) -> Result<Self> {
        if project.name.is_empty() {
            return Err(RigError::InvalidArgument(
                "compose project has no name".into(),
            ));
        }
        if project.services.is_empty() {
            return Err(RigError::InvalidArgument(format!(
                "compose project {} declares no services",
                project.name
            )));
        }
        let (stdout_tx, stdout_rx) = pipe();
        let (stderr_tx, stderr_rx) = pipe();
        let (stdin_tx, stdin_rx) = pipe();
        let (done_tx, done_rx) = watch::channel(false);
        let command = Self {
            name: project.name.clone(),
            project,
            runtime,
            state: Mutex::new(ComposeState {
                running: false,
                log_cancel: None,
            }),
            stdout_tx,
            stderr_tx,
            stdin_tx,
            stdout_rx: Mutex::new(Some(stdout_rx)),
            stderr_rx: Mutex::new(Some(stderr_rx)),
            _stdin_rx: Mutex::new(Some(stdin_rx)),
            done_tx: Arc::new(done_tx),
            done_rx,
        };
        if let Some(resolution) = resolution {
            for line in &resolution.conflicts {
                command.stdout_tx.send_line(line);
            }
            for line in &resolution.remaps {
                command.stdout_tx.send_line(line);
            }
        }
        Ok(command)
    }

    pub async fn up(&self) -> Result<()> {
        self.runtime.up(&self.project).await?;

        let (handle, token) = cancel_pair();
        {
            let mut st = lock(&self.state);
            st.running = true;
            st.log_cancel = Some(handle);
        }

        let runtime = Arc::clone(&self.runtime);
        let project = self.project.clone();
        let consumer: Arc<dyn LogConsumer> = Arc::new(PipeLogConsumer {
            out: self.stdout_tx.clone(),
        });
        let stderr = self.stderr_tx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.logs(&project, consumer, token).await {
                stderr.send_line(&format!("log stream ended: {err}"));
                warn!(project = %name, error = %err, "compose log stream failed");
            }
        });

        debug!(project = %self.name, "compose project up");
        Ok(())
    }

    pub async fn down(&self) -> Result<()> {
        let cancel = {
            let mut st = lock(&self.state);
            if !st.running {
                return Ok(());
            }
            st.running = false;
            st.log_cancel.take()
        };
        if let Some(handle) = cancel {
            handle.cancel();
        }
        debug!(project = %self.name, "compose project down");
        self.runtime.down(&self.project).await
    }

    pub fn project(&self) -> &ComposeProject {
        &self.project
    }
}

#[async_trait]
impl Command for ComposeCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.up().await
    }

    async fn stop(&self) -> Result<()> {
        let res = self.down().await;
        let _ = self.done_tx.send(true);
        res
    }

    async fn restart(&self) -> Result<()> {
        self.down().await?;
        self.up().await
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::project::ComposeService;
    use crate::testing::{lines, next_line, OpLog};

    struct FakeRuntime {
        log: OpLog,
        containers: Vec<String>,
        lines: Vec<(String, String)>,
        down_delay: Duration,
    }

    impl FakeRuntime {
        fn new(log: OpLog) -> Self {
            Self {
                log,
                containers: Vec::new(),
                lines: Vec::new(),
                down_delay: Duration::ZERO,
            }
        }

        fn with_container(mut self, container: &str) -> Self {
            self.containers.push(container.to_string());
            self
        }

        fn with_line(mut self, container: &str, line: &str) -> Self {
            self.lines.push((container.to_string(), line.to_string()));
            self
        }

        fn with_down_delay(mut self, delay: Duration) -> Self {
            self.down_delay = delay;
            self
        }
    }

    #[async_trait]
    impl ComposeRuntime for FakeRuntime {
        async fn up(&self, project: &ComposeProject) -> Result<()> {
            self.log.record(format!("up:{}", project.name));
            Ok(())
        }

        async fn down(&self, project: &ComposeProject) -> Result<()> {
            if !self.down_delay.is_zero() {
                tokio::time::sleep(self.down_delay).await;
            }
            self.log.record(format!("down:{}", project.name));
            Ok(())
        }

        async fn logs(
            &self,
            _project: &ComposeProject,
            consumer: Arc<dyn LogConsumer>,
            cancel: CancelToken,
        ) -> Result<()> {
            for container in &self.containers {
                consumer.register(container);
            }
            for (container, line) in &self.lines {
                consumer.log(container, line);
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn stack() -> ComposeProject {
        ComposeProject {
            name: "devstack".into(),
            services: vec![ComposeService {
                name: "web".into(),
                image: "nginx:1".into(),
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_rejects_unnamed_or_empty_projects() {
        let log = OpLog::new();
        let runtime = Arc::new(FakeRuntime::new(log));

        let unnamed = ComposeProject {
            name: String::new(),
            services: stack().services,
        };
        assert!(matches!(
            ComposeCommand::new(unnamed, Arc::clone(&runtime) as Arc<dyn ComposeRuntime>, None),
            Err(RigError::InvalidArgument(_))
        ));

        let empty = ComposeProject {
            name: "devstack".into(),
            services: Vec::new(),
        };
        assert!(matches!(
            ComposeCommand::new(empty, runtime, None),
            Err(RigError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_resolution_banners_come_before_container_logs() {
        let log = OpLog::new();
        let runtime = Arc::new(
            FakeRuntime::new(log)
                .with_container("devstack-web-1")
                .with_line("devstack-web-1", "listening on 8081"),
        );
        let resolution = PortResolution {
            conflicts: vec!["port 8080/tcp claimed by api, web".into()],
            remaps: vec!["service web: 8080/tcp remapped to 8081/tcp".into()],
        };
        let command = ComposeCommand::new(stack(), runtime, Some(&resolution)).unwrap();
        let mut reader = lines(command.stdout().unwrap());

        command.start().await.unwrap();

        for expected in [
            "port 8080/tcp claimed by api, web",
            "service web: 8080/tcp remapped to 8081/tcp",
            "[devstack-web-1] attached",
            "[devstack-web-1] listening on 8081",
        ] {
            assert_eq!(next_line(&mut reader).await, expected);
        }
    }

    #[tokio::test]
    async fn test_down_without_up_never_reaches_the_runtime() {
        let log = OpLog::new();
        let runtime = Arc::new(FakeRuntime::new(log.clone()));
        let command = ComposeCommand::new(stack(), runtime, None).unwrap();

        command.down().await.unwrap();

        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_running_clears_before_the_runtime_tears_down() {
        let log = OpLog::new();
        let runtime = Arc::new(
            FakeRuntime::new(log.clone()).with_down_delay(Duration::from_millis(200)),
        );
        let command = Arc::new(ComposeCommand::new(stack(), runtime, None).unwrap());

        command.up().await.unwrap();
        assert!(command.running());

        let down = {
            let command = Arc::clone(&command);
            tokio::spawn(async move { command.down().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!command.running());
        down.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_cycles_through_the_runtime() {
        let log = OpLog::new();
        let runtime = Arc::new(FakeRuntime::new(log.clone()));
        let command = ComposeCommand::new(stack(), runtime, None).unwrap();

        command.start().await.unwrap();
        command.restart().await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["up:devstack", "down:devstack", "up:devstack"]
        );
    }

    #[tokio::test]
    async fn test_stop_fires_the_done_signal() {
        let log = OpLog::new();
        let runtime = Arc::new(FakeRuntime::new(log));
        let command = ComposeCommand::new(stack(), runtime, None).unwrap();

        command.start().await.unwrap();
        assert!(!command.done().is_done());
        command.stop().await.unwrap();
        assert!(command.done().is_done());
    }
}
