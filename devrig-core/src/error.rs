use thiserror::Error;

pub type Result<T> = std::result::Result<T, RigError>;

/// Errors surfaced by the orchestration core.
///
/// The enum is `Clone` because a command keeps the error from its most
/// recent exit and hands the same value back to every later `stop` or
/// `wait` call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RigError {
    /// Malformed input: empty compose project, unknown task kind, port 0.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Start on a command whose subprocess is still alive.
    #[error("command {0} already started")]
    AlreadyStarted(String),

    /// A concurrent start/stop/restart is still in flight on the commander.
    #[error("{0} already in progress")]
    InProgress(&'static str),

    /// Lifecycle operation on a commander that has been shut down.
    #[error("commander is done")]
    Done,

    /// Port protocol other than tcp or udp.
    #[error("invalid protocol {0:?}, expected tcp or udp")]
    InvalidProtocol(String),

    /// The subprocess could not be spawned at all.
    #[error("spawn {name}: {message}")]
    Spawn { name: String, message: String },

    /// The subprocess ended in a way that was not an intentional interrupt.
    #[error("process {name}: {message}")]
    ProcessExit { name: String, message: String },

    /// An init script could not be parsed or run, or exited non-zero.
    #[error("init script failed: {0}")]
    InitFailure(String),

    /// Propagated verbatim from the builder collaborator.
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// The container runtime rejected an up/down/logs request.
    #[error("compose {project}: {message}")]
    Compose { project: String, message: String },
}
