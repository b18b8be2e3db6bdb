use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("buffer closed")]
    BufferClosed,

    #[error("output consumer went away")]
    HandoffClosed,

    #[error("process already exited")]
    ProcessExited,

    #[error("failed to run command {command:?}: exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("execution cancelled")]
    Cancelled,
}

impl RunnerError {
    /// True for failures caused by the other side of a pipe going away
    /// rather than by the process or the OS.
    pub fn is_closed(&self) -> bool {
        matches!(self, RunnerError::BufferClosed | RunnerError::HandoffClosed)
    }
}
