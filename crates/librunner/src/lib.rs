pub mod command;
pub mod error;
pub mod executable;
pub mod output;
pub mod rbuffer;
pub mod session;

pub use command::{
    Command, CommandConfig, ExitOutcome, ProcessHandle, ProcessState, StartOptions, StdinWriter,
    StopSignal,
};
pub use error::RunnerError;
pub use executable::{ExecIo, Executable, Invocation, Mode, Program, Shell, execute};
pub use output::{Handoff, HandoffReceiver, Output, handoff, read_loop};
pub use rbuffer::RingBuffer;
pub use session::{Session, SessionId, SessionRegistry};
