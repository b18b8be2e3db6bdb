use std::fmt;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, killpg};
use nix::sys::termios;
use nix::unistd::Pid;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::output::DEFAULT_CHUNK_SIZE;
use crate::rbuffer::RingBuffer;

const PTY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const PTY_READ_POLL_MS: u16 = 50;
/// How long `finalize` waits for an abandoned pump to notice it was stopped.
const PUMP_STOP_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start one child process.
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub directory: Option<PathBuf>,
    /// Applied on top of the inherited environment, in order.
    pub envs: Vec<(String, String)>,
    pub tty: bool,
    pub stdout: Arc<RingBuffer>,
    /// Unused under a pty, where both streams arrive on the master.
    pub stderr: Arc<RingBuffer>,
    pub chunk_size: usize,
    /// How long `finalize` waits for output pumps after the child exited.
    pub drain_grace: Duration,
}

impl CommandConfig {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        stdout: Arc<RingBuffer>,
        stderr: Arc<RingBuffer>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            directory: None,
            envs: Vec::new(),
            tty: false,
            stdout,
            stderr,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Turn off terminal echo on the pty so input is not reflected back.
    pub disable_echo: bool,
}

/// Lifecycle of a child process. Transitions only ever move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessState {
    Created = 0,
    Started = 1,
    Running = 2,
    Signaled = 3,
    Killed = 4,
    Exited = 5,
    Finalized = 6,
}

impl ProcessState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ProcessState::Created,
            1 => ProcessState::Started,
            2 => ProcessState::Running,
            3 => ProcessState::Signaled,
            4 => ProcessState::Killed,
            5 => ProcessState::Exited,
            _ => ProcessState::Finalized,
        }
    }
}

#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ProcessState::Created as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> ProcessState {
        ProcessState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Returns false if the cell is already at or past it.
    pub fn advance(&self, next: ProcessState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (next as u8 > cur).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn has_exited(&self) -> bool {
        self.get() >= ProcessState::Exited
    }
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitOutcome {
    /// Exit code reported for signal-terminated or unrecognized exits.
    pub const ABNORMAL: i32 = -1;

    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(Self::ABNORMAL)
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "terminated by {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        let signal = status.signal().map(|raw| {
            Signal::try_from(raw)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("signal {raw}"))
        });
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl From<portable_pty::ExitStatus> for ExitOutcome {
    fn from(status: portable_pty::ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Self {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => Self {
                code: i32::try_from(status.exit_code()).ok(),
                signal: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Kill,
}

impl StopSignal {
    fn as_nix(self) -> Signal {
        match self {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    fn state(self) -> ProcessState {
        match self {
            StopSignal::Interrupt => ProcessState::Signaled,
            StopSignal::Kill => ProcessState::Killed,
        }
    }
}

struct SignalRequest {
    signal: StopSignal,
    reply: oneshot::Sender<Result<(), RunnerError>>,
}

/// Cloneable control handle for a running child.
///
/// Signals go through the task that owns the child, so a signal can never be
/// delivered after that task reaped the process.
#[derive(Clone)]
pub struct ProcessHandle {
    state: Arc<StateCell>,
    signals: mpsc::Sender<SignalRequest>,
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn has_exited(&self) -> bool {
        self.state.has_exited()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn interrupt(&self) -> Result<(), RunnerError> {
        self.signal(StopSignal::Interrupt).await
    }

    pub async fn kill(&self) -> Result<(), RunnerError> {
        self.signal(StopSignal::Kill).await
    }

    /// Deliver `signal` to the child's process group.
    pub async fn signal(&self, signal: StopSignal) -> Result<(), RunnerError> {
        if self.has_exited() {
            return Err(RunnerError::ProcessExited);
        }
        let (reply, rx) = oneshot::channel();
        self.signals
            .send(SignalRequest { signal, reply })
            .await
            .map_err(|_| RunnerError::ProcessExited)?;
        rx.await.map_err(|_| RunnerError::ProcessExited)?
    }
}

/// Input side of a child: its stdin pipe or the pty master.
pub struct StdinWriter {
    inner: StdinInner,
}

enum StdinInner {
    Piped(ChildStdin),
    Pty(Arc<Mutex<Box<dyn Write + Send>>>),
}

impl StdinWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), RunnerError> {
        match &mut self.inner {
            StdinInner::Piped(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
            }
            StdinInner::Pty(writer) => {
                let writer = Arc::clone(writer);
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                    writer.write_all(&data)?;
                    writer.flush()
                })
                .await
                .map_err(join_error)??;
            }
        }
        Ok(())
    }
}

enum ChildProcess {
    Piped(tokio::process::Child),
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ChildProcess {
    /// Cancel safe: dropping the future leaves the child untouched.
    async fn wait(&mut self) -> Result<ExitOutcome, RunnerError> {
        match self {
            ChildProcess::Piped(child) => Ok(child.wait().await?.into()),
            ChildProcess::Pty(child) => loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(status.into());
                }
                tokio::time::sleep(PTY_POLL_INTERVAL).await;
            },
        }
    }
}

type ExitResult = Result<ExitOutcome, RunnerError>;
type PumpHandle = JoinHandle<Result<(), RunnerError>>;

/// One child process and the plumbing around it.
pub struct Command {
    program: String,
    handle: ProcessHandle,
    exit_rx: Option<oneshot::Receiver<ExitResult>>,
    exit: Option<ExitOutcome>,
    stdin: Option<StdinWriter>,
    pumps: Vec<PumpHandle>,
    pty_master: Option<Box<dyn MasterPty + Send>>,
    /// Tells the blocking pty pump to give up on output still held open.
    pump_stop: CancellationToken,
    drain_grace: Duration,
}

impl Command {
    /// Spawn the child and start copying its output into the rings.
    /// Must be called from within a tokio runtime.
    pub fn start(config: CommandConfig, opts: StartOptions) -> Result<Self, RunnerError> {
        if config.program.is_empty() {
            return Err(RunnerError::InvalidRequest("program name is empty".to_string()));
        }
        let state = Arc::new(StateCell::default());
        let cmd = if config.tty {
            Self::start_pty(config, opts, state)?
        } else {
            Self::start_piped(config, state)?
        };
        info!(program = %cmd.program, pid = ?cmd.handle.pid, "process started");
        Ok(cmd)
    }

    fn start_piped(config: CommandConfig, state: Arc<StateCell>) -> Result<Self, RunnerError> {
        let mut cmd = tokio::process::Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.as_std_mut().process_group(0);
        if let Some(dir) = &config.directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        state.advance(ProcessState::Started);

        let pid = child.id();
        let stdin = child.stdin.take().map(|stdin| StdinWriter {
            inner: StdinInner::Piped(stdin),
        });

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_pipe(
                stdout,
                Arc::clone(&config.stdout),
                config.chunk_size,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_pipe(
                stderr,
                Arc::clone(&config.stderr),
                config.chunk_size,
            )));
        }

        let (handle, exit_rx) = supervise(ChildProcess::Piped(child), pid, state);
        Ok(Self {
            program: config.program,
            handle,
            exit_rx: Some(exit_rx),
            exit: None,
            stdin,
            pumps,
            pty_master: None,
            pump_stop: CancellationToken::new(),
            drain_grace: config.drain_grace,
        })
    }

    fn start_pty(
        config: CommandConfig,
        opts: StartOptions,
        state: Arc<StateCell>,
    ) -> Result<Self, RunnerError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RunnerError::Pty(e.to_string()))?;

        if opts.disable_echo {
            disable_echo(pair.master.as_ref())?;
        }

        let cwd = config
            .directory
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));
        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        cmd.cwd(&cwd);
        for (key, value) in &config.envs {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RunnerError::Spawn {
                program: config.program.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;
        state.advance(ProcessState::Started);

        // Only the child keeps the slave side open, so the master sees EOF
        // once it exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RunnerError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RunnerError::Pty(e.to_string()))?;

        let readable = pair.master.as_raw_fd().map(dup_fd).transpose()?;

        let pump_stop = CancellationToken::new();
        let pty_pump = PtyPump {
            reader,
            readable,
            ring: Arc::clone(&config.stdout),
            chunk_size: config.chunk_size,
            runtime: tokio::runtime::Handle::current(),
            stop: pump_stop.clone(),
        };
        let pump = tokio::task::spawn_blocking(move || pty_pump.run());

        let pid = child.process_id();
        let (handle, exit_rx) = supervise(ChildProcess::Pty(child), pid, state);
        Ok(Self {
            program: config.program,
            handle,
            exit_rx: Some(exit_rx),
            exit: None,
            stdin: Some(StdinWriter {
                inner: StdinInner::Pty(Arc::new(Mutex::new(writer))),
            }),
            pumps: vec![pump],
            pty_master: Some(pair.master),
            pump_stop,
            drain_grace: config.drain_grace,
        })
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.handle.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid
    }

    /// Take the stdin writer. Dropping it closes the child's input.
    pub fn take_stdin(&mut self) -> Option<StdinWriter> {
        self.stdin.take()
    }

    /// Wait for the child to exit. Cancel safe, and returns the cached
    /// outcome on repeated calls.
    pub async fn wait(&mut self) -> Result<ExitOutcome, RunnerError> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let rx = self.exit_rx.as_mut().ok_or(RunnerError::ProcessExited)?;
        let result = rx.await;
        self.exit_rx = None;
        let outcome = result.map_err(|_| {
            RunnerError::Io(std::io::Error::other("process supervisor vanished"))
        })??;
        debug!(program = %self.program, %outcome, "process exited");
        self.exit = Some(outcome.clone());
        Ok(outcome)
    }

    /// Release the pty and stdin, then wait for the output pumps to flush
    /// into the rings. Pumps still running after the drain grace period are
    /// stopped, which happens when a grandchild keeps the output open.
    /// Call after [`Command::wait`].
    pub async fn finalize(&mut self) -> Result<(), RunnerError> {
        self.stdin = None;
        self.pty_master = None;

        let deadline = tokio::time::Instant::now() + self.drain_grace;
        let mut first_err = None;
        for mut pump in self.pumps.drain(..) {
            match tokio::time::timeout_at(deadline, &mut pump).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) if err.is_closed() => {
                    debug!(program = %self.program, "output pump stopped: sink closed");
                }
                Ok(Ok(Err(err))) => {
                    warn!(program = %self.program, error = %err, "output pump failed");
                    first_err.get_or_insert(err);
                }
                Ok(Err(err)) => {
                    first_err.get_or_insert(join_error(err));
                }
                Err(_) => {
                    warn!(program = %self.program, "output still open after exit, abandoning it");
                    self.pump_stop.cancel();
                    pump.abort();
                    if tokio::time::timeout(PUMP_STOP_WAIT, &mut pump).await.is_err() {
                        warn!(program = %self.program, "output pump did not stop");
                    }
                }
            }
        }

        self.handle.state.advance(ProcessState::Finalized);
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.handle.has_exited() {
            return;
        }
        let (reply, _rx) = oneshot::channel();
        let _ = self.handle.signals.try_send(SignalRequest {
            signal: StopSignal::Kill,
            reply,
        });
    }
}

fn supervise(
    child: ChildProcess,
    pid: Option<u32>,
    state: Arc<StateCell>,
) -> (ProcessHandle, oneshot::Receiver<ExitResult>) {
    let (signals_tx, signals_rx) = mpsc::channel(4);
    let (exit_tx, exit_rx) = oneshot::channel();
    state.advance(ProcessState::Running);
    tokio::spawn(supervise_loop(
        child,
        pid,
        signals_rx,
        Arc::clone(&state),
        exit_tx,
    ));
    (
        ProcessHandle {
            state,
            signals: signals_tx,
            pid,
        },
        exit_rx,
    )
}

async fn supervise_loop(
    mut child: ChildProcess,
    pid: Option<u32>,
    mut signals: mpsc::Receiver<SignalRequest>,
    state: Arc<StateCell>,
    exit_tx: oneshot::Sender<ExitResult>,
) {
    let result = loop {
        tokio::select! {
            res = child.wait() => break res,
            Some(req) = signals.recv() => {
                let res = deliver(pid, req.signal, &state);
                let _ = req.reply.send(res);
            }
        }
    };
    state.advance(ProcessState::Exited);
    let _ = exit_tx.send(result);
}

fn deliver(pid: Option<u32>, signal: StopSignal, state: &StateCell) -> Result<(), RunnerError> {
    let pgid = pid
        .and_then(|pid| i32::try_from(pid).ok())
        .ok_or(RunnerError::ProcessExited)?;
    state.advance(signal.state());
    // The child leads its own process group, so this reaches anything it
    // spawned as well.
    match killpg(Pid::from_raw(pgid), signal.as_nix()) {
        Ok(()) => {
            debug!(pgid, ?signal, "signal delivered");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => Err(RunnerError::ProcessExited),
        Err(errno) => Err(errno.into()),
    }
}

fn disable_echo(master: &dyn MasterPty) -> Result<(), RunnerError> {
    let Some(raw) = master.as_raw_fd() else {
        return Ok(());
    };
    // Safety: `raw` belongs to `master`, which outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.local_flags.remove(termios::LocalFlags::ECHO);
    termios::tcsetattr(fd, termios::SetArg::TCSANOW, &attrs)?;
    Ok(())
}

async fn pump_pipe<R: AsyncRead + Unpin>(
    mut reader: R,
    ring: Arc<RingBuffer>,
    chunk_size: usize,
) -> Result<(), RunnerError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        ring.write_all(&buf[..n]).await?;
    }
}

fn dup_fd(raw: RawFd) -> Result<OwnedFd, RunnerError> {
    // Safety: `raw` belongs to the pty master, which is alive for this call.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    Ok(fd.try_clone_to_owned()?)
}

/// Copies pty output into the stdout ring on a blocking thread.
struct PtyPump {
    reader: Box<dyn Read + Send>,
    /// Duplicate of the master, polled so reads never block past `stop`.
    readable: Option<OwnedFd>,
    ring: Arc<RingBuffer>,
    chunk_size: usize,
    runtime: tokio::runtime::Handle,
    stop: CancellationToken,
}

impl PtyPump {
    fn run(mut self) -> Result<(), RunnerError> {
        let mut buf = vec![0u8; self.chunk_size.max(1)];
        loop {
            if !self.wait_readable()? {
                debug!("pty pump stopped");
                return Ok(());
            }
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.runtime.block_on(self.ring.write_all(&buf[..n]))?,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// False once `stop` fires before the master has anything to read.
    /// A hangup counts as readable so the next read sees it.
    fn wait_readable(&self) -> Result<bool, RunnerError> {
        let Some(fd) = &self.readable else {
            return Ok(!self.stop.is_cancelled());
        };
        loop {
            if self.stop.is_cancelled() {
                return Ok(false);
            }
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(PTY_READ_POLL_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => return Ok(true),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> RunnerError {
    RunnerError::Io(std::io::Error::other(err))
}
