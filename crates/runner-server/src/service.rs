use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use librunner::command::{DEFAULT_DRAIN_GRACE, ExitOutcome};
use librunner::executable::{Executable, Invocation, Program, prepare_script, resolve_shell};
use librunner::output::{DEFAULT_CHUNK_SIZE, Output, handoff, read_loop};
use librunner::{
    Command, ProcessHandle, RingBuffer, RunnerError, Session, SessionRegistry, StartOptions,
    StdinWriter,
};
use runner_proto::runner::v1 as pb;
use runner_proto::runner::v1::runner_service_server::{RunnerService, RunnerServiceServer};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{Instrument, debug, info, info_span, warn};

pub const DEFAULT_RING_BUFFER_SIZE: usize = 8 << 20;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 << 20;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Capacity of each of the stdout and stderr rings, per call.
    pub ring_buffer_size: usize,
    pub chunk_size: usize,
    pub drain_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

pub fn into_status(err: RunnerError) -> Status {
    match err {
        RunnerError::SessionNotFound(id) => Status::not_found(format!("session {id} not found")),
        RunnerError::InvalidRequest(msg) => Status::invalid_argument(msg),
        err @ RunnerError::Spawn { .. } => Status::failed_precondition(err.to_string()),
        err @ RunnerError::CommandFailed { .. } => Status::aborted(err.to_string()),
        RunnerError::Cancelled => Status::cancelled("execution cancelled"),
        err => Status::internal(err.to_string()),
    }
}

fn session_to_proto(session: &Session) -> pb::Session {
    pb::Session {
        id: session.id().to_string(),
        envs: session.envs(),
        metadata: session.metadata().clone(),
    }
}

/// Turn the first request of a call into the single process it starts.
fn build_invocation(req: &pb::ExecuteRequest) -> Result<Invocation, RunnerError> {
    let directory = (!req.directory.is_empty()).then(|| PathBuf::from(&req.directory));
    let shell = || {
        if req.program_name.is_empty() {
            resolve_shell()
        } else {
            req.program_name.clone()
        }
    };

    let program = match (req.commands.is_empty(), req.script.is_empty()) {
        (false, false) => {
            return Err(RunnerError::InvalidRequest(
                "commands and script are mutually exclusive".to_string(),
            ));
        }
        (false, true) => Program::new(
            shell(),
            vec!["-c".to_string(), prepare_script(&req.commands)],
        ),
        (true, false) => Program::new(shell(), vec!["-c".to_string(), req.script.clone()]),
        (true, true) if req.program_name.is_empty() => {
            return Err(RunnerError::InvalidRequest(
                "one of program_name, commands or script is required".to_string(),
            ));
        }
        (true, true) => Program::new(req.program_name.clone(), req.arguments.clone()),
    };

    program
        .in_dir(directory)
        .invocations()
        .into_iter()
        .next()
        .ok_or_else(|| RunnerError::InvalidRequest("nothing to run".to_string()))
}

#[derive(Clone)]
pub struct RunnerServiceImpl {
    sessions: Arc<SessionRegistry>,
    config: ServiceConfig,
}

impl RunnerServiceImpl {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn into_server(self, max_message_size: usize) -> RunnerServiceServer<Self> {
        RunnerServiceServer::new(self)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size)
    }

    async fn start_execution(
        &self,
        mut inbound: Streaming<pb::ExecuteRequest>,
    ) -> Result<Response<ExecuteResponseStream>, Status> {
        let Some(first) = inbound.next().await.transpose()? else {
            debug!("stream closed before the first request");
            let empty: ExecuteResponseStream = Box::pin(tokio_stream::empty());
            return Ok(Response::new(empty));
        };

        let session = if first.session_id.is_empty() {
            Arc::new(Session::anonymous())
        } else {
            self.sessions
                .get(&first.session_id)
                .await
                .map_err(into_status)?
        };
        session.add_envs(&first.envs);

        let invocation = build_invocation(&first).map_err(into_status)?;
        let stdout = Arc::new(RingBuffer::new(self.config.ring_buffer_size));
        let stderr = Arc::new(RingBuffer::new(self.config.ring_buffer_size));

        let mut config = invocation.command_config(Arc::clone(&stdout), Arc::clone(&stderr));
        config.envs = session.env_snapshot();
        config.tty = first.tty;
        config.chunk_size = self.config.chunk_size;
        config.drain_grace = self.config.drain_grace;

        let mut command = Command::start(
            config,
            StartOptions {
                disable_echo: first.tty,
            },
        )
        .map_err(into_status)?;
        info!(
            session_id = %session.id(),
            invocation = %invocation,
            tty = first.tty,
            pid = ?command.pid(),
            "execution started"
        );

        let (tx, mut rx) = mpsc::channel::<Result<pb::ExecuteResponse, Status>>(1);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let stdin = command.take_stdin().map(|writer| (writer, input_rx));
        let relay = Relay {
            inbound,
            input: Some(input_tx),
            tty: first.tty,
            initial_input: first.input_data,
            process: command.handle(),
            cancel: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        let execution = Execution {
            command,
            stdin,
            stdout,
            stderr,
            chunk_size: self.config.chunk_size,
            tx,
        };
        tokio::spawn(execution.drive(relay).in_current_span());

        let output: ExecuteResponseStream = Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        });
        Ok(Response::new(output))
    }
}

type ExecuteResponseStream =
    Pin<Box<dyn Stream<Item = Result<pb::ExecuteResponse, Status>> + Send>>;

#[tonic::async_trait]
impl RunnerService for RunnerServiceImpl {
    type ExecuteStream = ExecuteResponseStream;

    async fn create_session(
        &self,
        req: Request<pb::CreateSessionRequest>,
    ) -> Result<Response<pb::CreateSessionResponse>, Status> {
        let req = req.into_inner();
        let session = self.sessions.create(&req.envs, req.metadata).await;
        Ok(Response::new(pb::CreateSessionResponse {
            session: Some(session_to_proto(&session)),
        }))
    }

    async fn get_session(
        &self,
        req: Request<pb::GetSessionRequest>,
    ) -> Result<Response<pb::GetSessionResponse>, Status> {
        let session = self
            .sessions
            .get(&req.into_inner().id)
            .await
            .map_err(into_status)?;
        Ok(Response::new(pb::GetSessionResponse {
            session: Some(session_to_proto(&session)),
        }))
    }

    async fn list_sessions(
        &self,
        _req: Request<pb::ListSessionsRequest>,
    ) -> Result<Response<pb::ListSessionsResponse>, Status> {
        let sessions = self
            .sessions
            .list()
            .await
            .iter()
            .map(|s| session_to_proto(s))
            .collect();
        Ok(Response::new(pb::ListSessionsResponse { sessions }))
    }

    async fn delete_session(
        &self,
        req: Request<pb::DeleteSessionRequest>,
    ) -> Result<Response<pb::DeleteSessionResponse>, Status> {
        self.sessions
            .delete(&req.into_inner().id)
            .await
            .map_err(into_status)?;
        Ok(Response::new(pb::DeleteSessionResponse {}))
    }

    async fn execute(
        &self,
        req: Request<Streaming<pb::ExecuteRequest>>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let call_id = uuid::Uuid::new_v4().to_string();
        self.start_execution(req.into_inner())
            .instrument(info_span!("execute", %call_id))
            .await
    }
}

/// Writes queued input to the child until the queue closes or a write fails.
/// The relay never awaits this; stop requests must not wait on the pipe.
async fn feed_stdin(mut stdin: StdinWriter, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        if let Err(err) = stdin.write(&data).await {
            warn!(error = %err, "failed to write input");
            return;
        }
    }
    debug!("input closed");
}

/// Client-to-process half of a call: stdin bytes and stop requests.
struct Relay {
    inbound: Streaming<pb::ExecuteRequest>,
    /// Queue drained by [`feed_stdin`]; dropping it closes the child's input.
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    tty: bool,
    initial_input: Vec<u8>,
    process: ProcessHandle,
    /// Set when the client went away while the process was still running.
    cancel: CancellationToken,
    /// Receive error to report instead of the exit code.
    failure: Arc<Mutex<Option<Status>>>,
    stop_requested: Arc<AtomicBool>,
}

impl Relay {
    fn send_input(&mut self, data: Vec<u8>) {
        let Some(input) = &self.input else {
            return;
        };
        if input.send(data).is_err() {
            debug!("stdin closed, dropping input");
            self.input = None;
        }
    }

    async fn run(mut self) {
        let initial = std::mem::take(&mut self.initial_input);
        if !initial.is_empty() {
            self.send_input(initial);
        }
        if !self.tty {
            // Without a terminal the child only ever sees the initial input.
            self.input = None;
        }

        loop {
            let req = match self.inbound.next().await {
                None => {
                    debug!("client finished sending");
                    return;
                }
                Some(Ok(req)) => req,
                Some(Err(status)) if status.code() == Code::Cancelled => {
                    if self.process.has_exited() {
                        debug!("client cancelled after the process exited");
                    } else {
                        info!("client cancelled, stopping process");
                        self.cancel.cancel();
                    }
                    return;
                }
                Some(Err(status)) => {
                    warn!(error = %status, "failed to receive request, killing process");
                    *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
                    if let Err(err) = self.process.kill().await {
                        debug!(error = %err, "kill after receive error");
                    }
                    return;
                }
            };

            if self.tty && !req.input_data.is_empty() {
                self.send_input(req.input_data);
            }

            let signal = match pb::ExecuteStop::try_from(req.stop) {
                Ok(pb::ExecuteStop::Unspecified) => continue,
                Ok(pb::ExecuteStop::Interrupt) => librunner::StopSignal::Interrupt,
                Ok(pb::ExecuteStop::Kill) => librunner::StopSignal::Kill,
                Err(_) => {
                    debug!(stop = req.stop, "ignoring unknown stop value");
                    continue;
                }
            };
            self.stop_requested.store(true, Ordering::Release);
            info!(?signal, "stop requested");
            if let Err(err) = self.process.signal(signal).await {
                debug!(error = %err, "stop request not delivered");
            }
            return;
        }
    }
}

/// Process-to-client half of a call plus the exit bookkeeping.
struct Execution {
    command: Command,
    stdin: Option<(StdinWriter, mpsc::UnboundedReceiver<Vec<u8>>)>,
    stdout: Arc<RingBuffer>,
    stderr: Arc<RingBuffer>,
    chunk_size: usize,
    tx: mpsc::Sender<Result<pb::ExecuteResponse, Status>>,
}

impl Execution {
    async fn drive(mut self, relay: Relay) {
        let cancel = relay.cancel.clone();
        let failure = Arc::clone(&relay.failure);
        let stop_requested = Arc::clone(&relay.stop_requested);
        let process = relay.process.clone();
        let relay_task = tokio::spawn(relay.run().in_current_span());
        let stdin_task = self
            .stdin
            .take()
            .map(|(writer, input)| tokio::spawn(feed_stdin(writer, input).in_current_span()));

        let (results, mut events) = handoff();
        let splitter = tokio::spawn(read_loop(
            Arc::clone(&self.stdout),
            Arc::clone(&self.stderr),
            results,
            self.chunk_size,
        ));

        let forward_tx = self.tx.clone();
        let forward_cancel = cancel.clone();
        let forwarder = tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    let response = match event {
                        Output::Stdout(data) => pb::ExecuteResponse {
                            stdout_data: data,
                            ..Default::default()
                        },
                        Output::Stderr(data) => pb::ExecuteResponse {
                            stderr_data: data,
                            ..Default::default()
                        },
                    };
                    if forward_tx.send(Ok(response)).await.is_err() {
                        debug!("response stream dropped");
                        forward_cancel.cancel();
                        return;
                    }
                }
            }
            .in_current_span(),
        );

        let waited = tokio::select! {
            res = self.command.wait() => Some(res),
            _ = cancel.cancelled() => None,
            _ = self.tx.closed() => None,
        };
        let cancelled = waited.is_none();
        let waited = match waited {
            Some(res) => res,
            None => {
                if let Err(err) = process.kill().await {
                    debug!(error = %err, "kill after cancellation");
                }
                // Nobody reads the rest, so unblock the output pumps.
                self.stdout.close();
                self.stderr.close();
                self.command.wait().await
            }
        };

        relay_task.abort();
        if let Some(task) = stdin_task {
            task.abort();
        }
        let finalized = self.command.finalize().await;
        self.stdout.close();
        self.stderr.close();

        match splitter.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_closed() => debug!("output splitter stopped early"),
            Ok(Err(err)) => warn!(error = %err, "output splitter failed"),
            Err(err) => warn!(error = %err, "output splitter panicked"),
        }
        let _ = forwarder.await;

        if cancelled {
            info!("execution cancelled");
            return;
        }

        let exit = match waited {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = %err, "failed to wait for process");
                let _ = self.tx.send(Err(into_status(err))).await;
                return;
            }
        };
        info!(exit_code = exit.exit_code(), outcome = %exit, "execution finished");

        let failure = failure.lock().unwrap_or_else(PoisonError::into_inner).take();
        let last = final_response(
            exit,
            failure,
            stop_requested.load(Ordering::Acquire),
            finalized,
        );
        let _ = self.tx.send(last).await;
    }
}

fn final_response(
    exit: ExitOutcome,
    failure: Option<Status>,
    stop_requested: bool,
    finalized: Result<(), RunnerError>,
) -> Result<pb::ExecuteResponse, Status> {
    if let Some(status) = failure {
        return Err(status);
    }
    if exit.code.is_none() && !stop_requested {
        return Err(Status::aborted(format!("process {exit}")));
    }
    if exit.success() {
        finalized.map_err(into_status)?;
    }
    Ok(pb::ExecuteResponse {
        exit_code: Some(exit.exit_code()),
        ..Default::default()
    })
}
