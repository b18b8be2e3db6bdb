//! Units of work that can either be run or previewed.
//!
//! An [`Executable`] only describes what it would run, as a list of
//! [`Invocation`]s. [`execute`] walks that list in either [`Mode`], so a dry
//! run always prints exactly what a real run would start.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::{Command, CommandConfig, StartOptions};
use crate::error::RunnerError;
use crate::rbuffer::RingBuffer;

const FALLBACK_SHELL: &str = "/bin/sh";

/// Shell from `$SHELL`, or `/bin/sh` when unset or empty.
pub fn resolve_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|sh| !sh.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Join `commands` into one script that stops at the first failing line.
pub fn prepare_script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    script.push_str(&commands.join("\n"));
    script
}

/// One process start: what runs, where, and how to show it to a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub directory: Option<PathBuf>,
    pub display: String,
}

impl Invocation {
    pub fn command_config(
        &self,
        stdout: Arc<RingBuffer>,
        stderr: Arc<RingBuffer>,
    ) -> CommandConfig {
        let mut config =
            CommandConfig::new(self.program.clone(), self.args.clone(), stdout, stderr);
        config.directory = self.directory.clone();
        config
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = self
            .directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        write!(f, "{} in {}: {}", self.program, dir, self.display)
    }
}

pub trait Executable: Send + Sync {
    fn invocations(&self) -> Vec<Invocation>;
}

/// A program started directly with its arguments.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub args: Vec<String>,
    pub directory: Option<PathBuf>,
}

impl Program {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            directory: None,
        }
    }

    pub fn in_dir(mut self, directory: Option<PathBuf>) -> Self {
        self.directory = directory;
        self
    }
}

impl Executable for Program {
    fn invocations(&self) -> Vec<Invocation> {
        vec![Invocation {
            program: self.name.clone(),
            args: self.args.clone(),
            directory: self.directory.clone(),
            display: self.args.join(" "),
        }]
    }
}

/// Shell commands, each run as its own `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct Shell {
    pub shell: String,
    pub directory: Option<PathBuf>,
    pub commands: Vec<String>,
}

impl Shell {
    pub fn new(directory: Option<PathBuf>, commands: Vec<String>) -> Self {
        Self::with_shell(resolve_shell(), directory, commands)
    }

    pub fn with_shell(
        shell: impl Into<String>,
        directory: Option<PathBuf>,
        commands: Vec<String>,
    ) -> Self {
        Self {
            shell: shell.into(),
            directory,
            commands,
        }
    }
}

impl Executable for Shell {
    fn invocations(&self) -> Vec<Invocation> {
        self.commands
            .iter()
            .map(|cmd| Invocation {
                program: self.shell.clone(),
                args: vec!["-c".to_string(), cmd.clone()],
                directory: self.directory.clone(),
                display: cmd.clone(),
            })
            .collect()
    }
}

/// Where a real run sends its output.
pub struct ExecIo {
    pub stdout: Arc<RingBuffer>,
    pub stderr: Arc<RingBuffer>,
    /// Extra environment applied to every invocation.
    pub envs: Vec<(String, String)>,
    /// Fed to the first invocation's stdin.
    pub input: Vec<u8>,
}

pub enum Mode<'a> {
    Run(ExecIo),
    DryRun(&'a mut (dyn Write + Send)),
}

/// Run or preview `exe`. A run stops at the first invocation that does not
/// exit with 0; cancelling `cancel` kills whatever is running.
pub async fn execute(
    exe: &dyn Executable,
    mode: Mode<'_>,
    cancel: &CancellationToken,
) -> Result<(), RunnerError> {
    let invocations = exe.invocations();
    match mode {
        Mode::DryRun(out) => {
            for inv in &invocations {
                writeln!(out, "{inv}")?;
            }
            Ok(())
        }
        Mode::Run(io) => {
            let mut input = Some(io.input);
            for inv in invocations {
                run_one(&inv, &io.stdout, &io.stderr, &io.envs, input.take(), cancel).await?;
            }
            Ok(())
        }
    }
}

async fn run_one(
    inv: &Invocation,
    stdout: &Arc<RingBuffer>,
    stderr: &Arc<RingBuffer>,
    envs: &[(String, String)],
    input: Option<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<(), RunnerError> {
    if cancel.is_cancelled() {
        return Err(RunnerError::Cancelled);
    }
    let mut config = inv.command_config(Arc::clone(stdout), Arc::clone(stderr));
    config.envs = envs.to_vec();

    info!(invocation = %inv, "running");
    let mut cmd = Command::start(config, StartOptions::default())?;
    // Cancel must not wait on the pipe. Without input, stdin is dropped here
    // and the child sees EOF.
    let feeder = cmd
        .take_stdin()
        .zip(input.filter(|d| !d.is_empty()))
        .map(|(mut stdin, data)| {
            tokio::spawn(async move {
                if let Err(err) = stdin.write(&data).await {
                    debug!(error = %err, "failed to write input");
                }
            })
        });

    let outcome = tokio::select! {
        res = cmd.wait() => res,
        _ = cancel.cancelled() => {
            debug!(invocation = %inv, "cancelled, killing");
            if let Err(err) = cmd.handle().kill().await {
                debug!(error = %err, "kill after cancel");
            }
            Err(RunnerError::Cancelled)
        }
    };
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(RunnerError::Cancelled) => {
            cmd.wait().await?;
            cmd.finalize().await?;
            return Err(RunnerError::Cancelled);
        }
        Err(err) => return Err(err),
    };
    cmd.finalize().await?;

    if !outcome.success() {
        return Err(RunnerError::CommandFailed {
            command: inv.display.clone(),
            code: outcome.exit_code(),
        });
    }
    Ok(())
}
