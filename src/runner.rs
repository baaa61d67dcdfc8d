//! Child process execution.
//!
//! A [`ChildProcess`] wraps one OS subprocess: it tokenizes the script,
//! spawns the executable with the configured environment, pumps stdout and
//! stderr into the process's output sink, and waits for termination. On
//! cancellation the child receives SIGINT; if it has not exited when the
//! interrupt timeout expires it is killed.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::decorator::LineBuffer;
use crate::events::Termination;
use crate::output::Sink;
use crate::process::{ProcessInfo, ProcessSpec};
use crate::script;

/// Grace period between SIGINT and SIGKILL.
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One supervised OS subprocess.
pub struct ChildProcess {
    spec: ProcessSpec,
    interrupt_timeout: Duration,
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    pid: Option<u32>,
    started_at: Option<Instant>,
}

impl ChildProcess {
    pub fn new(spec: ProcessSpec, interrupt_timeout: Duration) -> Self {
        ChildProcess {
            spec,
            interrupt_timeout,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// PID and uptime of the running process. PID is -1 when the process is
    /// not currently running.
    pub fn info(&self) -> ProcessInfo {
        let state = self.state.lock();
        ProcessInfo {
            name: self.spec.name.clone(),
            pid: state.pid.map(i64::from).unwrap_or(-1),
            uptime: state
                .started_at
                .map(|t| t.elapsed().as_nanos().min(i64::MAX as u128) as i64)
                .unwrap_or(0),
        }
    }

    /// Runs the child to termination, feeding its output into `sink`. Always
    /// returns a terminal status; errors along the way (tokenization, spawn,
    /// wait) are folded into [`Termination::Failed`].
    pub async fn run(&self, cancel: CancellationToken, sink: Arc<Sink>) -> Termination {
        let command_line = match script::parse_command(&self.spec.script, &self.spec.env) {
            Ok(command_line) => command_line,
            Err(err) => return Termination::Failed { error: err.to_string() },
        };

        tracing::debug!(
            process = %self.spec.name,
            argv = ?command_line.argv,
            "starting process"
        );

        let mut command = Command::new(&command_line.argv[0]);
        command.args(&command_line.argv[1..]);
        command.env_clear();
        command.envs(self.spec.env.iter());
        command.envs(command_line.env_overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        // Children get their own process group so signals can be delivered
        // to everything they fork.
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Termination::Failed { error: format!("failed to start: {}", err) }
            }
        };

        {
            let mut state = self.state.lock();
            state.pid = child.id();
            state.started_at = Some(Instant::now());
        }

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Arc::clone(&sink))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Arc::clone(&sink))));
        }

        let termination = tokio::select! {
            status = child.wait() => classify(status),
            _ = cancel.cancelled() => self.interrupt(&mut child).await,
        };

        // let the pumps drain whatever the child wrote before it died
        for pump in pumps {
            let _ = pump.await;
        }

        let mut state = self.state.lock();
        state.pid = None;
        state.started_at = None;

        termination
    }

    // SIGINT, then SIGKILL once the grace period runs out. A child that is
    // already gone makes the signal a no-op and the wait return immediately.
    async fn interrupt(&self, child: &mut Child) -> Termination {
        tracing::debug!(process = %self.spec.name, "sending interrupt signal");
        if let Some(pid) = child.id() {
            send_signal(pid, libc::SIGINT);
        }

        match tokio::time::timeout(self.interrupt_timeout, child.wait()).await {
            Ok(Ok(_)) => Termination::Interrupted,
            Ok(Err(err)) => Termination::Failed { error: format!("wait failed: {}", err) },
            Err(_) => {
                tracing::warn!(process = %self.spec.name, "process ignored interrupt, killing it");
                if let Some(pid) = child.id() {
                    send_signal(pid, libc::SIGKILL);
                }
                match child.wait().await {
                    Ok(_) => Termination::Interrupted,
                    Err(err) => Termination::Failed { error: format!("wait failed: {}", err) },
                }
            }
        }
    }
}

fn classify(status: io::Result<ExitStatus>) -> Termination {
    match status {
        Ok(status) if status.success() => Termination::Succeeded,
        Ok(status) => match status.signal() {
            // children share the foreground process group, so an interrupt
            // may reach them before ours does
            Some(libc::SIGINT) | Some(libc::SIGTERM) => Termination::Interrupted,
            Some(signal) => Termination::Failed { error: format!("terminated by signal {}", signal) },
            None => Termination::Failed {
                error: format!("exit status {}", status.code().unwrap_or(1)),
            },
        },
        Err(err) => Termination::Failed { error: format!("wait failed: {}", err) },
    }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        let pid = pid as libc::pid_t;
        // the group first, then the process itself in case it left the group
        let _ = libc::kill(-pid, signal);
        let _ = libc::kill(pid, signal);
    }
}

async fn pump<R>(mut reader: R, sink: Arc<Sink>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in buffer.feed(&chunk[..n]) {
                    sink.write_line(&line);
                }
            }
        }
    }
}
