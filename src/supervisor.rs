//! The supervisor run loop.
//!
//! Starts every configured process, multiplexes their output through one
//! [`OutputHub`], and waits for termination events. The stack is fail-fast:
//! the first process that fails cancels all remaining children, and the run
//! returns that first failure once everything has wound down.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{Termination, TerminationEvent};
use crate::output::{OutputHub, Sink, Terminal};
use crate::process::{validate_all, ProcessInfo, ProcessSpec, ValidationError};
use crate::runner::{ChildProcess, DEFAULT_INTERRUPT_TIMEOUT};

/// Why a supervisor run ended with an error.
#[derive(Debug, Error)]
pub enum RunError {
    /// The process set failed validation; nothing was started.
    #[error("{0}")]
    Validation(#[from] ValidationError),
    /// A process failed; this is the first failure of the run.
    #[error("process {name}: {error}")]
    ProcessFailed { name: String, error: String },
}

/// Live process and sink state, shared with the control server.
#[derive(Default)]
pub struct Registry {
    processes: Mutex<BTreeMap<String, Arc<ChildProcess>>>,
    sinks: Mutex<BTreeMap<String, Arc<Sink>>>,
}

impl Registry {
    /// Snapshot of all live processes, sorted by name.
    pub fn infos(&self) -> Vec<ProcessInfo> {
        self.processes.lock().values().map(|child| child.info()).collect()
    }

    pub fn sink(&self, name: &str) -> Option<Arc<Sink>> {
        self.sinks.lock().get(name).cloned()
    }

    fn insert(&self, name: &str, child: Arc<ChildProcess>, sink: Arc<Sink>) {
        self.processes.lock().insert(name.to_string(), child);
        self.sinks.lock().insert(name.to_string(), sink);
    }

    fn remove_process(&self, name: &str) {
        self.processes.lock().remove(name);
    }

    fn clear(&self) {
        self.processes.lock().clear();
        self.sinks.lock().clear();
    }
}

/// Runs a set of processes to completion, interrupting the rest as soon as
/// one fails.
pub struct Supervisor {
    no_color: bool,
    interrupt_timeout: Duration,
    terminal: Terminal,
    registry: Arc<Registry>,
}

impl Supervisor {
    /// A supervisor writing to stdout.
    pub fn new(no_color: bool) -> Self {
        Supervisor::with_writer(no_color, Box::new(io::stdout()))
    }

    /// A supervisor writing to the given terminal writer.
    pub fn with_writer(no_color: bool, writer: Box<dyn Write + Send>) -> Self {
        Supervisor {
            no_color,
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
            terminal: Arc::new(Mutex::new(writer)),
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.interrupt_timeout = timeout;
        self
    }

    /// The registry the control server reads process info and sinks from.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Validates and runs all processes. Returns after every started child
    /// has posted its termination event. Cancelling `cancel` interrupts all
    /// children; that alone is not an error.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        specs: Vec<ProcessSpec>,
    ) -> Result<(), RunError> {
        validate_all(&specs)?;

        let hub = OutputHub::new(&specs, self.no_color, Arc::clone(&self.terminal));
        let log = hub.log_sink();

        let mut children = Vec::with_capacity(specs.len());
        for spec in &specs {
            let child = Arc::new(ChildProcess::new(spec.clone(), self.interrupt_timeout));
            let sink = hub.sink_for(spec);
            self.registry.insert(&spec.name, Arc::clone(&child), Arc::clone(&sink));
            children.push((child, sink));
        }

        tracing::debug!(amount = children.len(), "starting processes");

        // sized so every runner can post its one event without blocking
        let (tx, mut rx) = mpsc::channel(children.len().max(1));
        let stop = cancel.child_token();
        let mut runners = Vec::with_capacity(children.len());
        for (child, sink) in &children {
            let child = Arc::clone(child);
            let sink = Arc::clone(sink);
            let tx = tx.clone();
            let stop = stop.clone();
            let name = child.name().to_string();
            let handle = tokio::spawn(async move {
                // the child runs in its own task so a panic in the runner is
                // caught here and posted as a failure instead of silently
                // dropping the termination event
                let run = tokio::spawn({
                    let child = Arc::clone(&child);
                    async move { child.run(stop, sink).await }
                });
                let termination = match run.await {
                    Ok(termination) => termination,
                    Err(err) => Termination::Failed { error: err.to_string() },
                };
                let name = child.name().to_string();
                let _ = tx.send(TerminationEvent { name, termination }).await;
            });
            runners.push((name, handle));
        }
        drop(tx);

        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            let log = log.clone();
            async move {
                cancel.cancelled().await;
                log.write_line("received interrupt signal");
            }
        });

        let mut first_error: Option<(String, String)> = None;
        let mut record_failure = |name: String, error: String| {
            if first_error.is_none() {
                log.write_line(&format!("stopped due to error in process {}: {}", name, error));
                first_error = Some((name, error));
                stop.cancel();
            } else {
                tracing::warn!(process = %name, error = %error, "process failed during shutdown");
            }
        };

        let mut received = 0;
        while received < children.len() {
            let Some(event) = rx.recv().await else {
                break;
            };
            received += 1;
            self.registry.remove_process(&event.name);
            match event.termination {
                Termination::Succeeded => {
                    tracing::debug!(process = %event.name, "process finished successfully");
                }
                Termination::Interrupted => {
                    tracing::info!(process = %event.name, "process was interrupted");
                }
                Termination::Failed { error } => record_failure(event.name, error),
            }
        }

        // The channel closing early means a runner task died without posting
        // its event, i.e. it panicked. That is a process failure, not a
        // clean finish.
        if received < children.len() {
            for (name, handle) in runners {
                if let Err(err) = handle.await {
                    self.registry.remove_process(&name);
                    record_failure(name, err.to_string());
                }
            }
        }

        watcher.abort();
        self.registry.clear();

        match first_error {
            Some((name, error)) => Err(RunError::ProcessFailed { name, error }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use crate::output::test_support::SharedBuf;
    use std::time::Instant;

    fn spec(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, script, Environment::system())
    }

    fn supervisor(buf: &SharedBuf) -> Supervisor {
        Supervisor::with_writer(true, Box::new(buf.clone()))
            .with_interrupt_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn runs_a_single_process_to_completion() {
        let buf = SharedBuf::new();
        let result = supervisor(&buf)
            .run(CancellationToken::new(), vec![spec("echo", r"printf 'hello\nworld\n'")])
            .await;

        assert!(result.is_ok());
        let output = buf.contents();
        assert!(output.contains("echo     │ hello\n"), "{}", output);
        assert!(output.contains("echo     │ world\n"), "{}", output);
    }

    #[tokio::test]
    async fn json_output_is_detected_and_decorated() {
        let buf = SharedBuf::new();
        let script = r#"printf '{"level":"info","message":"hello","k":1}\n{"level":"error","message":"bad"}\n'"#;
        let result = supervisor(&buf).run(CancellationToken::new(), vec![spec("svc", script)]).await;

        assert!(result.is_ok());
        let output = buf.contents();
        assert!(output.contains("svc      │ [INFO]\thello\t{ \"k\": 1 }\n"), "{}", output);
        assert!(output.contains("[ERROR]\tbad"), "{}", output);
    }

    #[tokio::test]
    async fn a_failing_process_stops_the_stack() {
        let buf = SharedBuf::new();
        let started = Instant::now();
        let result = supervisor(&buf)
            .run(
                CancellationToken::new(),
                vec![spec("a", "sleep 10"), spec("b", "sh -c 'echo boom && exit 2'")],
            )
            .await;

        match result {
            Err(RunError::ProcessFailed { name, error }) => {
                assert_eq!(name, "b");
                assert_eq!(error, "exit status 2");
            }
            other => panic!("expected process failure, got {:?}", other),
        }
        // `a` was interrupted rather than waited for
        assert!(started.elapsed() < Duration::from_secs(8));

        let output = buf.contents();
        assert!(output.contains("b        │ boom\n"), "{}", output);
        assert!(
            output.contains("muxrun   │ stopped due to error in process b: exit status 2\n"),
            "{}",
            output
        );
    }

    #[tokio::test]
    async fn validation_failures_start_nothing() {
        let buf = SharedBuf::new();
        let result = supervisor(&buf)
            .run(CancellationToken::new(), vec![spec("", "echo hi"), spec("ok", "echo hi")])
            .await;

        assert!(matches!(result, Err(RunError::Validation(_))));
        assert_eq!(buf.contents(), "");
    }

    #[tokio::test]
    async fn external_cancellation_is_not_an_error() {
        let buf = SharedBuf::new();
        let cancel = CancellationToken::new();
        let handle = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            handle.cancel();
        });

        let result = supervisor(&buf).run(cancel, vec![spec("worker", "sleep 10")]).await;
        assert!(result.is_ok());
        assert!(buf.contents().contains("muxrun   │ received interrupt signal\n"), "{}", buf.contents());
    }

    #[tokio::test]
    async fn only_the_first_failure_is_returned() {
        let buf = SharedBuf::new();
        let result = supervisor(&buf)
            .run(
                CancellationToken::new(),
                vec![
                    spec("fast", "sh -c 'exit 2'"),
                    spec("slow", "sh -c 'sleep 0.5 && exit 7'"),
                ],
            )
            .await;

        match result {
            Err(RunError::ProcessFailed { name, error }) => {
                assert_eq!(name, "fast");
                assert_eq!(error, "exit status 2");
            }
            other => panic!("expected process failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tokenize_errors_become_process_failures() {
        let buf = SharedBuf::new();
        let result = supervisor(&buf)
            .run(CancellationToken::new(), vec![spec("redir", "echo hi > /tmp/x")])
            .await;

        match result {
            Err(RunError::ProcessFailed { name, error }) => {
                assert_eq!(name, "redir");
                assert!(error.contains("unsupported shell character"), "{}", error);
            }
            other => panic!("expected process failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn registry_reports_running_processes() {
        let buf = SharedBuf::new();
        let supervisor = Arc::new(supervisor(&buf));
        let registry = supervisor.registry();
        let cancel = CancellationToken::new();

        let runner = {
            let supervisor = Arc::clone(&supervisor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                supervisor.run(cancel, vec![spec("b", "sleep 5"), spec("a", "sleep 5")]).await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        let infos = registry.infos();
        assert_eq!(infos.len(), 2);
        // sorted by name
        assert_eq!(infos[0].name, "a");
        assert_eq!(infos[1].name, "b");
        for info in &infos {
            assert!(info.pid > 0, "{:?}", info);
            assert!(info.uptime > 0, "{:?}", info);
        }

        cancel.cancel();
        let result = runner.await.unwrap();
        assert!(result.is_ok());
        assert!(registry.infos().is_empty());
    }
}
