//! Control-socket server.
//!
//! While the supervisor runs, a UNIX-domain socket accepts short-lived
//! client connections. Messages are JSON objects; the decoder stops at the
//! closing brace, so framing needs no delimiter. Clients can list running
//! processes (`LIST`), follow the output of a subset of them (`TAIL`), or
//! hang up (`EXIT`). Protocol errors only ever terminate the offending
//! connection, never the supervisor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::process::ProcessSpec;
use crate::supervisor::{Registry, Supervisor};

/// One framed control message.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Args", default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Request { command: command.to_string(), args: Vec::new() }
    }

    pub fn with_args(command: &str, args: Vec<String>) -> Self {
        Request { command: command.to_string(), args }
    }
}

/// Errors on a single control connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Wraps a [`Supervisor`] and exposes it on a UNIX socket for the lifetime
/// of one run.
pub struct Server {
    socket_path: PathBuf,
    supervisor: Supervisor,
}

impl Server {
    pub fn new(socket_path: impl Into<PathBuf>, supervisor: Supervisor) -> Self {
        Server { socket_path: socket_path.into(), supervisor }
    }

    /// Opens the control socket and runs the supervisor. The listener and
    /// every accepted connection are closed when the run finishes or
    /// `cancel` fires; the socket file is removed on the way out.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        specs: Vec<ProcessSpec>,
    ) -> anyhow::Result<()> {
        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!("failed to open control socket {}", self.socket_path.display())
        })?;
        debug!(path = %self.socket_path.display(), "control socket listening");

        let connections = cancel.child_token();
        let accept = tokio::spawn(accept_loop(
            listener,
            self.supervisor.registry(),
            connections.clone(),
        ));

        let result = self.supervisor.run(cancel, specs).await;

        // subscriber connections go first, then the listener and the socket
        // file; the sinks they point into were cleared by the run already
        connections.cancel();
        let _ = accept.await;
        let _ = std::fs::remove_file(&self.socket_path);

        result.map_err(Into::into)
    }
}

async fn accept_loop(listener: UnixListener, registry: Arc<Registry>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&registry);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, registry, cancel).await {
                            Ok(()) | Err(ProtocolError::ConnectionClosed) => {
                                debug!("control client disconnected");
                            }
                            Err(err) => warn!(error = %err, "control connection failed"),
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept control connection"),
            },
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = Vec::new();

    let request = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        request = read_message(&mut reader, &mut buf) => request?,
    };
    debug!(command = %request.command, args = ?request.args, "received control command");

    match request.command.as_str() {
        "LIST" => {
            let payload = serde_json::to_vec(&registry.infos())?;
            writer.write_all(&payload).await?;
            writer.shutdown().await?;
            Ok(())
        }
        "TAIL" => handle_tail(request.args, reader, writer, buf, registry, cancel).await,
        "EXIT" => Ok(()),
        other => {
            error!(command = %other, "unknown command from control client");
            Ok(())
        }
    }
}

async fn handle_tail(
    names: Vec<String>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut buf: Vec<u8>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    // resolve every name before touching any fan-out; an unknown name
    // installs nothing
    let mut sinks = Vec::with_capacity(names.len());
    for name in &names {
        match registry.sink(name) {
            Some(sink) => sinks.push(sink),
            None => {
                warn!(process = %name, "tail requested for unknown process");
                let _ = writer.write_all(format!("unknown process {:?}\n", name).as_bytes()).await;
                return Ok(());
            }
        }
    }

    let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for sink in &sinks {
        sink.subscribe(id, tx.clone());
    }
    drop(tx);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            line = rx.recv() => match line {
                Some(line) => {
                    if let Err(err) = writer.write_all(line.as_bytes()).await {
                        break Err(err.into());
                    }
                }
                None => break Ok(()),
            },
            request = read_message(&mut reader, &mut buf) => match request {
                Ok(request) if request.command == "EXIT" => break Ok(()),
                Ok(request) => {
                    error!(command = %request.command, "unexpected command during tail");
                    break Ok(());
                }
                Err(ProtocolError::ConnectionClosed) => break Ok(()),
                Err(err) => break Err(err),
            },
        }
    };

    for sink in &sinks {
        sink.unsubscribe(id);
    }
    result
}

/// Reads one JSON-framed message. Bytes past the closing brace stay in `buf`
/// for the next call, so the framing is newline-agnostic. Cancel-safe: a
/// partially buffered message survives the future being dropped.
pub async fn read_message<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(request) = try_parse(buf)? {
            return Ok(request);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_parse(buf: &mut Vec<u8>) -> Result<Option<Request>, ProtocolError> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Request>();
    match stream.next() {
        Some(Ok(request)) => {
            let consumed = stream.byte_offset();
            buf.drain(..consumed);
            Ok(Some(request))
        }
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(ProtocolError::Malformed(err)),
        None => Ok(None),
    }
}
