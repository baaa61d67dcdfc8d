//! Control-socket client.
//!
//! Used by the `ls` and `tail` subcommands to talk to a running supervisor
//! through its UNIX socket. Connections are short-lived: one request, one
//! response (a JSON document for `LIST`, a raw line stream for `TAIL`), then
//! the client hangs up with `EXIT`.

use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessInfo;
use crate::server::Request;

/// Errors from a control-socket client call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to control socket (is a supervisor running here?): {0}")]
    Connect(#[source] std::io::Error),
    #[error("failed to decode server response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A connection to a running supervisor.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Client, ClientError> {
        let stream = UnixStream::connect(socket_path).await.map_err(ClientError::Connect)?;
        Ok(Client { stream })
    }

    async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.stream.write_all(&payload).await?;
        Ok(())
    }

    /// Fetches the process list and renders it as a NAME/PID/UPTIME table.
    pub async fn list(&mut self, out: &mut dyn Write) -> Result<(), ClientError> {
        self.send(&Request::new("LIST")).await?;
        let mut payload = Vec::new();
        self.stream.read_to_end(&mut payload).await?;
        let infos: Vec<ProcessInfo> = serde_json::from_slice(&payload)?;
        render_list(&infos, out)?;
        Ok(())
    }

    /// Follows the output of the named processes, copying it to `out` until
    /// `cancel` fires or the server closes the connection.
    pub async fn tail(
        &mut self,
        names: &[String],
        cancel: CancellationToken,
        out: &mut dyn Write,
    ) -> Result<(), ClientError> {
        self.send(&Request::with_args("TAIL", names.to_vec())).await?;
        let mut chunk = [0u8; 8192];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.stream.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        out.write_all(&chunk[..n])?;
                        out.flush()?;
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }
        Ok(())
    }

    /// Tells the server this client is done and closes the connection.
    pub async fn close(mut self) {
        let _ = self.send(&Request::new("EXIT")).await;
        let _ = self.stream.shutdown().await;
    }
}

fn render_list(infos: &[ProcessInfo], out: &mut dyn Write) -> std::io::Result<()> {
    let name_width =
        infos.iter().map(|i| i.name.len()).chain(["NAME".len()]).max().unwrap_or(0);
    let pid_width =
        infos.iter().map(|i| i.pid.to_string().len()).chain(["PID".len()]).max().unwrap_or(0);

    writeln!(out, "{:<name_width$}  {:<pid_width$}  {}", "NAME", "PID", "UPTIME")?;
    for info in infos {
        writeln!(
            out,
            "{:<name_width$}  {:<pid_width$}  {}",
            info.name,
            info.pid,
            format_uptime(info.uptime)
        )?;
    }
    Ok(())
}

// Renders nanoseconds as 12s / 3m4s / 1h2m3s, rounded to whole seconds.
fn format_uptime(nanos: i64) -> String {
    let total = (nanos.max(0) as u64 + 500_000_000) / 1_000_000_000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    match (hours, minutes) {
        (0, 0) => format!("{}s", seconds),
        (0, _) => format!("{}m{}s", minutes, seconds),
        _ => format!("{}h{}m{}s", hours, minutes, seconds),
    }
}
