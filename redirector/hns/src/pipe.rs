use crate::{Request, Response, Transport};
use std::{io, path::PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Talks to a node-local agent that proxies requests to the host network service.
///
/// Each request opens a new connection and writes the JSON request on a single line terminated
/// by `\n`. The agent must frame the request by that newline rather than by end-of-stream, since
/// a Windows named pipe cannot be half-closed. The JSON response is read until the agent closes
/// the connection. On Windows the address names a pipe; elsewhere it names a Unix socket.
#[derive(Clone, Debug)]
pub struct PipeTransport {
    addr: PathBuf,
}

// === impl PipeTransport ===

impl PipeTransport {
    pub fn new(addr: impl Into<PathBuf>) -> Self {
        Self { addr: addr.into() }
    }

    async fn call(&self, req: &Request) -> io::Result<Response> {
        let mut stream = connect(&self.addr).await?;
        let mut line = serde_json::to_vec(req)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        debug!(bytes = buf.len(), "Read response");
        Ok(serde_json::from_slice(&buf)?)
    }
}

#[async_trait::async_trait]
impl Transport for PipeTransport {
    async fn invoke(&self, req: Request) -> Response {
        match self.call(&req).await {
            Ok(rsp) => rsp,
            Err(error) => Response::error(format!("{}: {}", self.addr.display(), error)),
        }
    }
}

#[cfg(unix)]
async fn connect(addr: &std::path::Path) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(addr).await
}

#[cfg(windows)]
async fn connect(
    addr: &std::path::Path,
) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(addr)
}
