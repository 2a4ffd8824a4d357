//! TCP subscriber endpoint.
//!
//! A client connects, sends one line holding a run id, then only receives:
//! one JSON object per line, starting with a snapshot and ending after the
//! run reaches a terminal status. An unknown run id gets a single
//! `{"type":"error","message":...}` line before the connection closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::run::RunManager;

#[derive(Serialize)]
struct ErrorLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a str,
}

pub struct EventServer {
    listener: TcpListener,
    manager: Arc<RunManager>,
}

impl EventServer {
    pub async fn bind(addr: &str, manager: Arc<RunManager>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts subscribers until `cancel` fires. Each connection is served
    /// on its own task.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Event server listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };
            let manager = self.manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, manager, cancel).await {
                    tracing::debug!(peer = %peer, error = %e, "Subscriber connection closed");
                }
            });
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    manager: Arc<RunManager>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let run_id = line.trim();

    let mut events = match manager.subscribe(run_id).await {
        Ok(events) => events,
        Err(e) => {
            let message = e.to_string();
            write_json_line(
                &mut write_half,
                &ErrorLine {
                    kind: "error",
                    message: &message,
                },
            )
            .await?;
            return write_half.shutdown().await;
        }
    };

    tracing::debug!(run_id = %run_id, "Subscriber attached");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        write_json_line(&mut write_half, &event).await?;
    }
    write_half.shutdown().await
}

async fn write_json_line<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes =
        serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderRegistry;
    use crate::scheduler::RateLimiter;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_unknown_run_gets_error_line() {
        let manager = Arc::new(RunManager::new(
            ProviderRegistry::new(),
            Arc::new(RateLimiter::new(10, 1.0)),
        ));
        let server = EventServer::bind("127.0.0.1:0", manager).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(server.serve(cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"no-such-run\n").await.unwrap();
        let mut body = String::new();
        client.read_to_string(&mut body).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value["message"].as_str().unwrap().contains("no-such-run"));

        cancel.cancel();
        serving.await.unwrap().unwrap();
    }
}
