//! WebSocket harness for talking to a beach-lookout gateway.
//!
//! Used by the server's `send` debug subcommand and by the end-to-end tests;
//! both need to push a command and read envelopes back until the terminal one.

use std::time::Duration;

use beach_lookout_core::{encode_command, ClientEnvelope, ServerEnvelope};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        source: tungstenite::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),
    #[error("server sent an invalid envelope {frame:?}: {source}")]
    Decode {
        frame: String,
        source: serde_json::Error,
    },
    #[error("connection closed before a terminal envelope")]
    Closed,
    #[error("no terminal envelope within {0:?}")]
    Timeout(Duration),
}

/// Everything one command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub output: Vec<String>,
    pub terminal: ServerEnvelope,
}

impl Transcript {
    pub fn succeeded(&self) -> bool {
        matches!(self.terminal, ServerEnvelope::Finished(_))
    }
}

pub struct LookoutClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl LookoutClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with_timeout(url, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(url: &str, limit: Duration) -> Result<Self, ClientError> {
        debug!(%url, "connecting to gateway");
        match timeout(limit, connect_async(url)).await {
            Ok(Ok((stream, _))) => Ok(Self { stream }),
            Ok(Err(source)) => Err(ClientError::Connect {
                url: url.to_string(),
                source,
            }),
            Err(_) => Err(ClientError::ConnectTimeout(url.to_string())),
        }
    }

    /// `base` is the gateway's `/ws` endpoint; an empty or missing target
    /// runs commands on the gateway host itself.
    pub fn url_for(base: &str, target: Option<&str>) -> String {
        match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => format!("{base}?target={target}"),
            None => base.to_string(),
        }
    }

    pub async fn send_command(&mut self, command: &str) -> Result<(), ClientError> {
        let envelope = ClientEnvelope::command(&encode_command(command));
        let text = serde_json::to_string(&envelope).map_err(ClientError::Encode)?;
        self.send_text(&text).await
    }

    /// Sends a raw text frame, bypassing envelope construction.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next server envelope, or `None` once the server has closed.
    pub async fn next_envelope(&mut self) -> Result<Option<ServerEnvelope>, ClientError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => {
                    let envelope = serde_json::from_str(text.as_str()).map_err(|source| {
                        ClientError::Decode {
                            frame: text.to_string(),
                            source,
                        }
                    })?;
                    return Ok(Some(envelope));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Reads until a `finished` or `error` envelope, keeping output lines.
    pub async fn collect_until_terminal(
        &mut self,
        limit: Duration,
    ) -> Result<Transcript, ClientError> {
        let deadline = Instant::now() + limit;
        let mut output = Vec::new();
        loop {
            let next = tokio::time::timeout_at(deadline, self.next_envelope())
                .await
                .map_err(|_| ClientError::Timeout(limit))??;
            match next {
                Some(ServerEnvelope::Output(line)) => output.push(line),
                Some(terminal) => return Ok(Transcript { output, terminal }),
                None => return Err(ClientError::Closed),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test_timeout::timeout]
    fn target_becomes_a_query_parameter() {
        let base = "ws://127.0.0.1:8080/ws";
        assert_eq!(LookoutClient::url_for(base, None), base);
        assert_eq!(LookoutClient::url_for(base, Some(" ")), base);
        assert_eq!(
            LookoutClient::url_for(base, Some("db01")),
            "ws://127.0.0.1:8080/ws?target=db01"
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn collects_output_until_the_terminal_envelope() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected a command frame");
            };
            let envelope: ClientEnvelope = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(envelope.command, encode_command("ls /"));

            for reply in [
                ServerEnvelope::Output("bin".into()),
                ServerEnvelope::Output("etc".into()),
                ServerEnvelope::Finished("done".into()),
            ] {
                let text = serde_json::to_string(&reply).unwrap();
                ws.send(Message::Text(text.into())).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });

        let mut client = LookoutClient::connect(&format!("ws://{addr}")).await.unwrap();
        client.send_command("ls /").await.unwrap();
        let transcript = client
            .collect_until_terminal(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transcript.output, vec!["bin".to_string(), "etc".to_string()]);
        assert!(transcript.succeeded());
        assert!(client.next_envelope().await.unwrap().is_none());
        server.await.unwrap();
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = match LookoutClient::connect(&format!("ws://{addr}/ws")).await {
            Ok(_) => panic!("nothing is listening"),
            Err(err) => err,
        };
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
