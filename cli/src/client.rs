//! WebSocket client for talking to a running daemon.

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::Value;
use serde_json::json;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use outpost_protocol::Frame;
use outpost_protocol::PROTOCOL_VERSION;
use outpost_protocol::RequestFrame;
use outpost_protocol::RequestId;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WireClient {
    ws: WsStream,
    next_id: i64,
}

impl WireClient {
    /// Dial the daemon and authenticate. Returns the client plus the hello
    /// payload.
    pub async fn connect(url: &str, token: &str) -> anyhow::Result<(Self, Value)> {
        let (ws, _response) = connect_async(url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let mut client = Self { ws, next_id: 0 };

        let hello = client
            .call(
                "connect",
                json!({
                    "token": token,
                    "client": { "name": "outpost-cli", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await
            .map_err(|err| anyhow!("authentication failed: {err}"))?;

        let protocol = hello["protocol"].as_u64().unwrap_or(0) as u32;
        if protocol != PROTOCOL_VERSION {
            bail!("protocol mismatch: server speaks {protocol}, client speaks {PROTOCOL_VERSION}");
        }
        Ok((client, hello))
    }

    /// Send one request and wait for its response, narrating events that
    /// arrive in between to stderr.
    pub async fn call(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = Frame::Req(RequestFrame {
            id: RequestId::Integer(id),
            method: method.to_string(),
            params: Some(params),
        });
        let text = serde_json::to_string(&frame)?;
        self.ws.send(Message::Text(text.into())).await?;

        loop {
            let Some(message) = self.ws.next().await else {
                bail!("connection closed before a response arrived");
            };
            let Message::Text(text) = message? else {
                continue;
            };
            let frame: Frame = match serde_json::from_str(text.as_str()) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!("ignoring unparseable frame: {err}");
                    continue;
                }
            };
            match frame {
                Frame::Event(event) => {
                    eprintln!(
                        "event {} #{}: {}",
                        event.event,
                        event.seq,
                        serde_json::to_string(&event.payload).unwrap_or_default()
                    );
                }
                Frame::Res(res) if res.id == Some(RequestId::Integer(id)) => {
                    if res.ok {
                        return Ok(res.payload.unwrap_or(Value::Null));
                    }
                    let error = res
                        .error
                        .ok_or_else(|| anyhow!("failed response without an error object"))?;
                    bail!("{}: {}", error.code, error.message);
                }
                Frame::Res(_) | Frame::Req(_) => {}
            }
        }
    }
}
