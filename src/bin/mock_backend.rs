//! Local stand-in for the chat backend: token endpoint, chat endpoint and a
//! Centrifugo-style websocket that fans chat messages out to subscribers.
//!
//! Usage: mock_backend [http_port] [ws_port]

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type Hub = Arc<DashMap<String, Vec<mpsc::UnboundedSender<String>>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let http_port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8787);
    let ws_port: u16 = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let hub: Hub = Arc::new(DashMap::new());

    let http_listener = TcpListener::bind(format!("127.0.0.1:{}", http_port)).await?;
    let ws_listener = TcpListener::bind(format!("127.0.0.1:{}", ws_port)).await?;
    println!("Mock backend: http on port {}, websocket on port {}", http_port, ws_port);

    let ws_hub = hub.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = ws_listener.accept().await {
            let hub = ws_hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_websocket(socket, hub).await {
                    eprintln!("Websocket client error: {}", e);
                }
            });
        }
    });

    loop {
        let (socket, _) = http_listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http(req, hub.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(socket), service)
                .await
            {
                eprintln!("Error serving http client: {}", e);
            }
        });
    }
}

async fn handle_http(
    req: Request<Incoming>,
    hub: Hub,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();

    let (status, payload) = match (method, path.as_str()) {
        (Method::GET, "/api/centrifugo-token") => (
            StatusCode::OK,
            json!({ "token": Uuid::new_v4().to_string() }),
        ),
        (Method::POST, "/api/chat") => match publish_chat(&body, &hub) {
            Some(receipt) => (StatusCode::OK, receipt),
            None => (StatusCode::BAD_REQUEST, json!({ "error": "bad chat request" })),
        },
        _ => (StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    };

    let mut resp = Response::new(Full::new(Bytes::from(payload.to_string())));
    *resp.status_mut() = status;
    Ok(resp)
}

#[derive(Deserialize)]
struct ChatBody {
    id: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    parts: Vec<ChatPart>,
}

#[derive(Deserialize)]
struct ChatPart {
    text: String,
}

fn publish_chat(body: &[u8], hub: &Hub) -> Option<Value> {
    let chat: ChatBody = serde_json::from_slice(body).ok()?;
    let text = chat.messages.first()?.parts.first()?.text.clone();
    let channel = format!("chat:{}", chat.id);
    let message_id = Uuid::new_v4().to_string();

    let push = json!({
        "push": {
            "channel": channel,
            "pub": { "data": { "id": message_id, "text": text } }
        }
    })
    .to_string();

    let mut delivered = 0;
    if let Some(mut subscribers) = hub.get_mut(&channel) {
        subscribers.retain(|tx| tx.send(push.clone()).is_ok());
        delivered = subscribers.len();
    }
    println!("Published to {} ({} subscribers)", channel, delivered);

    Some(json!({ "channel": channel, "messageId": message_id }))
}

async fn handle_websocket(
    socket: TcpStream,
    hub: Hub,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(socket).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                if let Some(reply) = answer_command(text.as_str(), &tx, &hub) {
                    ws.send(Message::text(reply)).await?;
                }
            }
            Some(push) = rx.recv() => {
                ws.send(Message::text(push)).await?;
            }
            _ = heartbeat.tick() => {
                ws.send(Message::text("{}".to_string())).await?;
            }
        }
    }

    Ok(())
}

/// Replies to connect and subscribe commands; heartbeat answers get none.
fn answer_command(
    frame: &str,
    tx: &mpsc::UnboundedSender<String>,
    hub: &Hub,
) -> Option<String> {
    let command: Value = serde_json::from_str(frame).ok()?;
    let id = command.get("id")?.as_u64()?;

    if command.get("connect").is_some() {
        return Some(json!({ "id": id, "connect": { "client": Uuid::new_v4().to_string() } }).to_string());
    }

    if let Some(channel) = command
        .get("subscribe")
        .and_then(|s| s.get("channel"))
        .and_then(Value::as_str)
    {
        hub.entry(channel.to_string()).or_default().push(tx.clone());
        return Some(json!({ "id": id, "subscribe": {} }).to_string());
    }

    Some(json!({ "id": id, "error": { "code": 404, "message": "unknown command" } }).to_string())
}
