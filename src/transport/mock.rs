//! Scripted in-memory transports for exercising sessions without a backend.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::frames;
use super::{Connector, Frame, Transport};
use crate::error::{Result, StressError};

/// What the test pushes into an open connection.
#[derive(Debug)]
pub(crate) enum Feed {
    Frame(String),
    Close,
}

/// How the fake server answers handshake commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ack {
    Reply,
    /// Replies, and packs one publication into the subscribe reply frame.
    Batched,
    Reject,
    Silent,
}

pub(crate) enum Script {
    Refuse,
    Accept(MockLink),
}

pub(crate) struct MockLink {
    feed: mpsc::UnboundedReceiver<Feed>,
    ack: Ack,
    stall_writes: bool,
}

impl MockLink {
    pub(crate) fn new(ack: Ack) -> (Self, mpsc::UnboundedSender<Feed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                feed: rx,
                ack,
                stall_writes: false,
            },
            tx,
        )
    }

    /// Pings and non-command writes never complete, like a peer that
    /// stopped draining its socket.
    pub(crate) fn stalled(mut self) -> Self {
        self.stall_writes = true;
        self
    }
}

/// Observations shared by every transport a connector hands out.
#[derive(Debug, Default)]
pub(crate) struct Wire {
    pub(crate) sent: Mutex<Vec<String>>,
    pub(crate) pings: AtomicUsize,
    pub(crate) connects: AtomicUsize,
    pub(crate) closes: AtomicUsize,
}

impl Wire {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Hands out scripted connections in order; refuses once the script runs out.
pub(crate) struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    pub(crate) wire: Arc<Wire>,
}

impl ScriptedConnector {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            wire: Arc::new(Wire::default()),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.wire.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(Script::Accept(link)) => Ok(Box::new(MockTransport {
                queued: VecDeque::new(),
                link,
                wire: self.wire.clone(),
            })),
            Some(Script::Refuse) | None => {
                Err(StressError::Connect("connection refused".to_string()))
            }
        }
    }
}

struct MockTransport {
    queued: VecDeque<Frame>,
    link: MockLink,
    wire: Arc<Wire>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        let id = frames::command_id(text);
        if id.is_none() && self.link.stall_writes {
            std::future::pending::<()>().await;
        }
        self.wire.sent.lock().unwrap().push(text.to_string());

        if let Some(id) = id {
            if self.link.ack == Ack::Batched && text.contains("\"subscribe\"") {
                let reply = serde_json::json!({"id": id, "subscribe": {}});
                let push = serde_json::json!({"push": {"pub": {"data": "queued"}}});
                self.queued
                    .push_back(Frame::Text(format!("{}\n{}", reply, push)));
                return Ok(());
            }
            let reply = match self.link.ack {
                Ack::Reply | Ack::Batched => Some(serde_json::json!({"id": id, "result": {}})),
                Ack::Reject => Some(serde_json::json!({
                    "id": id,
                    "error": {"code": 100, "message": "internal server error"}
                })),
                Ack::Silent => None,
            };
            if let Some(reply) = reply {
                self.queued.push_back(Frame::Text(reply.to_string()));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.queued.pop_front() {
            return Ok(Some(frame));
        }
        match self.link.feed.recv().await {
            Some(Feed::Frame(text)) => Ok(Some(Frame::Text(text))),
            Some(Feed::Close) | None => Ok(None),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.wire.pings.fetch_add(1, Ordering::SeqCst);
        if self.link.stall_writes {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.wire.closes.fetch_add(1, Ordering::SeqCst);
    }
}
