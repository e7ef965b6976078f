//! Scripted in-memory bus for tests

use super::{
    BusReply, CommandOutcome, CommandStatus, PendingCommand, ReplyCode, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, oneshot};

/// What the mock does with one issued command
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    bodies: Vec<Value>,
    failed: bool,
    hang: bool,
    release: bool,
    emit: Vec<(String, Value)>,
}
impl Scripted {
    /// Completes with the given reply bodies
    pub fn done(bodies: Vec<Value>) -> Self {
        Self {
            bodies,
            ..Default::default()
        }
    }
    /// Completes with no reply body
    pub fn ok() -> Self {
        Self::default()
    }
    /// Fails with an `error` reply
    pub fn fail(message: &str) -> Self {
        Self {
            bodies: vec![serde_json::json!({ "error": message })],
            failed: true,
            ..Default::default()
        }
    }
    /// Never completes until the same actor is sent a releasing command
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
    /// Completes every hanging command of the same actor
    pub fn releasing(mut self) -> Self {
        self.release = true;
        self
    }
    /// Broadcasts an unsolicited reply when the command is issued
    pub fn emitting(mut self, sender: &str, body: Value) -> Self {
        self.emit.push((sender.to_string(), body));
        self
    }
}

type Handler = Box<dyn Fn(&str, &str) -> Scripted + Send + Sync>;

pub struct MockBus {
    handler: Handler,
    sent: Mutex<Vec<(String, String)>>,
    hanging: Mutex<Vec<(String, oneshot::Sender<CommandOutcome>)>>,
    replies: broadcast::Sender<BusReply>,
    drops: AtomicUsize,
    restarts: AtomicUsize,
}
impl MockBus {
    pub fn new(handler: impl Fn(&str, &str) -> Scripted + Send + Sync + 'static) -> Self {
        let (replies, _) = broadcast::channel(256);
        Self {
            handler: Box::new(handler),
            sent: Default::default(),
            hanging: Default::default(),
            replies,
            drops: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }
    /// A bus on which every command succeeds silently
    pub fn silent() -> Self {
        Self::new(|_, _| Scripted::ok())
    }
    /// The next `n` issued commands fail with a closed connection
    pub fn drop_connection(&self, n: usize) {
        self.drops.store(n, Ordering::SeqCst);
    }
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
    /// Every `(actor, command)` issued so far
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
    /// Commands sent to `actor` starting with `prefix`
    pub fn sent_to(&self, actor: &str, prefix: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, c)| a == actor && c.starts_with(prefix))
            .map(|(_, c)| c.clone())
            .collect()
    }
    /// Broadcasts an unsolicited reply
    pub fn emit(&self, sender: &str, body: Value) {
        let _ = self.replies.send(reply(sender, ReplyCode::Info, body));
    }
}

fn reply(sender: &str, code: ReplyCode, body: Value) -> BusReply {
    let body = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    BusReply::new(sender, code, body)
}

#[async_trait]
impl Transport for MockBus {
    async fn issue(&self, actor: &str, command: &str) -> Result<PendingCommand, TransportError> {
        if self
            .drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent
            .lock()
            .push((actor.to_string(), command.to_string()));
        let script = (self.handler)(actor, command);
        for (sender, body) in script.emit {
            let _ = self.replies.send(reply(&sender, ReplyCode::Info, body));
        }
        if script.release {
            let mut hanging = self.hanging.lock();
            let (released, kept): (Vec<_>, Vec<_>) =
                hanging.drain(..).partition(|(a, _)| a == actor);
            *hanging = kept;
            for (_, sender) in released {
                let _ = sender.send(CommandOutcome {
                    replies: Vec::new(),
                    status: CommandStatus::Done,
                });
            }
        }
        let (sender, receiver) = oneshot::channel();
        if script.hang {
            self.hanging.lock().push((actor.to_string(), sender));
        } else {
            let code = if script.failed {
                ReplyCode::Failed
            } else {
                ReplyCode::Done
            };
            let replies = script
                .bodies
                .into_iter()
                .map(|body| reply(actor, code, body))
                .collect();
            let status = if script.failed {
                CommandStatus::Failed
            } else {
                CommandStatus::Done
            };
            let _ = sender.send(CommandOutcome { replies, status });
        }
        Ok(PendingCommand::new(receiver))
    }
    async fn restart(&self) -> Result<(), TransportError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn subscribe(&self) -> broadcast::Receiver<BusReply> {
        self.replies.subscribe()
    }
}
