//! # Message bus transport
//!
//! The actors are only reachable through an asynchronous command bus.
//! A [Transport] issues a command string to a named actor and hands back a
//! [PendingCommand] that resolves once the actor reports a terminal status.
//! Every reply seen on the bus, solicited or not, is also broadcast to
//! [Transport::subscribe] receivers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};

#[cfg(test)]
pub mod mock;
pub mod tcp;

pub use tcp::TcpBus;

/// Reply codes, mirroring the bus message codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyCode {
    #[serde(rename = ">")]
    Running,
    #[serde(rename = "i")]
    Info,
    #[serde(rename = "d")]
    Debug,
    #[serde(rename = "w")]
    Warning,
    #[serde(rename = "e")]
    Error,
    #[serde(rename = "f")]
    Failed,
    #[serde(rename = ":")]
    Done,
}
impl ReplyCode {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplyCode::Done | ReplyCode::Failed)
    }
}

/// A single reply emitted by an actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusReply {
    pub sender: String,
    pub code: ReplyCode,
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
}
impl BusReply {
    pub fn new(sender: impl Into<String>, code: ReplyCode, body: Map<String, Value>) -> Self {
        Self {
            sender: sender.into(),
            code,
            body,
            command_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Done,
    Failed,
}

/// All the replies of a completed command and its terminal status
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub replies: Vec<BusReply>,
    pub status: CommandStatus,
}
impl CommandOutcome {
    pub fn did_fail(&self) -> bool {
        self.status == CommandStatus::Failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to the message bus is closed")]
    ConnectionClosed,
    #[error("message bus i/o error")]
    Io(#[from] std::io::Error),
    #[error("malformed message bus payload")]
    Codec(#[from] serde_json::Error),
}

/// A command that has been issued and is waiting for its terminal reply
pub struct PendingCommand {
    receiver: oneshot::Receiver<CommandOutcome>,
}
impl PendingCommand {
    pub fn new(receiver: oneshot::Receiver<CommandOutcome>) -> Self {
        Self { receiver }
    }
    /// Waits for the command to complete
    ///
    /// A command still in flight when the connection drops resolves to
    /// [TransportError::ConnectionClosed].
    pub async fn outcome(self) -> Result<CommandOutcome, TransportError> {
        self.receiver
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues `command` to `actor` without waiting for completion
    async fn issue(&self, actor: &str, command: &str) -> Result<PendingCommand, TransportError>;
    /// Re-establishes the connection to the bus
    async fn restart(&self) -> Result<(), TransportError>;
    /// Subscribes to every reply going through the bus
    fn subscribe(&self) -> broadcast::Receiver<BusReply>;
}
