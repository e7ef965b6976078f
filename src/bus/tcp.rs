//! JSON-lines gateway client
//!
//! Each request is one JSON object per line,
//! `{"command_id": 7, "actor": "lvm.sci.pwi", "command": "status"}`,
//! and every reply the gateway forwards is a serialized [BusReply].

use super::{
    BusReply, CommandOutcome, CommandStatus, PendingCommand, ReplyCode, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot},
    task::JoinHandle,
};

#[derive(Serialize)]
struct Request<'a> {
    command_id: u64,
    actor: &'a str,
    command: &'a str,
}

struct InFlight {
    replies: Vec<BusReply>,
    sender: oneshot::Sender<CommandOutcome>,
}
type InFlightMap = Arc<Mutex<HashMap<u64, InFlight>>>;

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

/// TCP client to the message bus gateway
pub struct TcpBus {
    address: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
    in_flight: InFlightMap,
    next_id: AtomicU64,
    replies: broadcast::Sender<BusReply>,
}
impl TcpBus {
    /// Connects to the gateway at `address` (`host:port`)
    pub async fn connect(address: impl Into<String>) -> Result<Self, TransportError> {
        let (replies, _) = broadcast::channel(1024);
        let bus = Self {
            address: address.into(),
            connection: tokio::sync::Mutex::new(None),
            in_flight: Default::default(),
            next_id: AtomicU64::new(1),
            replies,
        };
        bus.restart().await?;
        Ok(bus)
    }
    async fn open(&self) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (reader, writer) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_replies(
            BufReader::new(reader),
            self.in_flight.clone(),
            self.replies.clone(),
            closed.clone(),
        ));
        Ok(Connection {
            writer,
            reader,
            closed,
        })
    }
}

async fn read_replies(
    reader: BufReader<OwnedReadHalf>,
    in_flight: InFlightMap,
    replies: broadcast::Sender<BusReply>,
    closed: Arc<AtomicBool>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<BusReply>(&line) {
                Ok(reply) => dispatch(reply, &in_flight, &replies),
                Err(e) => log::warn!("Discarding malformed bus message: {e}"),
            },
            Ok(None) => {
                log::warn!("Message bus closed the connection.");
                break;
            }
            Err(e) => {
                log::error!("Failed reading from the message bus: {e}");
                break;
            }
        }
    }
    // dropping the senders resolves every in-flight command as closed
    let mut in_flight = in_flight.lock();
    closed.store(true, Ordering::SeqCst);
    in_flight.clear();
}

fn dispatch(reply: BusReply, in_flight: &InFlightMap, replies: &broadcast::Sender<BusReply>) {
    let _ = replies.send(reply.clone());
    let Some(id) = reply.command_id else {
        return;
    };
    let mut in_flight = in_flight.lock();
    if reply.code.is_terminal() {
        if let Some(mut command) = in_flight.remove(&id) {
            let status = if reply.code == ReplyCode::Failed {
                CommandStatus::Failed
            } else {
                CommandStatus::Done
            };
            command.replies.push(reply);
            let _ = command.sender.send(CommandOutcome {
                replies: command.replies,
                status,
            });
        }
    } else if let Some(command) = in_flight.get_mut(&id) {
        command.replies.push(reply);
    }
}

#[async_trait]
impl Transport for TcpBus {
    async fn issue(&self, actor: &str, command: &str) -> Result<PendingCommand, TransportError> {
        let mut connection = self.connection.lock().await;
        let connection = connection
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;

        let command_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&Request {
            command_id,
            actor,
            command,
        })?;
        line.push(b'\n');

        let (sender, receiver) = oneshot::channel();
        {
            let mut in_flight = self.in_flight.lock();
            if connection.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            in_flight.insert(
                command_id,
                InFlight {
                    replies: Vec::new(),
                    sender,
                },
            );
        }
        log::debug!("({actor}) >> {command}");
        if let Err(e) = connection.writer.write_all(&line).await {
            self.in_flight.lock().remove(&command_id);
            log::warn!("Failed writing to the message bus: {e}");
            return Err(TransportError::ConnectionClosed);
        }
        Ok(PendingCommand::new(receiver))
    }
    async fn restart(&self) -> Result<(), TransportError> {
        let mut connection = self.connection.lock().await;
        if let Some(old) = connection.take() {
            old.reader.abort();
        }
        self.in_flight.lock().clear();
        *connection = Some(self.open().await?);
        log::info!("Connected to the message bus at {}", self.address);
        Ok(())
    }
    fn subscribe(&self) -> broadcast::Receiver<BusReply> {
        self.replies.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn command_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let id = request["command_id"].as_u64().unwrap();
                let replies = [
                    serde_json::json!({"sender": "lvm.sci.pwi", "code": "i", "body": {"is_slewing": false}, "command_id": id}),
                    serde_json::json!({"sender": "lvm.sci.pwi", "code": ":", "body": {}, "command_id": id}),
                ];
                for reply in replies {
                    let mut bytes = serde_json::to_vec(&reply).unwrap();
                    bytes.push(b'\n');
                    writer.write_all(&bytes).await.unwrap();
                }
            }
        });

        let bus = TcpBus::connect(address).await.unwrap();
        let mut broadcast = bus.subscribe();
        let outcome = bus
            .issue("lvm.sci.pwi", "status")
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert!(!outcome.did_fail());
        assert_eq!(outcome.replies.len(), 2);
        assert_eq!(outcome.replies[0].body["is_slewing"], false);
        assert_eq!(broadcast.recv().await.unwrap().sender, "lvm.sci.pwi");
    }

    #[tokio::test]
    async fn closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let bus = TcpBus::connect(address).await.unwrap();
        let pending = bus.issue("lvm.sci.pwi", "status").await;
        let closed = match pending {
            Err(TransportError::ConnectionClosed) => true,
            Ok(pending) => matches!(pending.outcome().await, Err(TransportError::ConnectionClosed)),
            Err(_) => false,
        };
        assert!(closed);
    }
}
