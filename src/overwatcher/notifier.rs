//! # Notifications
//!
//! Every notification is logged and forwarded to the operations API, which
//! stores it and relays it to the chat channel. Identical notifications
//! within the repeat window are not relayed again.

use super::sources::OpsApi;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}
impl Level {
    pub fn log_level(self) -> log::Level {
        match self {
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warning => log::Level::Warn,
            Level::Error | Level::Critical => log::Level::Error,
        }
    }
}
impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A notification to send
#[derive(Debug, Clone, Default)]
pub struct Notification {
    message: String,
    level: Option<Level>,
    error: Option<String>,
    payload: Map<String, Value>,
    channel: Option<String>,
    relay: bool,
    log: bool,
    database: bool,
    allow_repeat: bool,
}
impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            relay: true,
            log: true,
            database: true,
            ..Default::default()
        }
    }
    pub fn level(self, level: Level) -> Self {
        Self {
            level: Some(level),
            ..self
        }
    }
    /// Attaches an error, the level defaults to [Level::Error]
    pub fn error(self, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..self
        }
    }
    pub fn payload(self, payload: Map<String, Value>) -> Self {
        Self { payload, ..self }
    }
    /// Relays to `channel` instead of the default one
    pub fn channel(self, channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..self
        }
    }
    /// Stores the notification without relaying it
    pub fn no_relay(self) -> Self {
        Self {
            relay: false,
            ..self
        }
    }
    /// Does not log the notification locally
    pub fn quiet(self) -> Self {
        Self { log: false, ..self }
    }
    pub fn no_database(self) -> Self {
        Self {
            database: false,
            ..self
        }
    }
    pub fn allow_repeat(self) -> Self {
        Self {
            allow_repeat: true,
            ..self
        }
    }
    fn resolved_level(&self) -> Level {
        self.level.unwrap_or(if self.error.is_some() {
            Level::Error
        } else {
            Level::Info
        })
    }
    fn full_message(&self) -> String {
        match (&self.error, self.message.is_empty()) {
            (Some(error), true) => error.clone(),
            (Some(error), false) => format!("{} {error}", self.message),
            (None, _) => self.message.clone(),
        }
    }
}

/// Hex SHA-256 digest identifying repeated notifications
pub fn notification_hash(
    message: &str,
    level: Level,
    error: Option<&str>,
    channel: Option<&str>,
    payload: &Map<String, Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(level.to_string().as_bytes());
    hasher.update(error.unwrap_or_default().as_bytes());
    hasher.update(channel.unwrap_or_default().as_bytes());
    if !payload.is_empty() {
        hasher.update(Value::Object(payload.clone()).to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The body of `POST /notifications/create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPost {
    pub message: String,
    pub level: Level,
    pub payload: Map<String, Value>,
    /// `None` when the notification is not relayed
    pub slack_channel: Option<String>,
    pub email_on_critical: bool,
    pub write_to_database: bool,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, post: &NotificationPost) -> Result<()>;
    /// Asks for the night log to be emailed, unless already sent
    async fn email_night_log(&self) -> Result<()>;
}

#[async_trait]
impl NotificationSink for OpsApi {
    async fn deliver(&self, post: &NotificationPost) -> Result<()> {
        let response = self
            .client()
            .post(self.url("notifications/create"))
            .json(post)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Overwatcher(format!(
                "failed creating notification (status={})",
                response.status()
            )));
        }
        Ok(())
    }
    async fn email_night_log(&self) -> Result<()> {
        let response = self
            .client()
            .get(self.url("logs/night-logs/0/email"))
            .query(&[("only_if_not_sent", "true")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Overwatcher(format!(
                "failed sending the night log (status={})",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Logs and forwards notifications, holding back repeats
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    channel: String,
    window: Duration,
    /// Notification hash to the time it may be relayed again
    history: Mutex<HashMap<String, Instant>>,
}
impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, channel: impl Into<String>, window: Duration) -> Self {
        Self {
            sink,
            channel: channel.into(),
            window,
            history: Mutex::new(HashMap::new()),
        }
    }
    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }
    /// Sends a notification, delivery failures are only logged
    pub async fn notify(&self, notification: Notification) {
        let level = notification.resolved_level();
        let message = notification.full_message();
        if notification.log {
            log::log!(level.log_level(), "(Overwatcher) {message}");
        }

        let channel = notification
            .channel
            .clone()
            .unwrap_or_else(|| self.channel.clone());
        let hash = notification_hash(
            &notification.message,
            level,
            notification.error.as_deref(),
            Some(&channel),
            &notification.payload,
        );
        let now = Instant::now();
        let repeated = {
            let mut history = self.history.lock();
            history.retain(|_, next| *next > now);
            let repeated = history.contains_key(&hash);
            history.insert(hash, now + self.window);
            repeated
        };
        let relay = notification.relay && (notification.allow_repeat || !repeated);

        let post = NotificationPost {
            message,
            level,
            payload: notification.payload,
            slack_channel: relay.then_some(channel),
            email_on_critical: false,
            write_to_database: notification.database,
        };
        if let Err(e) = self.sink.deliver(&post).await {
            log::warn!("(Overwatcher) failed delivering notification: {e}");
        }
    }
    pub async fn info(&self, message: impl Into<String>) {
        self.notify(Notification::new(message).level(Level::Info))
            .await
    }
    pub async fn warning(&self, message: impl Into<String>) {
        self.notify(Notification::new(message).level(Level::Warning))
            .await
    }
    pub async fn critical(&self, message: impl Into<String>) {
        self.notify(Notification::new(message).level(Level::Critical))
            .await
    }
    pub async fn email_night_log(&self) {
        if let Err(e) = self.sink.email_night_log().await {
            log::warn!("(Overwatcher) failed sending the night log: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records what it is asked to deliver
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) posts: Mutex<Vec<NotificationPost>>,
        pub(crate) emails: AtomicUsize,
        pub(crate) failing: bool,
    }
    impl RecordingSink {
        /// Messages relayed to a channel
        pub(crate) fn relayed(&self) -> Vec<String> {
            self.posts
                .lock()
                .iter()
                .filter(|p| p.slack_channel.is_some())
                .map(|p| p.message.clone())
                .collect()
        }
        pub(crate) fn emails(&self) -> usize {
            self.emails.load(Ordering::SeqCst)
        }
    }
    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, post: &NotificationPost) -> Result<()> {
            self.posts.lock().push(post.clone());
            if self.failing {
                return Err(Error::Overwatcher("API down".to_string()));
            }
            Ok(())
        }
        async fn email_night_log(&self) -> Result<()> {
            self.emails.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_are_not_relayed() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), "lvm-overwatcher", Duration::from_secs(60));
        let payload: Map<String, Value> = [("tile_id".to_string(), Value::from(7))].into_iter().collect();
        for _ in 0..2 {
            notifier
                .notify(Notification::new("Dome failed").level(Level::Error).payload(payload.clone()))
                .await;
        }
        {
            let posts = sink.posts.lock();
            assert_eq!(posts.len(), 2);
            assert!(posts.iter().all(|p| p.write_to_database));
            assert_eq!(posts[0].slack_channel.as_deref(), Some("lvm-overwatcher"));
            assert_eq!(posts[1].slack_channel, None);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        notifier
            .notify(Notification::new("Dome failed").level(Level::Error).payload(payload))
            .await;
        assert_eq!(sink.relayed().len(), 2);

        notifier.info("Hello").await;
        notifier
            .notify(Notification::new("Hello").level(Level::Info).allow_repeat())
            .await;
        assert_eq!(sink.relayed().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_history_is_forgotten() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), "lvm-overwatcher", Duration::from_secs(60));
        notifier.info("first").await;
        notifier.info("second").await;
        assert_eq!(notifier.history.lock().len(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        notifier.info("third").await;
        assert_eq!(notifier.history.lock().len(), 1);
        assert_eq!(sink.relayed(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            failing: true,
            ..Default::default()
        });
        let notifier = Notifier::new(sink.clone(), "lvm-overwatcher", Duration::from_secs(60));
        notifier
            .notify(Notification::new("").error("enclosure: timed out"))
            .await;
        let posts = sink.posts.lock();
        assert_eq!(posts[0].level, Level::Error);
        assert_eq!(posts[0].message, "enclosure: timed out");
    }

    #[test]
    fn hash() {
        let empty = Map::new();
        let a = notification_hash("a", Level::Info, None, Some("c"), &empty);
        assert_eq!(a.len(), 64);
        assert_eq!(a, notification_hash("a", Level::Info, None, Some("c"), &empty));
        assert_ne!(a, notification_hash("a", Level::Warning, None, Some("c"), &empty));
    }
}
