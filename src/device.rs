//! # Devices
//!
//! A [Device] is a physical unit driven through exactly one remote actor.
//! A [DeviceSet] groups devices of one kind, in configuration order, and
//! fans operations out to all of them.

use crate::{
    actor::{ActorReply, Args, RemoteActor},
    Error, Result,
};
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::{future::Future, sync::Arc};

#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Logical name, e.g. `sci`
    fn name(&self) -> &str;
    fn actor(&self) -> &Arc<RemoteActor>;
    /// Re-fetches the actor command tree
    async fn refresh(&self) -> bool {
        self.actor().refresh().await
    }
    /// Logs `message` prefixed with the device name
    fn write_to_log(&self, message: &str, level: log::Level) {
        log::log!(level, "({}) {message}", self.name());
    }
}

/// Splits a status label value into its labels
///
/// Labels come either as a list or as one string separated by `,`, `|` or
/// whitespace.
pub fn parse_labels(value: &Value) -> Vec<String> {
    match value {
        Value::Array(labels) => labels
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_uppercase())
            .collect(),
        Value::String(labels) => labels
            .split(|c: char| c == ',' || c == '|' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .collect(),
        _ => Vec::new(),
    }
}

/// Awaits all the futures, returning the first error once every one completed
pub async fn gather<I, T>(futures: I) -> Result<Vec<T>>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T>>,
{
    let mut values = Vec::new();
    let mut first_error = None;
    for result in join_all(futures).await {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                log::error!("{e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

/// Homogeneous collection of devices
pub struct DeviceSet<D> {
    name: String,
    devices: IndexMap<String, Arc<D>>,
}
impl<D: Device> DeviceSet<D> {
    pub fn new(name: impl Into<String>, devices: impl IntoIterator<Item = D>) -> Self {
        Self {
            name: name.into(),
            devices: devices
                .into_iter()
                .map(|d| (d.name().to_string(), Arc::new(d)))
                .collect(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn get(&self, name: &str) -> Option<&Arc<D>> {
        self.devices.get(name)
    }
    /// Returns the device `name` or an error naming the set
    pub fn device(&self, name: &str) -> Result<&Arc<D>> {
        self.devices.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no device {name:?}", self.name))
        })
    }
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<D>> {
        self.devices.values()
    }
    pub fn len(&self) -> usize {
        self.devices.len()
    }
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
    /// Runs `f` on every device concurrently
    ///
    /// All the calls are awaited even if some of them fail; the results
    /// follow the member order. Every failure is logged and the first one
    /// is returned.
    pub async fn call_on_all<F, Fut, T>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let results = join_all(self.devices.values().cloned().map(f)).await;
        let mut values = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (name, result) in self.devices.keys().zip(results) {
            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    log::error!("({}) {} failed: {e}", self.name, name);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
    /// Sends the same command to every device actor
    pub async fn broadcast_command(&self, command: &str, args: Args) -> Result<Vec<ActorReply>> {
        self.call_on_all(|device| {
            let args = args.clone();
            async move { device.actor().invoke(command, args).await }
        })
        .await
    }
    /// Refreshes every device actor, returns the number of failures
    pub async fn refresh(&self) -> usize {
        join_all(self.devices.values().map(|d| d.refresh()))
            .await
            .into_iter()
            .filter(|ok| !ok)
            .count()
    }
}
