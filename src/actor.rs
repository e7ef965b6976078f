//! # Remote actor proxy
//!
//! A [RemoteActor] caches the command tree an actor reports through
//! `get-command-model` and turns calls like
//! `actor.invoke("dome open", Args::new().kwarg("force", true))` into the
//! command strings the actor expects on the bus.

use crate::{
    bus::{BusReply, CommandOutcome, Transport, TransportError},
    Error, Result,
};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kind of a command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Argument,
    Option,
    #[serde(other)]
    Other,
}

/// One parameter of a [CommandModel]
#[derive(Debug, Clone, Deserialize)]
pub struct ParamModel {
    pub name: String,
    pub param_type_name: ParamKind,
    #[serde(default)]
    pub opts: Vec<String>,
    #[serde(default)]
    pub secondary_opts: Vec<String>,
    #[serde(default)]
    pub is_flag: bool,
    #[serde(default)]
    pub multiple: bool,
}
impl ParamModel {
    fn matches(&self, keyword: &str) -> bool {
        let keyword = normalise(keyword);
        normalise(&self.name) == keyword || self.opts.iter().any(|opt| normalise(opt) == keyword)
    }
    fn render_option(&self, value: &Value, parts: &mut Vec<String>) {
        let Some(opt) = self.opts.first() else {
            return;
        };
        if self.is_flag {
            match value {
                Value::Bool(false) => {
                    if let Some(secondary) = self.secondary_opts.first() {
                        parts.push(secondary.clone());
                    }
                }
                Value::Null => (),
                _ => parts.push(opt.clone()),
            }
            return;
        }
        match value {
            Value::Array(values) if self.multiple => {
                for value in values {
                    if let Some(rendered) = render(value) {
                        parts.push(opt.clone());
                        parts.push(rendered);
                    }
                }
            }
            value => {
                if let Some(rendered) = render(value) {
                    parts.push(opt.clone());
                    parts.push(rendered);
                }
            }
        }
    }
}

/// Description of one remote command, possibly a group of sub-commands
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandModel {
    pub name: String,
    #[serde(default)]
    pub help: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamModel>,
    #[serde(default)]
    pub commands: IndexMap<String, CommandModel>,
    #[serde(skip)]
    inferred: bool,
}
impl CommandModel {
    /// A model for a command missing from the actor schema
    ///
    /// Arguments are rendered in the order they are given and keywords as
    /// `--key value` options.
    pub fn inferred(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inferred: true,
            ..Default::default()
        }
    }
    pub fn is_group(&self) -> bool {
        !self.commands.is_empty()
    }
    fn child(&self, name: &str) -> Option<&CommandModel> {
        let name = normalise(name);
        self.commands.values().find(|c| normalise(&c.name) == name)
    }
    /// Builds the command string for the given arguments
    pub fn command_string(&self, args: &Args) -> Result<String> {
        let mut parts = vec![self.name.clone()];
        let mut keywords = args.keywords.clone();
        let mut positional = args.positional.iter();

        for param in self
            .params
            .iter()
            .filter(|p| p.param_type_name == ParamKind::Argument)
        {
            let value = match positional.next() {
                Some(value) => Some(value.clone()),
                None => {
                    let key = keywords.keys().find(|k| param.matches(k)).cloned();
                    key.and_then(|k| keywords.shift_remove(&k))
                }
            };
            if let Some(rendered) = value.as_ref().and_then(render) {
                parts.push(rendered);
            }
        }
        let extra: Vec<&Value> = positional.collect();
        if !extra.is_empty() {
            if !self.inferred {
                return Err(Error::InvalidArgument(format!(
                    "too many arguments for command {:?}",
                    self.name
                )));
            }
            parts.extend(extra.into_iter().filter_map(render));
        }

        for (key, value) in &keywords {
            let param = self
                .params
                .iter()
                .find(|p| p.param_type_name == ParamKind::Option && p.matches(key));
            match param {
                Some(param) => param.render_option(value, &mut parts),
                None if self.inferred => {
                    let opt = format!("--{}", normalise(key));
                    match value {
                        Value::Bool(true) => parts.push(opt),
                        Value::Bool(false) | Value::Null => (),
                        value => {
                            if let Some(rendered) = render(value) {
                                parts.push(opt);
                                parts.push(rendered);
                            }
                        }
                    }
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown keyword {key:?} for command {:?}",
                        self.name
                    )))
                }
            }
        }
        Ok(parts.join(" "))
    }
}

fn normalise(name: &str) -> String {
    name.trim_start_matches('-').replace('_', "-").to_lowercase()
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() || s.chars().any(char::is_whitespace) => {
            Some(format!("{s:?}"))
        }
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => {
            let items: Vec<String> = values.iter().filter_map(render).collect();
            (!items.is_empty()).then(|| items.join(" "))
        }
        Value::Object(_) => Some(format!("{:?}", value.to_string())),
        value => Some(value.to_string()),
    }
}

/// Positional and keyword arguments of a command invocation
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    keywords: IndexMap<String, Value>,
}
impl Args {
    pub fn new() -> Self {
        Default::default()
    }
    /// Appends a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }
    /// Sets a keyword argument
    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.keywords.insert(key.to_string(), value.into());
        self
    }
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }
}

/// The reply bodies of one command, in the order they were received
#[derive(Debug, Clone, Default)]
pub struct ActorReply {
    pub actor: String,
    pub command: String,
    pub replies: Vec<Map<String, Value>>,
}
impl ActorReply {
    fn from_outcome(actor: &str, command: &str, outcome: CommandOutcome) -> Result<Self> {
        let failed = outcome.did_fail();
        let reply = Self {
            actor: actor.to_string(),
            command: command.to_string(),
            replies: outcome
                .replies
                .into_iter()
                .map(|r| r.body)
                .filter(|body| !body.is_empty())
                .collect(),
        };
        if failed {
            let message = match reply.get("error") {
                Some(Value::String(message)) => message.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            return Err(Error::Rpc {
                actor: reply.actor,
                command: reply.command,
                message,
            });
        }
        Ok(reply)
    }
    /// Folds all the reply bodies into one map
    ///
    /// A keyword output several times keeps its last value.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut flat = Map::new();
        for reply in &self.replies {
            for (key, value) in reply {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }
    /// Returns the first occurrence of `key` in the reply list
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.replies.iter().find_map(|reply| reply.get(key))
    }
    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

/// Programmatic representation of one remote actor
pub struct RemoteActor {
    name: String,
    transport: Arc<dyn Transport>,
    commands: RwLock<IndexMap<String, CommandModel>>,
    connect_lock: tokio::sync::Mutex<()>,
}
impl std::fmt::Debug for RemoteActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteActor")
            .field("name", &self.name)
            .finish()
    }
}
impl RemoteActor {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            commands: Default::default(),
            connect_lock: Default::default(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Names of the top level commands known from the actor schema
    pub fn command_names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }
    /// Re-fetches the command tree
    ///
    /// On failure the previous tree is kept and `false` is returned.
    pub async fn refresh(&self) -> bool {
        match self.fetch_model().await {
            Ok(commands) => {
                log::debug!("({}) loaded {} commands", self.name, commands.len());
                *self.commands.write() = commands;
                true
            }
            Err(e) => {
                log::warn!("Cannot get model for actor {}: {e}", self.name);
                false
            }
        }
    }
    async fn fetch_model(&self) -> Result<IndexMap<String, CommandModel>> {
        let command = "get-command-model";
        let outcome = self.send_raw(command).await?;
        let reply = ActorReply::from_outcome(&self.name, command, outcome)?;
        let model = reply.get("command_model").cloned().ok_or_else(|| Error::Rpc {
            actor: self.name.clone(),
            command: command.to_string(),
            message: "reply has no command model".to_string(),
        })?;
        let model: CommandModel = serde_json::from_value(model)?;
        Ok(model.commands)
    }
    /// Sends a raw command string and waits for its completion
    ///
    /// Issuing is serialized per actor. A closed connection restarts the
    /// transport once and the command is issued again.
    pub async fn send_raw(&self, command: &str) -> Result<CommandOutcome> {
        let pending = {
            let _guard = self.connect_lock.lock().await;
            match self.transport.issue(&self.name, command).await {
                Ok(pending) => pending,
                Err(TransportError::ConnectionClosed) => {
                    log::warn!("({}) bus connection closed, restarting.", self.name);
                    self.transport.restart().await?;
                    self.transport.issue(&self.name, command).await?
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(pending.outcome().await?)
    }
    fn resolve(&self, path: &str) -> Result<Vec<CommandModel>> {
        let commands = self.commands.read();
        let mut chain: Vec<CommandModel> = Vec::new();
        for word in path.split_whitespace() {
            let found = match chain.last() {
                None => {
                    let name = normalise(word);
                    match commands.values().find(|c| normalise(&c.name) == name) {
                        Some(command) => command.clone(),
                        None if commands.is_empty() => CommandModel::inferred(word),
                        None => {
                            return Err(Error::InvalidArgument(format!(
                                "actor {} has no command {word:?}",
                                self.name
                            )))
                        }
                    }
                }
                Some(parent) => parent
                    .child(word)
                    .cloned()
                    .unwrap_or_else(|| CommandModel::inferred(word)),
            };
            chain.push(found);
        }
        if chain.is_empty() {
            return Err(Error::InvalidArgument("empty command path".to_string()));
        }
        Ok(chain)
    }
    /// Invokes the command at `path`
    ///
    /// Sub-commands are given as space separated paths, e.g. `"dome open"`;
    /// the parent groups are issued by name, without arguments, ahead of the
    /// leaf command.
    pub async fn invoke(&self, path: &str, args: Args) -> Result<ActorReply> {
        let chain = self.resolve(path)?;
        let Some((leaf, parents)) = chain.split_last() else {
            return Err(Error::InvalidArgument("empty command path".to_string()));
        };
        let mut command = String::new();
        for parent in parents {
            command.push_str(&parent.command_string(&Args::default())?);
            command.push(' ');
        }
        command.push_str(&leaf.command_string(&args)?);
        let outcome = self.send_raw(&command).await?;
        ActorReply::from_outcome(&self.name, &leaf.name, outcome)
    }
}

/// Registry of the actors in use, created lazily and kept for the process lifetime
pub struct ActorClient {
    transport: Arc<dyn Transport>,
    actors: Mutex<IndexMap<String, Arc<RemoteActor>>>,
}
impl ActorClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            actors: Default::default(),
        }
    }
    /// Returns the actor handle, creating it on first reference
    pub fn actor(&self, name: &str) -> Arc<RemoteActor> {
        self.actors
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RemoteActor::new(name, self.transport.clone())))
            .clone()
    }
    pub async fn invoke(&self, actor: &str, path: &str, args: Args) -> Result<ActorReply> {
        self.actor(actor).invoke(path, args).await
    }
    /// Refreshes the schema of every known actor, returns the number of failures
    pub async fn refresh_all(&self) -> usize {
        let actors: Vec<_> = self.actors.lock().values().cloned().collect();
        join_all(actors.iter().map(|a| a.refresh()))
            .await
            .into_iter()
            .filter(|ok| !ok)
            .count()
    }
    pub fn subscribe(&self) -> broadcast::Receiver<BusReply> {
        self.transport.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Scripted};
    use serde_json::json;

    fn guider_model() -> Value {
        json!({
            "name": "lvmguider",
            "commands": {
                "guide": {
                    "name": "guide",
                    "params": [
                        {"name": "ra", "param_type_name": "argument"},
                        {"name": "dec", "param_type_name": "argument"},
                        {"name": "exposure_time", "param_type_name": "option", "opts": ["--exposure-time", "-t"]},
                        {"name": "reference_pixel", "param_type_name": "option", "opts": ["--reference-pixel"]},
                        {"name": "apply_corrections", "param_type_name": "option", "opts": ["--apply-corrections"],
                         "secondary_opts": ["--no-apply-corrections"], "is_flag": true},
                        {"name": "one", "param_type_name": "option", "opts": ["--one"], "is_flag": true},
                        {"name": "help", "param_type_name": "option", "opts": ["--help"], "is_flag": true}
                    ]
                },
                "stop": {
                    "name": "stop",
                    "params": [{"name": "now", "param_type_name": "option", "opts": ["--now"], "is_flag": true}]
                },
                "dome": {
                    "name": "dome",
                    "commands": {
                        "open": {"name": "open", "params": [
                            {"name": "force", "param_type_name": "option", "opts": ["--force"], "is_flag": true}
                        ]}
                    }
                }
            }
        })
    }

    fn schema_bus() -> Arc<MockBus> {
        Arc::new(MockBus::new(|_, command| match command {
            "get-command-model" => Scripted::done(vec![json!({ "command_model": guider_model() })]),
            _ => Scripted::ok(),
        }))
    }

    #[test]
    fn reply_fold_and_first() {
        let reply = ActorReply {
            actor: "lvm.sci.pwi".into(),
            command: "status".into(),
            replies: vec![
                json!({"k1": "v1"}).as_object().unwrap().clone(),
                json!({"k1": "v2", "k2": 3}).as_object().unwrap().clone(),
            ],
        };
        assert_eq!(reply.flatten()["k1"], "v2");
        assert_eq!(reply.get("k1").unwrap(), "v1");
        assert_eq!(reply.get("k2").unwrap(), 3);
        assert!(reply.get("k3").is_none());
    }

    #[test]
    fn command_string() {
        let model: CommandModel =
            serde_json::from_value(guider_model()["commands"]["guide"].clone()).unwrap();
        let args = Args::new()
            .arg(10.5)
            .arg(-20)
            .kwarg("exposure_time", 5.0)
            .kwarg("reference_pixel", vec![2500, 1000])
            .kwarg("apply_corrections", false)
            .kwarg("one", true)
            .kwarg("help", Value::Null);
        assert_eq!(
            model.command_string(&args).unwrap(),
            "guide 10.5 -20 --exposure-time 5.0 --reference-pixel 2500 1000 --no-apply-corrections --one"
        );
        let args = Args::new().kwarg("dec", 1).kwarg("ra", 2);
        assert_eq!(model.command_string(&args).unwrap(), "guide 2 1");
        let unknown = Args::new().kwarg("binning", 2);
        assert!(matches!(
            model.command_string(&unknown),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn inferred_command_string() {
        let model = CommandModel::inferred("moveAbsolute");
        let args = Args::new()
            .arg(1200)
            .arg("DT")
            .kwarg("wait_until_done", true)
            .kwarg("header", "{\"A\": 1}");
        assert_eq!(
            model.command_string(&args).unwrap(),
            r#"moveAbsolute 1200 DT --wait-until-done --header "{\"A\": 1}""#
        );
    }

    #[tokio::test]
    async fn nested_group() {
        let bus = schema_bus();
        let actor = RemoteActor::new("lvmecp", bus.clone());
        assert!(actor.refresh().await);
        assert_eq!(actor.command_names(), vec!["guide", "stop", "dome"]);
        actor
            .invoke("dome open", Args::new().kwarg("force", true))
            .await
            .unwrap();
        actor.invoke("stop", Args::new().kwarg("now", false)).await.unwrap();
        assert_eq!(
            bus.sent_to("lvmecp", ""),
            vec!["get-command-model", "dome open --force", "stop"]
        );
        assert!(actor.invoke("focus", Args::new()).await.is_err());
    }

    #[tokio::test]
    async fn reconnects_once() {
        let bus = schema_bus();
        let actor = RemoteActor::new("lvm.sci.pwi", bus.clone());
        bus.drop_connection(1);
        actor.invoke("status", Args::new()).await.unwrap();
        assert_eq!(bus.restarts(), 1);
        assert_eq!(bus.sent_to("lvm.sci.pwi", "status").len(), 1);

        bus.drop_connection(2);
        let err = actor.invoke("status", Args::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::ConnectionClosed)
        ));
        assert_eq!(bus.restarts(), 2);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_schema() {
        let bus = Arc::new(MockBus::new(|_, _| Scripted::fail("offline")));
        let actor = RemoteActor::new("lvm.spec.fibsel", bus.clone());
        assert!(!actor.refresh().await);
        assert!(actor.command_names().is_empty());
        // without a schema, commands are inferred
        let err = actor
            .invoke("moveRelative", Args::new().arg(500))
            .await
            .unwrap_err();
        assert_eq!(err.code().value(), 2);
        assert!(err.to_string().contains("offline"));
        assert_eq!(bus.sent_to("lvm.spec.fibsel", "moveRelative"), vec!["moveRelative 500"]);
    }

    #[tokio::test]
    async fn client_registry() {
        let bus = schema_bus();
        let client = ActorClient::new(bus.clone());
        let a = client.actor("lvmecp");
        let b = client.actor("lvmecp");
        assert!(Arc::ptr_eq(&a, &b));
        client.actor("lvmnps");
        assert_eq!(client.refresh_all().await, 0);
        assert_eq!(bus.sent_to("lvmnps", "get-command-model").len(), 1);
    }
}
