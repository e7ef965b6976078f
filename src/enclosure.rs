//! # Enclosure

use crate::{
    actor::{Args, RemoteActor},
    device::{parse_labels, Device},
    Error, Result,
};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorStatus {
    pub closed: bool,
    pub locked: bool,
    pub local: bool,
}

/// The dome shelter and its safety interlocks
pub struct Enclosure {
    name: String,
    actor: Arc<RemoteActor>,
    bypass_local_mode: bool,
}
impl Device for Enclosure {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl Enclosure {
    pub fn new(actor: Arc<RemoteActor>, bypass_local_mode: bool) -> Self {
        Self {
            name: "enclosure".to_string(),
            actor,
            bypass_local_mode,
        }
    }
    pub async fn status(&self) -> Result<Map<String, Value>> {
        Ok(self.actor.invoke("status", Args::new()).await?.flatten())
    }
    /// Labels describing the dome state, e.g. `OPEN`, `MOTOR_CLOSING`
    pub async fn dome_labels(&self) -> Result<Vec<String>> {
        let status = self.status().await?;
        status
            .get("dome_status_labels")
            .map(parse_labels)
            .ok_or_else(|| Error::Enclosure("cannot determine the dome status".to_string()))
    }
    async fn safety_labels(&self) -> Result<Vec<String>> {
        let status = self.status().await?;
        status
            .get("safety_status_labels")
            .map(parse_labels)
            .ok_or_else(|| {
                Error::Enclosure("cannot determine if enclosure is in local mode".to_string())
            })
    }
    /// Whether the enclosure is in local mode
    pub async fn is_local(&self) -> Result<bool> {
        let labels = self.safety_labels().await?;
        if self.bypass_local_mode {
            return Ok(false);
        }
        Ok(labels.iter().any(|l| l == "LOCAL"))
    }
    pub async fn door_status(&self) -> Result<DoorStatus> {
        let labels = self.safety_labels().await?;
        let has = |label: &str| labels.iter().any(|l| l == label);
        Ok(DoorStatus {
            closed: has("DOOR_CLOSED"),
            locked: has("DOOR_LOCKED"),
            local: !self.bypass_local_mode && has("LOCAL"),
        })
    }
    pub async fn open(&self) -> Result<()> {
        self.write_to_log("Opening the enclosure ...", log::Level::Info);
        self.actor.invoke("dome open", Args::new()).await?;
        self.write_to_log("Enclosure is now open.", log::Level::Info);
        Ok(())
    }
    /// Closes the dome, `force` closes even if the actor reports it closed
    pub async fn close(&self, force: bool) -> Result<()> {
        self.write_to_log("Closing the enclosure ...", log::Level::Info);
        self.actor
            .invoke("dome close", Args::new().kwarg("force", force))
            .await?;
        self.write_to_log("Enclosure is now closed.", log::Level::Info);
        Ok(())
    }
    pub async fn stop(&self) -> Result<()> {
        self.write_to_log("Stopping the dome.", log::Level::Info);
        self.actor.invoke("dome stop", Args::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Scripted};
    use serde_json::json;

    #[tokio::test]
    async fn local_mode() {
        let bus = Arc::new(MockBus::new(|_, command| match command {
            "status" => Scripted::done(vec![
                json!({"dome_status_labels": "CLOSED"}),
                json!({"safety_status_labels": "LOCAL,DOOR_CLOSED"}),
            ]),
            _ => Scripted::ok(),
        }));
        let actor = Arc::new(RemoteActor::new("lvmecp", bus.clone()));
        let enclosure = Enclosure::new(actor.clone(), false);
        assert!(enclosure.is_local().await.unwrap());
        let door = enclosure.door_status().await.unwrap();
        assert!(door.closed && !door.locked && door.local);
        assert!(!Enclosure::new(actor, true).is_local().await.unwrap());

        enclosure.close(true).await.unwrap();
        assert_eq!(bus.sent_to("lvmecp", "dome"), vec!["dome close --force"]);
    }

    #[tokio::test]
    async fn missing_safety_labels() {
        let bus = Arc::new(MockBus::silent());
        let enclosure = Enclosure::new(Arc::new(RemoteActor::new("lvmecp", bus)), false);
        let err = enclosure.is_local().await.unwrap_err();
        assert_eq!(err.code().value(), 501);
    }
}
