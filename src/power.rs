//! # Networked power switches

use crate::{
    actor::{Args, RemoteActor},
    config::LampConfig,
    device::{gather, Device, DeviceSet},
    Result,
};
use serde_json::Value;
use std::{ops::Deref, sync::Arc};

pub struct PowerSwitch {
    name: String,
    actor: Arc<RemoteActor>,
}
impl Device for PowerSwitch {
    fn name(&self) -> &str {
        &self.name
    }
    fn actor(&self) -> &Arc<RemoteActor> {
        &self.actor
    }
}
impl PowerSwitch {
    pub fn new(name: impl Into<String>, actor: Arc<RemoteActor>) -> Self {
        Self {
            name: name.into(),
            actor,
        }
    }
    /// Status of the outlets of this switch
    pub async fn status(&self) -> Result<Option<Value>> {
        let status = self.actor.invoke("status", Args::new()).await?.flatten();
        Ok(status
            .get("status")
            .and_then(|s| s.get(&self.name))
            .cloned())
    }
    pub async fn on(&self, outlet: &str) -> Result<()> {
        self.write_to_log(&format!("Turning on {outlet}."), log::Level::Debug);
        self.actor.invoke("on", Args::new().arg(outlet)).await?;
        Ok(())
    }
    pub async fn off(&self, outlet: &str) -> Result<()> {
        self.write_to_log(&format!("Turning off {outlet}."), log::Level::Debug);
        self.actor.invoke("off", Args::new().arg(outlet)).await?;
        Ok(())
    }
}

/// Power switches and the calibration lamps plugged into them
pub struct PowerSet {
    switches: DeviceSet<PowerSwitch>,
    lamps: Vec<LampConfig>,
}
impl Deref for PowerSet {
    type Target = DeviceSet<PowerSwitch>;
    fn deref(&self) -> &Self::Target {
        &self.switches
    }
}
impl PowerSet {
    pub fn new(switches: DeviceSet<PowerSwitch>, lamps: Vec<LampConfig>) -> Self {
        Self { switches, lamps }
    }
    /// Turns every calibration lamp off
    pub async fn all_off(&self) -> Result<()> {
        log::info!("Turning off all lamps.");
        gather(self.lamps.iter().map(|lamp| async move {
            self.switches.device(&lamp.switch)?.off(&lamp.outlet).await
        }).collect::<Vec<_>>())
        .await?;
        Ok(())
    }
}
