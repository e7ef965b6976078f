use std::{env, sync::Arc};

use nightwatch::{
    bus::tcp::TcpBus,
    overwatcher::{Overwatcher, Services},
    Config, Observatory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    let bus = Arc::new(TcpBus::connect(config.services.bus.clone()).await?);
    log::info!("Connected to the message bus at {}", config.services.bus);

    let services = Services::from_config(&config)?;
    let observatory = Arc::new(Observatory::new(config, bus)?);
    observatory.init().await;

    let overwatcher = Overwatcher::instance(|| Ok(Overwatcher::new(observatory.clone(), services)))?;
    if env::var("NIGHTWATCH_ENABLE").is_ok() {
        overwatcher.enable();
    }
    overwatcher.run().await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Stopping the overwatcher");
    overwatcher.cancel();

    Ok(())
}
