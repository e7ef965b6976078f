//! Observes one tile: the scheduler's next one, or `observe-tile RA DEC [PA]` in degrees

use std::{env, sync::Arc, time::Duration};

use linya::{Bar, Progress};
use nightwatch::{bus::tcp::TcpBus, Config, Observatory, TileRequest};
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let position = env::args()
        .skip(1)
        .map(|arg| arg.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    let request = match position.as_slice() {
        [] => TileRequest::Next,
        [ra, dec] => TileRequest::Position {
            ra: *ra,
            dec: *dec,
            pa: 0.,
        },
        [ra, dec, pa] => TileRequest::Position {
            ra: *ra,
            dec: *dec,
            pa: *pa,
        },
        _ => anyhow::bail!("expected no arguments or RA DEC [PA]"),
    };

    let config = Config::from_env()?;
    let params = config.observer.clone();
    let bus = Arc::new(TcpBus::connect(config.services.bus.clone()).await?);
    let observatory = Arc::new(Observatory::new(config, bus)?);
    observatory.init().await;

    let tile = observatory.build_tile(request).await?;
    log::info!("Observing {tile}");

    let exposure_time = (params.exposure_time * params.count as f64).ceil() as usize;
    let progress = Arc::new(Mutex::new(Progress::new()));
    let exposing_progress = progress.clone();
    let exposing = observatory.clone();
    let progress_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let bar: Bar = exposing_progress
            .lock()
            .await
            .bar(exposure_time, "Exposing");
        let mut elapsed = 0usize;
        loop {
            interval.tick().await;
            if exposing.specs.is_exposing() {
                elapsed += 1;
                let mut progress = exposing_progress.lock().await;
                progress.set_and_draw(&bar, elapsed.min(exposure_time));
                if progress.is_done(&bar) {
                    break;
                }
            }
        }
    });

    let exposed = observatory.observe(tile, &params).await;
    progress_task.abort();
    for exposure in exposed?.exposures() {
        println!("Exposure #{} taken at {}", exposure.exp_no, exposure.start_time);
    }

    Ok(())
}
