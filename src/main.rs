//! Host binary: wires a `VidBee` instance together, starts the loopback
//! bridge, and runs until signaled — the non-UI replacement for the
//! teacher's `tauri::Builder::default().run(...)` entry point.

use vidbee_core::settings::Settings;
use vidbee_core::VidBee;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let data_dir = vidbee_core::app_data_dir()?;
    let settings = Settings::default();

    let mut app = VidBee::bootstrap(data_dir, settings).await?;
    let port = app.start_bridge().await?;
    log::info!("vidbeed ready, loopback bridge on 127.0.0.1:{port}");

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    Ok(())
}
