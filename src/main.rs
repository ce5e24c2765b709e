use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, level_filters::LevelFilter};

use umscore::devoptab::InMemoryDeviceTable;
use umscore::fs_adapter::NullFilesystemDriver;
use umscore::Config;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .without_time()
        .init();

    info!("starting");

    let device_table = InMemoryDeviceTable::new();
    let drivers: Vec<Arc<dyn umscore::FilesystemDriver>> = vec![Arc::new(NullFilesystemDriver)];
    let core = umscore::init(0, Config::default(), drivers, device_table.clone()).await?;

    loop {
        tokio::select! {
            _ = core.wait_for_status_change() => {
                let devices = core.list_devices(16).await;
                info!(count = devices.len(), "mounted devices changed");
                for device in &devices {
                    info!(mount_name = %device.mount_name, kind = ?device.kind, "mounted");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        }
    }

    core.exit().await;
    Ok(())
}
