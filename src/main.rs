use ble_coordinator::infrastructure::bluetooth::BluestTransport;
use ble_coordinator::infrastructure::logging::init_logger;
use ble_coordinator::{Coordinator, CoordinatorNotification, PeripheralId, SettingsService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _logging = init_logger(&settings.get().log_settings)?;
    info!("Starting BLE coordinator (settings: {})", settings.path().display());

    let (sink, events) = mpsc::unbounded_channel();
    let transport = Arc::new(BluestTransport::new(sink).await?);
    let coordinator = Coordinator::new(transport, settings.get().coordinator.clone(), events)?;
    let mut notifications = coordinator.notifications();

    // The power-on event is already queued behind the pump
    if !coordinator.wait_until_enabled(ADAPTER_READY_TIMEOUT).await {
        anyhow::bail!("Adapter did not report power-on within {:?}", ADAPTER_READY_TIMEOUT);
    }

    if !coordinator.scan(&[], |table| info!("{} peripheral(s) in range", table.len())) {
        anyhow::bail!("Scan was rejected; is the adapter powered on?");
    }

    while let Ok(notification) = notifications.recv().await {
        if matches!(notification, CoordinatorNotification::ScanStopped) {
            break;
        }
    }

    let mut table: Vec<_> = coordinator.discovered_peripherals().into_values().collect();
    table.sort_by_key(|p| std::cmp::Reverse(p.rssi()));
    for peripheral in &table {
        println!(
            "{:<40} {:>5} dBm  {}",
            peripheral.id(),
            peripheral.rssi(),
            peripheral.name().unwrap_or("-")
        );
    }

    let Some(target) = std::env::args().nth(1).map(PeripheralId::new) else {
        return Ok(());
    };

    match coordinator.connect_async(&target).await {
        Ok(peripheral) => {
            for characteristic in peripheral.characteristics() {
                println!(
                    "{} / {}  {:?}",
                    characteristic.service_uuid, characteristic.uuid, characteristic.properties
                );
            }
            if let Err(e) = coordinator.disconnect_async(&target).await {
                error!("Disconnect from {} failed: {}", target, e);
            }
        }
        Err(e) => error!("Connection to {} failed: {}", target, e),
    }
    Ok(())
}
