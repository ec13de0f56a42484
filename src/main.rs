//! fidoble-bridge: bridges a host's USB-HID FIDO2 interface to a FIDO2
//! authenticator reachable only over Bluetooth LE.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use tracing::info;

mod ble_btleplug;
mod cli;
mod hid_uhid;

use ble_btleplug::BtleplugBleTransport;
use cli::Cli;
use fidoble_protocol::{BleTransport, Bridge, BridgeConfig};
use hid_uhid::{derive_identity, UhidTransport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let manager = Manager::new().await.context("failed to initialize BLE manager")?;
    let adapters = manager.adapters().await.context("failed to list BLE adapters")?;
    let adapter = adapters
        .into_iter()
        .next()
        .context("no BLE adapter found")?;

    let ble: Arc<dyn BleTransport> = Arc::new(BtleplugBleTransport::new(adapter, cli.device.clone()));

    info!("connecting to BLE FIDO2 authenticator...");
    ble.connect().await.context("initial BLE connect failed")?;

    let device_id = ble.device_id();
    let (vid, pid, name) = derive_identity(&device_id)
        .with_context(|| format!("could not derive HID identity from device id {device_id:?}"))?;
    info!(vid, pid, %name, "creating virtual HID device");

    let hid = Arc::new(UhidTransport::create(vid, pid, &name).context("failed to create virtual HID device")?);

    let config = BridgeConfig {
        max_reconnect_attempts: cli.max_reconnect_attempts,
        strict_sequence: cli.strict_sequence,
        idle_timeout: Duration::from_secs(cli.idle_timeout),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let shutdown_tx = Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler(move || {
        if let Some(tx) = shutdown_tx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(());
        }
    })
    .context("failed to install Ctrl-C handler")?;

    info!("bridge starting");
    let bridge = Bridge::new(hid, ble, config);
    tokio::select! {
        result = bridge.run() => result.context("bridge run loop exited with an error")?,
        _ = shutdown_rx => info!("shutdown requested, exiting"),
    }

    Ok(())
}
