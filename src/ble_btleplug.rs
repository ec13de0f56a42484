//! BLE Transport (C2) backed by `btleplug`.
//!
//! Mirrors `monsgeek-transport`'s `HidBluetoothTransport` in shape (a
//! Mutex-guarded device handle, notification fan-out via a broadcast
//! channel) but talks GATT instead of HID-over-GATT, against the fixed
//! FIDO2 BLE service UUIDs.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fidoble_protocol::{BleTransport, BridgeError};

const FIDO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fffd_0000_1000_8000_00805f9b34fb);
const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xf1d0fff1_deaa_ecee_b42f_c9ba7ed623bb);
const STATUS_UUID: Uuid = Uuid::from_u128(0xf1d0fff2_deaa_ecee_b42f_c9ba7ed623bb);
const CONTROL_POINT_LENGTH_UUID: Uuid = Uuid::from_u128(0xf1d0fff3_deaa_ecee_b42f_c9ba7ed623bb);
const SERVICE_REVISION_BITFIELD_UUID: Uuid = Uuid::from_u128(0xf1d0fff4_deaa_ecee_b42f_c9ba7ed623bb);

/// Bit set when writing `fidoServiceRevisionBitfield` to select FIDO2 BLE
/// spec version 1.1 (the only revision this bridge speaks).
const SERVICE_REVISION_V1_1: u8 = 0x20;

const DEFAULT_CONTROL_POINT_LENGTH: u16 = 60;
const SCAN_DURATION: Duration = Duration::from_secs(3);

fn ble_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::BleTransportError(e.to_string())
}

fn find_characteristic(chars: &[Characteristic], uuid: Uuid) -> Result<Characteristic, BridgeError> {
    chars
        .iter()
        .find(|c| c.uuid == uuid)
        .cloned()
        .ok_or_else(|| BridgeError::BleTransportError(format!("characteristic {uuid} not found")))
}

fn device_id_from_address(addr: btleplug::api::BDAddr) -> String {
    format!("ctapble_{}", addr.to_string().replace(':', "_"))
}

pub struct BtleplugBleTransport {
    adapter: Adapter,
    device_filter: Option<String>,
    peripheral: Mutex<Option<Peripheral>>,
    control_point_length: AtomicU16,
    device_id: RwLock<String>,
    notify_tx: broadcast::Sender<Vec<u8>>,
}

impl BtleplugBleTransport {
    pub fn new(adapter: Adapter, device_filter: Option<String>) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            adapter,
            device_filter,
            peripheral: Mutex::new(None),
            control_point_length: AtomicU16::new(DEFAULT_CONTROL_POINT_LENGTH),
            device_id: RwLock::new(String::new()),
            notify_tx,
        }
    }

    async fn find_peripheral(&self) -> Result<Peripheral, BridgeError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        tokio::time::sleep(SCAN_DURATION).await;
        let peripherals = self.adapter.peripherals().await.map_err(ble_err)?;

        for peripheral in peripherals {
            let Some(props) = peripheral.properties().await.map_err(ble_err)? else {
                continue;
            };
            let matched = match &self.device_filter {
                Some(filter) => {
                    props
                        .local_name
                        .as_deref()
                        .is_some_and(|name| name.contains(filter.as_str()))
                        || peripheral.address().to_string().contains(filter.as_str())
                }
                None => props.services.contains(&FIDO_SERVICE_UUID),
            };
            if matched {
                return Ok(peripheral);
            }
        }

        Err(BridgeError::ConnectFailed(
            "no matching FIDO2 BLE peripheral found during scan".into(),
        ))
    }

    async fn connect_inner(&self) -> Result<(), BridgeError> {
        let peripheral = self.find_peripheral().await?;
        info!(address = %peripheral.address(), "connecting to BLE authenticator");
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let chars: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
        find_characteristic(&chars, CONTROL_POINT_UUID)?;
        let status = find_characteristic(&chars, STATUS_UUID)?;

        if let Ok(length_char) = find_characteristic(&chars, CONTROL_POINT_LENGTH_UUID) {
            match peripheral.read(&length_char).await {
                Ok(bytes) if bytes.len() >= 2 => {
                    let mtu = u16::from_be_bytes([bytes[0], bytes[1]]);
                    self.control_point_length.store(mtu, Ordering::Relaxed);
                    debug!(mtu, "negotiated fidoControlPointLength");
                }
                Ok(_) => warn!("fidoControlPointLength read too short, keeping default"),
                Err(e) => warn!(error = %e, "failed to read fidoControlPointLength, keeping default"),
            }
        }

        peripheral.subscribe(&status).await.map_err(ble_err)?;
        let mut stream = peripheral.notifications().await.map_err(ble_err)?;
        let tx = self.notify_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if event.uuid == STATUS_UUID {
                    let _ = tx.send(event.value);
                }
            }
        });

        if let Ok(revision_char) = find_characteristic(&chars, SERVICE_REVISION_BITFIELD_UUID) {
            peripheral
                .write(&revision_char, &[SERVICE_REVISION_V1_1], WriteType::WithResponse)
                .await
                .map_err(ble_err)?;
        }

        *self
            .device_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = device_id_from_address(peripheral.address());
        *self.peripheral.lock().await = Some(peripheral);
        Ok(())
    }
}

#[async_trait]
impl BleTransport for BtleplugBleTransport {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.connect_inner().await
    }

    async fn reconnect(&self) -> Result<(), BridgeError> {
        let _ = self.disconnect().await;
        self.connect_inner().await
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        let mut guard = self.peripheral.lock().await;
        if let Some(peripheral) = guard.take() {
            peripheral.disconnect().await.map_err(ble_err)?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let guard = self.peripheral.lock().await;
        match guard.as_ref() {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let guard = self.peripheral.lock().await;
        let peripheral = guard.as_ref().ok_or(BridgeError::TransportDisconnected)?;
        let chars: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
        let control_point = find_characteristic(&chars, CONTROL_POINT_UUID)?;
        peripheral
            .write(&control_point, frame, WriteType::WithoutResponse)
            .await
            .map_err(ble_err)
    }

    fn control_point_length(&self) -> u16 {
        self.control_point_length.load(Ordering::Relaxed)
    }

    fn device_id(&self) -> String {
        self.device_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notify_tx.subscribe()
    }
}
