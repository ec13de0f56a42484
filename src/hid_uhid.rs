//! HID Transport (C1) backed by the kernel's `/dev/uhid` misc device via
//! `uhid-virt`.
//!
//! Structured like `monsgeek-transport`'s `HidBluetoothTransport`: a
//! `parking_lot::Mutex`-guarded device handle plus a dedicated reader
//! thread, since `uhid-virt`'s blocking `read()`/`write()` don't compose
//! with tokio's async model on their own.
//!
//! Known limitation: reads and writes share one device handle, so a
//! `send_input` can block behind an in-progress `read()` until the kernel
//! next has an event for us. FIDO2 traffic is host-request-driven (we only
//! ever reply to something we just read) except for unsolicited BLE
//! KEEPALIVE forwarding, which can stall briefly under this scheme. Worth
//! revisiting with a duplicated fd if that proves to matter in practice.

use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uhid_virt::{Bus, CreateParams, InputEvent, OutputEvent, StreamError, UHIDDevice};

use fidoble_protocol::{BridgeError, HidTransport, HidTransportEvent};

/// FIDO HID report descriptor (34 bytes), emitted verbatim -- taken from
/// the CTAPHID/FIDO2 USB-HID specification, not invented here.
#[rustfmt::skip]
pub const REPORT_DESCRIPTOR: [u8; 34] = [
    0x06, 0xD0, 0xF1, // Usage Page (FIDO alliance)
    0x09, 0x01,       // Usage (CTAPHID)
    0xA1, 0x01,       // Collection (Application)
    0x09, 0x20,       //   Usage (Raw IN data report)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x40,       //   Report Count (64)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x09, 0x21,       //   Usage (Raw OUT data report)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x40,       //   Report Count (64)
    0x91, 0x02,       //   Output (Data,Var,Abs,...,Non-volatile)
    0xC0,             // End Collection
];

/// Derive (vid, pid, device name) from a BLE `device_id` of the form
/// `prefix_AA_BB_CC_DD_EE_FF`.
pub fn derive_identity(device_id: &str) -> Option<(u16, u16, String)> {
    let addr: Vec<&str> = device_id.splitn(2, '_').nth(1)?.split('_').collect();
    if addr.len() != 6 {
        return None;
    }
    let vid = u16::from_str_radix(&format!("{}{}", addr[0], addr[1]), 16).ok()?;
    let pid = u16::from_str_radix(&format!("{}{}", addr[2], addr[3]), 16).ok()?;
    let name = format!("PONE Fido2BLE Proxy {}", addr.join(":"));
    Some((vid, pid, name))
}

pub struct UhidTransport {
    // Locked only for the duration of a single `read()`/`write()` call --
    // never held across an `.await` -- so a plain (non-async) mutex is the
    // right tool here, mirroring `HidBluetoothTransport`'s `vendor_device`.
    device: Arc<Mutex<UHIDDevice<std::fs::File>>>,
    // These, in contrast, are awaited while locked, so they need an
    // async-aware mutex.
    events: tokio::sync::Mutex<mpsc::Receiver<HidTransportEvent>>,
    ready: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl UhidTransport {
    pub fn create(vid: u16, pid: u16, name: &str) -> Result<Self, BridgeError> {
        let params = CreateParams {
            name: name.to_string(),
            phys: String::new(),
            uniq: String::new(),
            bus: Bus::USB,
            vendor: vid as u32,
            product: pid as u32,
            version: 0,
            country: 0,
            rd_data: REPORT_DESCRIPTOR.to_vec(),
        };

        let device = UHIDDevice::create(params).map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("permission") {
                BridgeError::PermissionDenied(msg)
            } else {
                BridgeError::HidTransportError(msg)
            }
        })?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = mpsc::channel(1);

        let device = Arc::new(Mutex::new(device));
        spawn_reader(device.clone(), event_tx, ready_tx);

        Ok(Self {
            device,
            events: tokio::sync::Mutex::new(event_rx),
            ready: tokio::sync::Mutex::new(Some(ready_rx)),
        })
    }
}

fn spawn_reader(
    device: Arc<Mutex<UHIDDevice<std::fs::File>>>,
    event_tx: mpsc::Sender<HidTransportEvent>,
    ready_tx: mpsc::Sender<()>,
) {
    thread::Builder::new()
        .name("uhid-reader".into())
        .spawn(move || loop {
            let event = { device.lock().read() };
            match event {
                Ok(OutputEvent::Start { .. }) => {
                    info!("uhid device started");
                    let _ = ready_tx.blocking_send(());
                }
                Ok(OutputEvent::Open) => {
                    debug!("uhid device opened");
                    if event_tx.blocking_send(HidTransportEvent::Open).is_err() {
                        break;
                    }
                }
                Ok(OutputEvent::Close) => {
                    debug!("uhid device closed");
                    if event_tx.blocking_send(HidTransportEvent::Close).is_err() {
                        break;
                    }
                }
                Ok(OutputEvent::Output { data }) => {
                    if data.len() < 65 {
                        warn!(len = data.len(), "short HID output report, dropping");
                        continue;
                    }
                    let mut report = [0u8; 64];
                    report.copy_from_slice(&data[1..65]);
                    if event_tx.blocking_send(HidTransportEvent::Output(report)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(StreamError::Io(e)) => {
                    error!(error = %e, "uhid device read failed, stopping reader");
                    break;
                }
                Err(e) => {
                    warn!(?e, "uhid protocol error");
                }
            }
        })
        .expect("failed to spawn uhid reader thread");
}

#[async_trait]
impl HidTransport for UhidTransport {
    async fn wait_ready(&self) -> Result<(), BridgeError> {
        let mut guard = self.ready.lock().await;
        if let Some(rx) = guard.as_mut() {
            rx.recv().await;
        }
        *guard = None;
        Ok(())
    }

    async fn next_event(&self) -> Result<HidTransportEvent, BridgeError> {
        self.events
            .lock()
            .await
            .recv()
            .await
            .ok_or(BridgeError::HidTransportError("uhid reader thread exited".into()))
    }

    async fn send_input(&self, report: [u8; 64]) -> Result<(), BridgeError> {
        let mut data = Vec::with_capacity(65);
        data.push(0); // report id
        data.extend_from_slice(&report);
        self.device
            .lock()
            .write(InputEvent::Input { data })
            .map_err(|e| BridgeError::HidTransportError(e.to_string()))?;
        Ok(())
    }
}
