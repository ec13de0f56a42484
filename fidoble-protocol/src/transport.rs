//! External interfaces (§6): the two transports the engine treats as
//! black boxes. Concrete implementations (virtual `/dev/uhid` device,
//! `btleplug` BLE client) live in the binary crate; this module only
//! defines the seam.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BridgeError;

/// One event the HID transport can report: the kernel opened or closed the
/// virtual device, or the host wrote an output report.
///
/// `report` excludes the HID report id byte -- callers of [`HidTransport`]
/// only ever see the 64 protocol bytes described in the data model.
#[derive(Debug, Clone)]
pub enum HidTransportEvent {
    Open,
    Close,
    Output([u8; 64]),
}

/// The host-facing USB-HID FIDO endpoint (C1).
///
/// Implementors present a 64-byte-report FIDO HID device to the kernel.
/// `wait_ready` / `next_event` are the suspension points the engine's main
/// loop awaits; `send_input` is the only thing it ever calls eagerly.
#[async_trait]
pub trait HidTransport: Send + Sync {
    /// Block until the kernel has confirmed the virtual device is live.
    async fn wait_ready(&self) -> Result<(), BridgeError>;

    /// Receive the next open/close/output event. Implementations should be
    /// cancel-safe: the engine selects over this alongside BLE and timeout
    /// futures.
    async fn next_event(&self) -> Result<HidTransportEvent, BridgeError>;

    /// Emit one 64-byte input report to the kernel, in order.
    async fn send_input(&self, report: [u8; 64]) -> Result<(), BridgeError>;
}

/// The downstream FIDO2-over-BLE authenticator (C2).
///
/// Notifications are delivered via a broadcast channel rather than a
/// callback, so the engine subscribes once and `select!`s on it like any
/// other suspension point -- it never hands the transport a pointer back
/// into session state (see the design note on avoiding cyclic callbacks).
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connect to the authenticator. May fail with a cancellation or a
    /// bus-level transport error; both are disposed of the same way by the
    /// session manager (abort the INIT silently).
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Idempotent reconnect, used on INIT-with-known-channel and by the
    /// translator's bounded reconnect loop.
    async fn reconnect(&self) -> Result<(), BridgeError>;

    async fn disconnect(&self) -> Result<(), BridgeError>;

    /// `true` iff the link is currently up.
    async fn is_connected(&self) -> bool;

    /// Write one pre-fragmented Control-Point frame. Callers fragment with
    /// [`crate::protocol::ble_fragment`] using [`BleTransport::control_point_length`]
    /// as the MTU.
    async fn send(&self, frame: &[u8]) -> Result<(), BridgeError>;

    /// Negotiated `fidoControlPointLength`. Defaults to 60 until a real
    /// connection has read it from the device.
    fn control_point_length(&self) -> u16;

    /// `prefix_XX_XX_XX_XX_XX_XX`-shaped identifier; the embedded address
    /// also derives the virtual HID device's VID/PID/name. Empty until the
    /// first successful [`BleTransport::connect`].
    fn device_id(&self) -> String;

    /// Subscribe to raw notification bytes from the FIDO status
    /// characteristic. Each subscriber gets its own receiver; the engine
    /// holds exactly one for the session's lifetime.
    fn subscribe_notifications(&self) -> broadcast::Receiver<Vec<u8>>;
}
