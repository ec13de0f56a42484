//! Protocol engine error types

use thiserror::Error;

/// Errors surfaced by the CTAPHID<->CTAPBLE engine.
///
/// Most of these are logged and absorbed rather than propagated to the host
/// HID endpoint -- see the error handling design and its disposition table.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("BLE connect cancelled")]
    ConnectCancelled,

    #[error("BLE connect failed: {0}")]
    ConnectFailed(String),

    #[error("BLE connect attempts exhausted ({attempts} tries)")]
    ReconnectExhausted { attempts: u32 },

    #[error("BLE transport disconnected during dispatch")]
    TransportDisconnected,

    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: i16, actual: u8 },

    #[error("dispatch error: {0}")]
    DispatchException(String),

    #[error("HID transport error: {0}")]
    HidTransportError(String),

    #[error("BLE transport error: {0}")]
    BleTransportError(String),

    #[error("permission denied creating virtual HID device: {0}")]
    PermissionDenied(String),

    #[error("no channel ids available after {attempts} collision retries")]
    ChannelAllocationExhausted { attempts: u32 },
}
