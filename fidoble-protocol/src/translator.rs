//! Command Translator (C6) dispatch tables.
//!
//! The actual BLE-connected-ness check, the bounded reconnect loop, and the
//! idle-timeout re-arm happen in the engine around a call into this module
//! -- what lives here is the pure "given a completed frame, what do we
//! send/emit next" decision, kept free of I/O so the dispatch tables in
//! §4.4 are directly unit-testable.

use crate::types::{CtapBleCommand, CtapHidCommand};

/// What the translator decided to do with a completed HID frame.
#[derive(Debug, PartialEq, Eq)]
pub enum HidDispatch {
    /// Forward as a BLE frame with this command byte and payload.
    SendBle { cmd: u8, payload: Vec<u8> },
    /// Forward as BLE `CANCEL` and additionally tear down every pending
    /// forwarding task.
    SendBleAndCancelPending { cmd: u8, payload: Vec<u8> },
    /// Accepted but not translated (INIT/WINK/MSG/LOCK -- future work).
    Accepted,
}

/// Map a completed HID frame to the action the engine should take.
///
/// Caller contract (enforced by the engine, not here): BLE must already be
/// connected and the idle timeout re-armed before this is consulted.
pub fn translate_hid(cmd: CtapHidCommand, payload: Vec<u8>) -> HidDispatch {
    match cmd {
        CtapHidCommand::Cbor => HidDispatch::SendBle {
            cmd: CtapBleCommand::Msg.as_byte(),
            payload,
        },
        CtapHidCommand::Ping => HidDispatch::SendBle {
            cmd: CtapBleCommand::Ping.as_byte(),
            payload,
        },
        CtapHidCommand::Cancel => HidDispatch::SendBleAndCancelPending {
            cmd: CtapBleCommand::Cancel.as_byte(),
            payload,
        },
        CtapHidCommand::Error => HidDispatch::SendBle {
            cmd: CtapBleCommand::Error.as_byte(),
            payload,
        },
        CtapHidCommand::Init
        | CtapHidCommand::Wink
        | CtapHidCommand::Msg
        | CtapHidCommand::Lock => HidDispatch::Accepted,
    }
}

/// What the translator decided to do with a completed BLE frame.
#[derive(Debug, PartialEq, Eq)]
pub struct BleDispatch {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Map a completed BLE frame to the HID frame the engine should emit.
/// Returns `None` for a command byte outside the known BLE vocabulary
/// (pass-through-if-decodes, ignore-if-not per the error handling design).
pub fn translate_ble(cmd_byte: u8, payload: Vec<u8>) -> Option<BleDispatch> {
    let cmd = CtapBleCommand::from_byte(cmd_byte)?;
    let hid_cmd = match cmd {
        CtapBleCommand::Msg => CtapHidCommand::Cbor,
        CtapBleCommand::Keepalive => CtapHidCommand::Keepalive,
        CtapBleCommand::Error => CtapHidCommand::Error,
        CtapBleCommand::Ping => CtapHidCommand::Ping,
        CtapBleCommand::Cancel => CtapHidCommand::Cancel,
    };
    Some(BleDispatch {
        cmd: hid_cmd.as_byte(),
        payload,
    })
}
