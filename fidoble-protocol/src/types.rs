//! Core wire-level value types shared by the framers, session manager and
//! translator: channel identifiers, the CTAPHID/CTAPBLE command vocabularies,
//! and the advertised capability bitfield.

use bitflags::bitflags;

/// 32-bit CTAPHID channel identifier.
pub type ChannelId = u32;

/// Reserved broadcast channel used for INIT.
pub const BROADCAST_CHANNEL: ChannelId = 0xFFFF_FFFF;

/// Sentinel meaning "no active channel".
pub const NO_CHANNEL: ChannelId = 0;

/// 8-byte nonce sent by the host in an INIT request and echoed in the reply.
pub type Nonce = [u8; 8];

/// INIT reply protocol version (fixed per the CTAPHID INIT response layout).
pub const INIT_PROTOCOL_VERSION: u8 = 2;

bitflags! {
    /// Capabilities advertised in the CTAPHID INIT reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// Device accepts CBOR-encoded CTAP2 messages.
        const CBOR = 0x04;
        /// Device does not support the non-CBOR (raw MSG) message format.
        const NMSG = 0x01;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::CBOR | Capabilities::NMSG
    }
}

/// CTAPHID command set (subset the bridge understands).
///
/// Stored without the frame-header high bit -- framing strips it before
/// the command ever reaches this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapHidCommand {
    Ping = 0x01,
    Msg = 0x03,
    Lock = 0x04,
    Init = 0x06,
    Wink = 0x08,
    Cbor = 0x10,
    Cancel = 0x11,
    Keepalive = 0x3B,
    Error = 0x3F,
}

impl CtapHidCommand {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Ping,
            0x03 => Self::Msg,
            0x04 => Self::Lock,
            0x06 => Self::Init,
            0x08 => Self::Wink,
            0x10 => Self::Cbor,
            0x11 => Self::Cancel,
            0x3B => Self::Keepalive,
            0x3F => Self::Error,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// CTAPBLE command set. Unlike CTAPHID, these retain the high bit as part of
/// the command's own value -- a protocol quirk the bridge preserves rather
/// than "fixes" (see the design notes on BLE command byte width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapBleCommand {
    Ping = 0x81,
    Keepalive = 0x82,
    Msg = 0x83,
    Cancel = 0xBE,
    Error = 0xBF,
}

impl CtapBleCommand {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x81 => Self::Ping,
            0x82 => Self::Keepalive,
            0x83 => Self::Msg,
            0xBE => Self::Cancel,
            0xBF => Self::Error,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// CTAP1_ERR_OTHER, sent to the host when the bounded BLE reconnect loop is
/// exhausted.
pub const CTAP1_ERR_OTHER: u8 = 0x7F;

/// CTAP1_ERR_INVALID_SEQ, sent to the host in strict-sequence mode on a
/// HID-ingress sequence gap.
pub const CTAP1_ERR_INVALID_SEQ: u8 = 0x04;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_match_init_example() {
        assert_eq!(Capabilities::default().bits(), 0x05);
    }

    #[test]
    fn hid_command_roundtrip() {
        for b in [0x01, 0x03, 0x04, 0x06, 0x08, 0x10, 0x11, 0x3B, 0x3F] {
            let cmd = CtapHidCommand::from_byte(b).unwrap();
            assert_eq!(cmd.as_byte(), b);
        }
    }

    #[test]
    fn ble_command_roundtrip() {
        for b in [0x81, 0x82, 0x83, 0xBE, 0xBF] {
            let cmd = CtapBleCommand::from_byte(b).unwrap();
            assert_eq!(cmd.as_byte(), b);
        }
    }

    #[test]
    fn unknown_commands_are_none() {
        assert!(CtapHidCommand::from_byte(0x7E).is_none());
        assert!(CtapBleCommand::from_byte(0x00).is_none());
    }
}
