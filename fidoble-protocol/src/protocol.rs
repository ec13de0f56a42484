//! Wire-level framing: HID report fragmentation/reassembly (C3) and BLE
//! Control-Point fragmentation/reassembly (C4).
//!
//! Pure, transport-agnostic functions and the small pieces of mutable state
//! they operate on. No I/O happens here.

use crate::error::BridgeError;
use crate::types::{ChannelId, CtapBleCommand, CtapHidCommand, Nonce, BROADCAST_CHANNEL};

/// Size of a CTAPHID report, including the 4-byte channel header.
pub const HID_REPORT_SIZE: usize = 64;
/// Payload bytes available in a HID initial frame: 64 - channel(4) - cmd(1) - len(2).
pub const HID_FIRST_FRAME_CAP: usize = HID_REPORT_SIZE - 7;
/// Payload bytes available in a HID continuation frame: 64 - channel(4) - seq(1).
pub const HID_CONT_CAP: usize = HID_REPORT_SIZE - 5;

/// Overhead of a BLE initial frame: cmd(1) + len(2).
pub const BLE_FIRST_OVERHEAD: usize = 3;
/// Overhead of a BLE continuation frame: seq(1).
pub const BLE_CONT_OVERHEAD: usize = 1;
/// `fidoControlPointLength` assumed until the BLE transport reports one.
pub const DEFAULT_BLE_MTU: u16 = 60;

/// Mutable HID ingress reassembly state (one per session, per data model §3).
#[derive(Debug, Default)]
pub struct HidReassemblyState {
    cmd: Option<u8>,
    total_length: usize,
    buffer: Vec<u8>,
    expected_seq: i16,
}

impl HidReassemblyState {
    pub fn new() -> Self {
        Self {
            cmd: None,
            total_length: 0,
            buffer: Vec::new(),
            expected_seq: -1,
        }
    }

    fn reset(&mut self) {
        self.cmd = None;
        self.total_length = 0;
        self.buffer.clear();
        self.expected_seq = -1;
    }
}

/// Outcome of feeding one HID output report to [`hid_ingress`].
#[derive(Debug, PartialEq, Eq)]
pub enum HidIngressEvent {
    /// Broadcast-channel INIT; hand the nonce directly to the session manager.
    Init { channel: ChannelId, nonce: Nonce },
    /// A frame completed reassembly.
    Frame {
        cmd: CtapHidCommand,
        channel: ChannelId,
        payload: Vec<u8>,
    },
    /// Reassembly still in progress; nothing to dispatch yet.
    Pending,
    /// Report discarded (sequence gap in non-strict mode, or an unknown
    /// command byte on an otherwise-complete frame).
    Dropped,
}

/// Feed one 64-byte HID output report into the reassembler.
///
/// `report` excludes the HID report id byte (the transport strips it before
/// handing reports to the engine). Returns `Err` only in `strict_sequence`
/// mode, where a sequence gap aborts reassembly instead of keeping the
/// partial buffer.
pub fn hid_ingress(
    state: &mut HidReassemblyState,
    report: &[u8],
    strict_sequence: bool,
) -> Result<HidIngressEvent, BridgeError> {
    debug_assert!(report.len() >= HID_REPORT_SIZE);
    let channel = ChannelId::from_be_bytes(report[0..4].try_into().unwrap());
    let cmd_or_seq = report[4];

    if channel == BROADCAST_CHANNEL && cmd_or_seq == 0x80 | CtapHidCommand::Init.as_byte() {
        let nonce: Nonce = report[5..13].try_into().unwrap();
        return Ok(HidIngressEvent::Init { channel, nonce });
    }

    if cmd_or_seq & 0x80 != 0 {
        let cmd = cmd_or_seq & 0x7F;
        let total_length = u16::from_be_bytes([report[5], report[6]]) as usize;
        state.cmd = Some(cmd);
        state.total_length = total_length;
        let cap = HID_FIRST_FRAME_CAP.min(total_length);
        state.buffer = report[7..7 + cap].to_vec();
        state.expected_seq = -1;
    } else {
        let seq = cmd_or_seq;
        if i16::from(seq) != state.expected_seq + 1 {
            if strict_sequence {
                let expected = state.expected_seq + 1;
                state.reset();
                return Err(BridgeError::SequenceGap {
                    expected,
                    actual: seq,
                });
            }
            tracing::warn!(seq, expected = state.expected_seq + 1, "HID sequence gap, dropping report");
            return Ok(HidIngressEvent::Dropped);
        }
        let remaining = state.total_length.saturating_sub(state.buffer.len());
        let cap = HID_CONT_CAP.min(remaining);
        state.buffer.extend_from_slice(&report[5..5 + cap]);
        state.expected_seq = i16::from(seq);
    }

    if state.buffer.len() >= state.total_length {
        let cmd_byte = state.cmd.take().unwrap_or(0);
        let payload = std::mem::take(&mut state.buffer);
        state.expected_seq = -1;
        state.total_length = 0;
        return Ok(match CtapHidCommand::from_byte(cmd_byte) {
            Some(cmd) => HidIngressEvent::Frame {
                cmd,
                channel,
                payload,
            },
            None => HidIngressEvent::Dropped,
        });
    }

    Ok(HidIngressEvent::Pending)
}

/// Fragment a `(cmd, channel, payload)` reply into ordered 64-byte HID
/// input reports.
pub fn hid_fragment(cmd: u8, channel: ChannelId, payload: &[u8]) -> Vec<[u8; HID_REPORT_SIZE]> {
    let mut reports = Vec::new();
    let total_length = payload.len() as u16;

    let first_cap = HID_FIRST_FRAME_CAP.min(payload.len());
    let mut first = [0u8; HID_REPORT_SIZE];
    first[0..4].copy_from_slice(&channel.to_be_bytes());
    first[4] = 0x80 | cmd;
    first[5..7].copy_from_slice(&total_length.to_be_bytes());
    first[7..7 + first_cap].copy_from_slice(&payload[0..first_cap]);
    reports.push(first);

    let mut offset = first_cap;
    let mut seq: u8 = 0;
    while offset < payload.len() {
        let cap = HID_CONT_CAP.min(payload.len() - offset);
        let mut report = [0u8; HID_REPORT_SIZE];
        report[0..4].copy_from_slice(&channel.to_be_bytes());
        report[4] = seq;
        report[5..5 + cap].copy_from_slice(&payload[offset..offset + cap]);
        reports.push(report);
        offset += cap;
        seq += 1;
    }

    reports
}

/// Mutable BLE ingress reassembly state. Resets to the "idle" shape
/// (`cmd = CANCEL`, empty buffer) after every completed dispatch -- see
/// [`BleReassemblyState::reset`].
#[derive(Debug)]
pub struct BleReassemblyState {
    cmd: u8,
    total_length: usize,
    buffer: Vec<u8>,
    expected_seq: i16,
}

impl Default for BleReassemblyState {
    fn default() -> Self {
        Self {
            cmd: CtapBleCommand::Cancel.as_byte(),
            total_length: 0,
            buffer: Vec::new(),
            expected_seq: -1,
        }
    }
}

impl BleReassemblyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset after a completed dispatch, per the translator's post-dispatch
    /// contract.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Feed one BLE notification payload into the reassembler. Returns the
/// completed `(cmd, payload)` pair once the frame is fully buffered.
///
/// The command byte is stored exactly as received, high bit included --
/// BLE command values are defined that way (see [`crate::types::CtapBleCommand`]).
pub fn ble_ingress(state: &mut BleReassemblyState, data: &[u8]) -> Option<(u8, Vec<u8>)> {
    if data.is_empty() {
        return None;
    }
    let first = data[0];
    if first & 0x80 != 0 {
        state.cmd = first;
        let total_length = u16::from_be_bytes([data[1], data[2]]) as usize;
        state.total_length = total_length;
        let cap = total_length.min(data.len().saturating_sub(3));
        state.buffer = data[3..3 + cap].to_vec();
        state.expected_seq = -1;
    } else {
        let seq = first;
        let remaining = state.total_length.saturating_sub(state.buffer.len());
        let cap = remaining.min(data.len() - 1);
        state.buffer.extend_from_slice(&data[1..1 + cap]);
        state.expected_seq = i16::from(seq);
    }

    if state.buffer.len() >= state.total_length {
        Some((state.cmd, state.buffer.clone()))
    } else {
        None
    }
}

/// Fragment a `(cmd, payload)` request into ordered Control-Point writes,
/// each at most `mtu` bytes. No padding -- unlike HID reports, BLE writes
/// are exactly as long as they need to be.
pub fn ble_fragment(cmd: u8, payload: &[u8], mtu: u16) -> Vec<Vec<u8>> {
    let mtu = mtu.max(BLE_FIRST_OVERHEAD as u16 + 1) as usize;
    let mut frames = Vec::new();
    let total_length = payload.len() as u16;

    let first_cap = (mtu - BLE_FIRST_OVERHEAD).min(payload.len());
    let mut first = Vec::with_capacity(BLE_FIRST_OVERHEAD + first_cap);
    first.push(cmd);
    first.extend_from_slice(&total_length.to_be_bytes());
    first.extend_from_slice(&payload[0..first_cap]);
    frames.push(first);

    let mut offset = first_cap;
    let mut seq: u8 = 0;
    while offset < payload.len() {
        let cap = (mtu - BLE_CONT_OVERHEAD).min(payload.len() - offset);
        let mut frame = Vec::with_capacity(BLE_CONT_OVERHEAD + cap);
        frame.push(seq);
        frame.extend_from_slice(&payload[offset..offset + cap]);
        frames.push(frame);
        offset += cap;
        seq += 1;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_hid(reports: &[[u8; HID_REPORT_SIZE]]) -> (u8, ChannelId, Vec<u8>) {
        let mut state = HidReassemblyState::new();
        for report in reports {
            match hid_ingress(&mut state, report, false).unwrap() {
                HidIngressEvent::Frame {
                    cmd,
                    channel,
                    payload,
                } => return (cmd.as_byte(), channel, payload),
                HidIngressEvent::Pending => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        panic!("reassembly never completed");
    }

    #[test]
    fn hid_fragment_reassemble_roundtrip_small() {
        let payload = vec![0xAB; 10];
        let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), 0xA1B2C3D4, &payload);
        assert_eq!(reports.len(), 1);
        let (cmd, channel, out) = reassemble_hid(&reports);
        assert_eq!(cmd, CtapHidCommand::Cbor.as_byte());
        assert_eq!(channel, 0xA1B2C3D4);
        assert_eq!(out, payload);
    }

    #[test]
    fn hid_fragment_reassemble_roundtrip_multi_report() {
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
        let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), 0xA1B2C3D4, &payload);
        // 57 + 59 + 59 + 25 = 200 over 4 reports
        assert_eq!(reports.len(), 4);
        let (_, _, out) = reassemble_hid(&reports);
        assert_eq!(out, payload);
    }

    #[test]
    fn hid_sequence_gap_is_dropped_not_fatal_by_default() {
        let payload = vec![0u8; 100];
        let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), 0xA1B2C3D4, &payload);
        let mut state = HidReassemblyState::new();
        assert_eq!(
            hid_ingress(&mut state, &reports[0], false).unwrap(),
            HidIngressEvent::Pending
        );
        // skip seq=1 (the fixture only has seq=0 and seq=1 for 100 bytes: 57+59=116>100, so 2 reports total)
        // craft an out-of-order continuation manually instead
        let mut bad = reports[1];
        bad[4] = 5; // bogus seq
        let event = hid_ingress(&mut state, &bad, false).unwrap();
        assert_eq!(event, HidIngressEvent::Dropped);
    }

    #[test]
    fn hid_sequence_gap_aborts_in_strict_mode() {
        let payload = vec![0u8; 100];
        let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), 0xA1B2C3D4, &payload);
        let mut state = HidReassemblyState::new();
        hid_ingress(&mut state, &reports[0], true).unwrap();
        let mut bad = reports[1];
        bad[4] = 5;
        let err = hid_ingress(&mut state, &bad, true).unwrap_err();
        assert!(matches!(err, BridgeError::SequenceGap { .. }));
    }

    #[test]
    fn broadcast_init_is_recognized_before_reassembly() {
        let mut report = [0u8; HID_REPORT_SIZE];
        report[0..4].copy_from_slice(&BROADCAST_CHANNEL.to_be_bytes());
        report[4] = 0x80 | CtapHidCommand::Init.as_byte();
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        report[5..13].copy_from_slice(&nonce);
        let mut state = HidReassemblyState::new();
        let event = hid_ingress(&mut state, &report, false).unwrap();
        assert_eq!(
            event,
            HidIngressEvent::Init {
                channel: BROADCAST_CHANNEL,
                nonce
            }
        );
    }

    #[test]
    fn ble_fragment_reassemble_roundtrip() {
        let payload: Vec<u8> = (0..150u32).map(|i| (i % 256) as u8).collect();
        let frames = ble_fragment(CtapBleCommand::Msg.as_byte(), &payload, DEFAULT_BLE_MTU);
        let mut state = BleReassemblyState::new();
        let mut result = None;
        for frame in &frames {
            if let Some((cmd, out)) = ble_ingress(&mut state, frame) {
                result = Some((cmd, out));
                break;
            }
        }
        let (cmd, out) = result.unwrap();
        assert_eq!(cmd, CtapBleCommand::Msg.as_byte());
        assert_eq!(out, payload);
    }

    #[test]
    fn ble_command_byte_keeps_high_bit() {
        let frames = ble_fragment(CtapBleCommand::Msg.as_byte(), b"hi", DEFAULT_BLE_MTU);
        assert_eq!(frames[0][0], 0x83);
    }

    #[test]
    fn ble_writes_are_not_padded() {
        let frames = ble_fragment(CtapBleCommand::Ping.as_byte(), b"ab", DEFAULT_BLE_MTU);
        assert_eq!(frames[0].len(), BLE_FIRST_OVERHEAD + 2);
    }
}
