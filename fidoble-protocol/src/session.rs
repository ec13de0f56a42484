//! Channel & Session Manager (C5): channel allocation, INIT nonce tracking,
//! reference-counted virtual device lifetime.
//!
//! This module is deliberately synchronous and I/O-free so the allocation
//! and bookkeeping rules are unit-testable without a runtime; the engine
//! drives BLE connects and timer arming around calls into it.

use std::collections::HashMap;

use rand::Rng;

use crate::error::BridgeError;
use crate::protocol::{BleReassemblyState, HidReassemblyState};
use crate::types::{Capabilities, ChannelId, Nonce, BROADCAST_CHANNEL, INIT_PROTOCOL_VERSION, NO_CHANNEL};

/// Maximum number of collision retries before giving up on channel
/// allocation (see the design note on collision-blind channel RNG).
pub const MAX_CHANNEL_ALLOCATION_ATTEMPTS: u32 = 8;

/// Bridge's own version, reported in the INIT reply's dev_major/minor/build
/// fields (the bridge itself, not the downstream BLE authenticator).
pub const DEVICE_VERSION: (u8, u8, u8) = (0, 1, 1);

/// What a HID INIT frame should do, decided purely from session state.
#[derive(Debug, PartialEq, Eq)]
pub enum InitDecision {
    /// Broadcast-channel INIT: allocate a fresh channel and connect BLE.
    Allocate { nonce: Nonce },
    /// INIT on a channel the session already knows, with a matching nonce:
    /// reconnect BLE and reply on that channel.
    Reinit { channel: ChannelId },
    /// Unknown channel, or known channel with a mismatched nonce. Per the
    /// resolved open question, this is silently ignored.
    Ignore,
}

/// One virtual HID device's protocol state (data model §3).
#[derive(Debug)]
pub struct Session {
    pub active_channel: ChannelId,
    channels_to_state: HashMap<ChannelId, Nonce>,
    reference_count: u32,
    pub hid_state: HidReassemblyState,
    pub ble_state: BleReassemblyState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            active_channel: NO_CHANNEL,
            channels_to_state: HashMap::new(),
            reference_count: 0,
            hid_state: HidReassemblyState::new(),
            ble_state: BleReassemblyState::new(),
        }
    }

    /// Kernel reported the virtual device was opened.
    pub fn open(&mut self) {
        self.reference_count += 1;
    }

    /// Kernel reported the virtual device was closed. Returns `true` if the
    /// reference count reached zero, in which case the session has already
    /// been cleared.
    pub fn close(&mut self) -> bool {
        self.reference_count = self.reference_count.saturating_sub(1);
        if self.reference_count == 0 {
            self.clear();
            true
        } else {
            false
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// Reset cleanup contract for reference_count reaching zero: drop all
    /// channel state and reassembly buffers. BLE disconnect and supervisor
    /// cancellation are the engine's responsibility (they require I/O).
    fn clear(&mut self) {
        self.active_channel = NO_CHANNEL;
        self.channels_to_state.clear();
        self.hid_state = HidReassemblyState::new();
        self.ble_state = BleReassemblyState::new();
    }

    /// Decide what a HID INIT frame (`channel`, `nonce`) should do.
    pub fn decide_init(&self, channel: ChannelId, nonce: Nonce) -> InitDecision {
        if channel == BROADCAST_CHANNEL {
            return InitDecision::Allocate { nonce };
        }
        match self.channels_to_state.get(&channel) {
            Some(known_nonce) if *known_nonce == nonce => InitDecision::Reinit { channel },
            _ => InitDecision::Ignore,
        }
    }

    /// Allocate a fresh channel id, retrying on collision with an existing
    /// entry (or the reserved broadcast/no-channel sentinels).
    pub fn allocate_channel<R: Rng>(&mut self, rng: &mut R) -> Result<ChannelId, BridgeError> {
        for _ in 0..MAX_CHANNEL_ALLOCATION_ATTEMPTS {
            let candidate = rng.gen_range(1..=0xFFFF_FFFEu32);
            if candidate != NO_CHANNEL
                && candidate != BROADCAST_CHANNEL
                && !self.channels_to_state.contains_key(&candidate)
            {
                return Ok(candidate);
            }
        }
        Err(BridgeError::ChannelAllocationExhausted {
            attempts: MAX_CHANNEL_ALLOCATION_ATTEMPTS,
        })
    }

    /// Record a newly allocated (or reconfirmed) channel's nonce and make it
    /// the active channel.
    pub fn activate_channel(&mut self, channel: ChannelId, nonce: Nonce) {
        self.channels_to_state.insert(channel, nonce);
        self.active_channel = channel;
    }

    /// Called by the idle-timeout supervisor: drop the active channel
    /// without forgetting the channel/nonce bindings (a later INIT with the
    /// same channel+nonce should still reinit successfully).
    pub fn deactivate(&mut self) {
        self.active_channel = NO_CHANNEL;
    }

    pub fn known_nonce(&self, channel: ChannelId) -> Option<Nonce> {
        self.channels_to_state.get(&channel).copied()
    }
}

/// Build the 17-byte INIT reply payload.
pub fn build_init_reply(nonce: Nonce, new_channel: ChannelId, capabilities: Capabilities) -> [u8; 17] {
    let mut reply = [0u8; 17];
    reply[0..8].copy_from_slice(&nonce);
    reply[8..12].copy_from_slice(&new_channel.to_be_bytes());
    reply[12] = INIT_PROTOCOL_VERSION;
    reply[13] = DEVICE_VERSION.0;
    reply[14] = DEVICE_VERSION.1;
    reply[15] = DEVICE_VERSION.2;
    reply[16] = capabilities.bits();
    reply
}
