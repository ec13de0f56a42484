//! CTAPHID <-> CTAPBLE protocol engine.
//!
//! Bridges a host's USB-HID FIDO2 interface (CTAPHID) to a FIDO2
//! authenticator reachable only over Bluetooth LE (CTAPBLE/FIDOBLE). This
//! crate contains the transport-agnostic engine only: framing (C3/C4),
//! channel and session bookkeeping (C5), command translation (C6), and idle
//! supervision (C7). It does not know how to talk to a kernel `/dev/uhid`
//! device or a real BLE adapter -- see [`HidTransport`] and [`BleTransport`].

pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod timeout;
pub mod translator;
pub mod transport;
pub mod types;

pub use engine::{Bridge, BridgeConfig};
pub use error::BridgeError;
pub use session::Session;
pub use transport::{BleTransport, HidTransport, HidTransportEvent};
