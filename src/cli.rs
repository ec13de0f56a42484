//! Command-line interface for the bridge daemon.

use clap::Parser;

#[derive(Parser)]
#[command(name = "fidoble-bridge")]
#[command(about = "Bridges a USB-HID FIDO2 interface to a BLE FIDO2 authenticator")]
pub struct Cli {
    /// BLE address or name substring to match when scanning for the
    /// authenticator. Connects to the first FIDO2-service-advertising
    /// peripheral if omitted.
    #[arg(short, long)]
    pub device: Option<String>,

    /// Seconds of inactivity before the BLE link is torn down and pending
    /// forwarding jobs are cancelled.
    #[arg(long, default_value_t = 30)]
    pub idle_timeout: u64,

    /// Number of BLE reconnect attempts (1 s backoff each) before giving up
    /// and surfacing a HID ERROR to the host. See the design note on
    /// bounding the source's unbounded reconnect spin.
    #[arg(long, default_value_t = 5)]
    pub max_reconnect_attempts: u32,

    /// Reject HID continuation frames with a sequence gap instead of the
    /// source's pragmatic log-and-keep-partial-buffer behavior.
    #[arg(long)]
    pub strict_sequence: bool,

    /// Log level (error, warn, info, debug, trace). Overridden by
    /// `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
