//! The bridge's single-threaded-cooperative-scheduler-over-tokio run loop
//! (§5). Everything that mutates [`Session`] state happens in [`Bridge::run`]
//! between suspension points, matching the scheduling model's "no
//! shared-memory concurrency" invariant even though the underlying I/O runs
//! as real concurrent tokio tasks.
//!
//! Those tasks never touch `Session` directly -- they report back through
//! an internal `mpsc` channel (the actor pattern), so the only place
//! protocol state changes is this module's select loop.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::BridgeError;
use crate::protocol::{ble_fragment, ble_ingress, hid_fragment, hid_ingress, HidIngressEvent};
use crate::session::{build_init_reply, InitDecision, Session};
use crate::timeout::{IdleSupervisor, DEFAULT_IDLE_TIMEOUT};
use crate::translator::{translate_ble, translate_hid, HidDispatch};
use crate::transport::{BleTransport, HidTransport, HidTransportEvent};
use crate::types::{
    Capabilities, ChannelId, CtapHidCommand, Nonce, BROADCAST_CHANNEL, CTAP1_ERR_INVALID_SEQ,
    CTAP1_ERR_OTHER,
};

/// Knobs exposed on the CLI (§9a/§9b design notes).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_reconnect_attempts: u32,
    pub strict_sequence: bool,
    pub idle_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            strict_sequence: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Messages spawned jobs report back to the run loop. Nothing outside this
/// enum ever reaches into `Session` from another task.
enum EngineMsg {
    InitAllocated { channel: ChannelId, nonce: Nonce },
    Rearm,
    HidError { channel: ChannelId, code: u8 },
}

pub struct Bridge {
    session: Session,
    hid: Arc<dyn HidTransport>,
    ble: Arc<dyn BleTransport>,
    idle: IdleSupervisor,
    /// Freely cancellable: BLE connect/reconnect attempts spun up for an
    /// in-flight INIT that hasn't committed to a channel yet.
    forwarding_jobs: JoinSet<()>,
    /// Preserved across idle timeout: a fully-reassembled HID frame's BLE
    /// forward, so a request doesn't get dropped mid-flight by the
    /// supervisor firing.
    reassembly_finishers: JoinSet<()>,
    max_reconnect_attempts: u32,
    strict_sequence: bool,
    rng: rand::rngs::StdRng,
    msg_tx: mpsc::Sender<EngineMsg>,
    msg_rx: mpsc::Receiver<EngineMsg>,
}

impl Bridge {
    pub fn new(hid: Arc<dyn HidTransport>, ble: Arc<dyn BleTransport>, config: BridgeConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        Self {
            session: Session::new(),
            hid,
            ble,
            idle: IdleSupervisor::new(config.idle_timeout),
            forwarding_jobs: JoinSet::new(),
            reassembly_finishers: JoinSet::new(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            strict_sequence: config.strict_sequence,
            rng: rand::rngs::StdRng::from_entropy(),
            msg_tx,
            msg_rx,
        }
    }

    /// Run until the HID transport's event stream ends (virtual device
    /// removed) or a fatal transport error occurs.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        self.hid.wait_ready().await?;
        let mut ble_notifications = self.ble.subscribe_notifications();

        loop {
            tokio::select! {
                hid_event = self.hid.next_event() => {
                    match hid_event? {
                        HidTransportEvent::Open => self.session.open(),
                        HidTransportEvent::Close => {
                            if self.session.close() {
                                self.teardown().await;
                            }
                        }
                        HidTransportEvent::Output(report) => {
                            self.handle_hid_output(report).await;
                        }
                    }
                }
                notification = ble_notifications.recv() => {
                    match notification {
                        Ok(bytes) => self.handle_ble_notification(bytes).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "BLE notification receiver lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                Some(msg) = self.msg_rx.recv() => {
                    self.handle_engine_msg(msg).await;
                }
                _ = self.idle.tick() => {
                    self.handle_idle_timeout().await;
                }
                // Reap finished jobs so the JoinSets don't grow unbounded;
                // their results carry no state the run loop needs. Guarded
                // on non-empty: `join_next()` on an empty set resolves to
                // `None` immediately, which would otherwise busy-loop this
                // branch.
                Some(_) = self.forwarding_jobs.join_next(), if !self.forwarding_jobs.is_empty() => {}
                Some(_) = self.reassembly_finishers.join_next(), if !self.reassembly_finishers.is_empty() => {}
            }
        }

        Ok(())
    }

    async fn handle_engine_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::InitAllocated { channel, nonce } => {
                self.session.activate_channel(channel, nonce);
                self.idle.arm();
                let reply = build_init_reply(nonce, channel, Capabilities::default());
                let _ = self
                    .emit_hid(CtapHidCommand::Init.as_byte(), BROADCAST_CHANNEL, &reply)
                    .await;
            }
            EngineMsg::Rearm => self.idle.arm(),
            EngineMsg::HidError { channel, code } => {
                let _ = self.emit_hid_error(channel, code).await;
            }
        }
    }

    async fn handle_hid_output(&mut self, report: [u8; 64]) {
        match hid_ingress(&mut self.session.hid_state, &report, self.strict_sequence) {
            Ok(HidIngressEvent::Init { channel, nonce }) => self.handle_init(channel, nonce).await,
            Ok(HidIngressEvent::Frame { cmd, channel, payload }) => {
                self.handle_hid_frame(cmd, channel, payload).await;
            }
            Ok(HidIngressEvent::Pending) | Ok(HidIngressEvent::Dropped) => {}
            Err(BridgeError::SequenceGap { expected, actual }) => {
                warn!(expected, actual, "HID sequence gap, aborting reassembly (strict mode)");
                let channel = self.session.active_channel;
                let _ = self.emit_hid_error(channel, CTAP1_ERR_INVALID_SEQ).await;
            }
            Err(e) => error!(error = %e, "unexpected HID ingress error"),
        }
    }

    async fn handle_init(&mut self, channel: ChannelId, nonce: Nonce) {
        match self.session.decide_init(channel, nonce) {
            InitDecision::Allocate { nonce } => self.spawn_init_allocate(nonce),
            InitDecision::Reinit { channel } => self.reinit_on_known_channel(channel, nonce).await,
            InitDecision::Ignore => debug!(channel, "INIT ignored: unknown channel or nonce mismatch"),
        }
    }

    /// INIT on a channel the session already knows, with a matching nonce.
    /// Unlike the broadcast-INIT path (`spawn_init_allocate`), the reply is
    /// sent unconditionally before the BLE reconnect is even attempted --
    /// per spec.md §4.3's "INIT on existing channel" row, which orders the
    /// steps as reply first, then reconnect, rather than the broadcast row's
    /// "attempt connect; on success, reply".
    async fn reinit_on_known_channel(&mut self, channel: ChannelId, nonce: Nonce) {
        self.session.activate_channel(channel, nonce);
        self.idle.arm();
        let reply = build_init_reply(nonce, channel, Capabilities::default());
        if let Err(e) = self
            .emit_hid(CtapHidCommand::Init.as_byte(), channel, &reply)
            .await
        {
            warn!(error = %e, "failed to emit INIT reply on reinit");
        }

        let ble = self.ble.clone();
        self.forwarding_jobs.spawn(async move {
            if let Err(e) = ble.reconnect().await {
                warn!(error = %e, "BLE reconnect failed after INIT reinit");
            }
        });
    }

    fn spawn_init_allocate(&mut self, nonce: Nonce) {
        let new_channel = match self.session.allocate_channel(&mut self.rng) {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "channel allocation exhausted, aborting INIT silently");
                return;
            }
        };
        let ble = self.ble.clone();
        let tx = self.msg_tx.clone();
        self.forwarding_jobs.spawn(async move {
            match ble.connect().await {
                Ok(()) => {
                    let _ = tx
                        .send(EngineMsg::InitAllocated {
                            channel: new_channel,
                            nonce,
                        })
                        .await;
                }
                Err(e) => warn!(error = %e, "BLE connect failed during INIT, aborting silently"),
            }
        });
    }

    async fn handle_hid_frame(&mut self, cmd: CtapHidCommand, channel: ChannelId, payload: Vec<u8>) {
        if channel != self.session.active_channel {
            debug!(channel, active = self.session.active_channel, "frame on non-active channel, ignoring");
            return;
        }

        match translate_hid(cmd, payload) {
            HidDispatch::SendBle { cmd, payload } => self.spawn_reassembly_finisher(cmd, payload),
            HidDispatch::SendBleAndCancelPending { cmd, payload } => {
                // Sweep every pending task *before* spawning the CANCEL send
                // itself, so the sweep never races with (or cancels) the job
                // it is about to create.
                self.forwarding_jobs.abort_all();
                self.reassembly_finishers.abort_all();
                self.spawn_cancel_send(cmd, payload);
            }
            HidDispatch::Accepted => {}
        }
    }

    /// Forward a HID `CANCEL` as BLE `CANCEL`. Spawned rather than awaited
    /// inline: `ensure_connected` can retry for several seconds, and this
    /// must not block `run()`'s single select loop from processing other
    /// HID/BLE/timeout events while it waits.
    fn spawn_cancel_send(&mut self, ble_cmd: u8, payload: Vec<u8>) {
        let ble = self.ble.clone();
        let max_attempts = self.max_reconnect_attempts;
        let tx = self.msg_tx.clone();
        self.forwarding_jobs.spawn(async move {
            if !ensure_connected(&*ble, max_attempts).await {
                warn!("BLE reconnect attempts exhausted, dropping CANCEL");
                return;
            }
            let _ = tx.send(EngineMsg::Rearm).await;
            let mtu = ble.control_point_length();
            for frame in ble_fragment(ble_cmd, &payload, mtu) {
                if let Err(e) = ble.send(&frame).await {
                    warn!(error = %e, "BLE CANCEL send failed mid-fragment");
                    break;
                }
            }
        });
    }

    fn spawn_reassembly_finisher(&mut self, ble_cmd: u8, payload: Vec<u8>) {
        let ble = self.ble.clone();
        let channel = self.session.active_channel;
        let max_attempts = self.max_reconnect_attempts;
        let tx = self.msg_tx.clone();
        self.reassembly_finishers.spawn(async move {
            if !ensure_connected(&*ble, max_attempts).await {
                error!("BLE reconnect attempts exhausted, surfacing HID error");
                let _ = tx
                    .send(EngineMsg::HidError {
                        channel,
                        code: CTAP1_ERR_OTHER,
                    })
                    .await;
                return;
            }
            let _ = tx.send(EngineMsg::Rearm).await;
            let mtu = ble.control_point_length();
            for frame in ble_fragment(ble_cmd, &payload, mtu) {
                if let Err(e) = ble.send(&frame).await {
                    warn!(error = %e, "BLE send failed mid-fragment, abandoning this frame");
                    break;
                }
            }
        });
    }

    async fn handle_ble_notification(&mut self, bytes: Vec<u8>) {
        if let Some((cmd, payload)) = ble_ingress(&mut self.session.ble_state, &bytes) {
            self.idle.arm();
            if let Some(dispatch) = translate_ble(cmd, payload) {
                if let Err(e) = self
                    .emit_hid(dispatch.cmd, self.session.active_channel, &dispatch.payload)
                    .await
                {
                    warn!(error = %e, "failed to emit translated HID frame");
                }
            }
            self.session.ble_state.reset();
        }
    }

    async fn emit_hid(&self, cmd: u8, channel: ChannelId, payload: &[u8]) -> Result<(), BridgeError> {
        for report in hid_fragment(cmd, channel, payload) {
            self.hid.send_input(report).await?;
        }
        Ok(())
    }

    async fn emit_hid_error(&self, channel: ChannelId, code: u8) -> Result<(), BridgeError> {
        self.emit_hid(CtapHidCommand::Error.as_byte(), channel, &[code]).await
    }

    async fn handle_idle_timeout(&mut self) {
        debug!("idle timeout fired, disconnecting BLE and reaping pending jobs");
        self.idle.fire();
        if let Err(e) = self.ble.disconnect().await {
            warn!(error = %e, "BLE disconnect on idle timeout failed");
        }
        self.forwarding_jobs.abort_all();
        self.session.deactivate();
    }

    async fn teardown(&mut self) {
        debug!("reference count reached zero, tearing down session");
        self.idle.disarm();
        let _ = self.ble.disconnect().await;
        self.forwarding_jobs.abort_all();
        self.reassembly_finishers.abort_all();
    }
}

/// Shared by the spawned CANCEL-send and reassembly-finisher jobs: reconnect
/// with a 1-second backoff, bounded per the design note on unbounded
/// reconnect spin.
async fn ensure_connected(ble: &dyn BleTransport, max_attempts: u32) -> bool {
    if ble.is_connected().await {
        return true;
    }
    for attempt in 1..=max_attempts {
        match ble.reconnect().await {
            Ok(()) => return true,
            Err(e) => {
                warn!(attempt, error = %e, "BLE reconnect attempt failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    false
}
