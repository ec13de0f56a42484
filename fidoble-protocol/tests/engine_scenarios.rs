//! End-to-end engine scenarios (see the testable properties' numbered
//! scenarios) driven against mock transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fidoble_protocol::protocol::hid_fragment;
use fidoble_protocol::types::{CtapBleCommand, CtapHidCommand, BROADCAST_CHANNEL};
use fidoble_protocol::{BleTransport, Bridge, BridgeConfig, BridgeError, HidTransport, HidTransportEvent};
use tokio::sync::{broadcast, mpsc, Mutex};

struct MockHid {
    inbound: Mutex<mpsc::Receiver<HidTransportEvent>>,
    outbound: Arc<Mutex<Vec<[u8; 64]>>>,
}

#[async_trait]
impl HidTransport for MockHid {
    async fn wait_ready(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn next_event(&self) -> Result<HidTransportEvent, BridgeError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BridgeError::HidTransportError("mock HID closed".into()))
    }

    async fn send_input(&self, report: [u8; 64]) -> Result<(), BridgeError> {
        self.outbound.lock().await.push(report);
        Ok(())
    }
}

struct MockBle {
    connected: Mutex<bool>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    mtu: u16,
    fail_reconnect: std::sync::atomic::AtomicBool,
}

impl MockBle {
    fn new(mtu: u16) -> (Arc<Self>, broadcast::Sender<Vec<u8>>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (notify_tx, _) = broadcast::channel(16);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let ble = Arc::new(Self {
            connected: Mutex::new(false),
            sent: sent.clone(),
            notify_tx: notify_tx.clone(),
            mtu,
            fail_reconnect: std::sync::atomic::AtomicBool::new(false),
        });
        (ble, notify_tx, sent)
    }
}

#[async_trait]
impl BleTransport for MockBle {
    async fn connect(&self) -> Result<(), BridgeError> {
        *self.connected.lock().await = true;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BridgeError> {
        if self.fail_reconnect.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BridgeError::ConnectFailed("mock reconnect forced to fail".into()));
        }
        *self.connected.lock().await = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        *self.connected.lock().await = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    async fn send(&self, frame: &[u8]) -> Result<(), BridgeError> {
        self.sent.lock().await.push(frame.to_vec());
        Ok(())
    }

    fn control_point_length(&self) -> u16 {
        self.mtu
    }

    fn device_id(&self) -> String {
        "ctapble_AA_BB_CC_DD_EE_FF".to_string()
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.notify_tx.subscribe()
    }
}

struct Harness {
    hid_tx: mpsc::Sender<HidTransportEvent>,
    hid_outbound: Arc<Mutex<Vec<[u8; 64]>>>,
    ble: Arc<MockBle>,
    ble_sent: Arc<Mutex<Vec<Vec<u8>>>>,
    ble_notify_tx: broadcast::Sender<Vec<u8>>,
    run_handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn spawn(config: BridgeConfig) -> Self {
        let (hid_tx, hid_rx) = mpsc::channel(32);
        let hid_outbound = Arc::new(Mutex::new(Vec::new()));
        let hid = Arc::new(MockHid {
            inbound: Mutex::new(hid_rx),
            outbound: hid_outbound.clone(),
        });

        let (ble, ble_notify_tx, ble_sent) = MockBle::new(60);

        let bridge = Bridge::new(hid, ble.clone(), config);
        let run_handle = tokio::spawn(async move {
            let _ = bridge.run().await;
        });

        Self {
            hid_tx,
            hid_outbound,
            ble,
            ble_sent,
            ble_notify_tx,
            run_handle,
        }
    }

    async fn send_report(&self, report: [u8; 64]) {
        self.hid_tx
            .send(HidTransportEvent::Output(report))
            .await
            .unwrap();
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.run_handle.abort();
    }
}

fn init_report(nonce: [u8; 8]) -> [u8; 64] {
    let mut report = [0u8; 64];
    report[0..4].copy_from_slice(&BROADCAST_CHANNEL.to_be_bytes());
    report[4] = 0x80 | CtapHidCommand::Init.as_byte();
    report[5..13].copy_from_slice(&nonce);
    report
}

#[tokio::test]
async fn init_happy_path_allocates_channel_and_replies() {
    let harness = Harness::spawn(BridgeConfig::default()).await;
    let nonce = [1, 2, 3, 4, 5, 6, 7, 8];

    harness.send_report(init_report(nonce)).await;
    harness.settle().await;

    let outbound = harness.hid_outbound.lock().await;
    assert_eq!(outbound.len(), 1);
    let reply = outbound[0];
    assert_eq!(&reply[0..4], &BROADCAST_CHANNEL.to_be_bytes());
    assert_eq!(reply[4], 0x80 | CtapHidCommand::Init.as_byte());
    let reply_len = u16::from_be_bytes([reply[5], reply[6]]);
    assert_eq!(reply_len, 17);
    assert_eq!(&reply[7..15], &nonce);
    let new_channel = u32::from_be_bytes(reply[15..19].try_into().unwrap());
    assert_ne!(new_channel, 0);
    assert_ne!(new_channel, BROADCAST_CHANNEL);
}

async fn complete_init(harness: &Harness) -> u32 {
    let nonce = [9u8; 8];
    harness.send_report(init_report(nonce)).await;
    harness.settle().await;
    let outbound = harness.hid_outbound.lock().await;
    let reply = outbound[0];
    u32::from_be_bytes(reply[15..19].try_into().unwrap())
}

#[tokio::test]
async fn cbor_request_is_fragmented_and_forwarded_over_ble() {
    let harness = Harness::spawn(BridgeConfig::default()).await;
    let channel = complete_init(&harness).await;

    let payload: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
    let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), channel, &payload);
    for report in reports {
        harness.send_report(report).await;
    }
    harness.settle().await;

    let sent = harness.ble_sent.lock().await;
    assert!(!sent.is_empty());
    assert_eq!(sent[0][0], CtapBleCommand::Msg.as_byte());
    let reassembled: Vec<u8> = sent
        .iter()
        .flat_map(|frame| {
            if frame[0] & 0x80 != 0 {
                frame[3..].to_vec()
            } else {
                frame[1..].to_vec()
            }
        })
        .collect();
    assert_eq!(&reassembled[0..payload.len()], &payload[..]);
}

#[tokio::test]
async fn ble_msg_notification_becomes_hid_cbor_reply() {
    let harness = Harness::spawn(BridgeConfig::default()).await;
    let channel = complete_init(&harness).await;
    harness.hid_outbound.lock().await.clear();

    let payload = vec![0xAAu8; 50];
    let mut notification = vec![CtapBleCommand::Msg.as_byte()];
    notification.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    notification.extend_from_slice(&payload);
    harness.ble_notify_tx.send(notification).unwrap();
    harness.settle().await;

    let outbound = harness.hid_outbound.lock().await;
    assert_eq!(outbound.len(), 1);
    let report = outbound[0];
    assert_eq!(&report[0..4], &channel.to_be_bytes());
    assert_eq!(report[4], 0x80 | CtapHidCommand::Cbor.as_byte());
    let len = u16::from_be_bytes([report[5], report[6]]);
    assert_eq!(len as usize, payload.len());
    assert_eq!(&report[7..7 + payload.len()], &payload[..]);
}

#[tokio::test]
async fn hid_cancel_sends_ble_cancel_and_clears_pending_jobs() {
    let harness = Harness::spawn(BridgeConfig::default()).await;
    let channel = complete_init(&harness).await;

    let mut report = [0u8; 64];
    report[0..4].copy_from_slice(&channel.to_be_bytes());
    report[4] = 0x80 | CtapHidCommand::Cancel.as_byte();
    report[5..7].copy_from_slice(&0u16.to_be_bytes());
    harness.send_report(report).await;
    harness.settle().await;

    let sent = harness.ble_sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0], CtapBleCommand::Cancel.as_byte());
}

#[tokio::test]
async fn strict_sequence_mode_emits_hid_error_on_gap() {
    let mut config = BridgeConfig::default();
    config.strict_sequence = true;
    let harness = Harness::spawn(config).await;
    let channel = complete_init(&harness).await;
    harness.hid_outbound.lock().await.clear();

    let payload = vec![0u8; 100];
    let reports = hid_fragment(CtapHidCommand::Cbor.as_byte(), channel, &payload);
    harness.send_report(reports[0]).await;
    let mut bad = reports[1];
    bad[4] = 7; // bogus sequence number
    harness.send_report(bad).await;
    harness.settle().await;

    let outbound = harness.hid_outbound.lock().await;
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0][4], 0x80 | CtapHidCommand::Error.as_byte());
}

#[tokio::test]
async fn reinit_on_known_channel_replies_even_if_ble_reconnect_fails() {
    let harness = Harness::spawn(BridgeConfig::default()).await;
    let nonce = [9u8; 8];
    let channel = complete_init(&harness).await;
    harness.hid_outbound.lock().await.clear();

    // Disconnect and force every future reconnect to fail, then send a
    // second INIT on the already-known channel with the same nonce. The
    // INIT reply must still go out on that channel -- the reply is not
    // gated on the BLE reconnect succeeding.
    harness.ble.disconnect().await.unwrap();
    harness
        .ble
        .fail_reconnect
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let mut report = [0u8; 64];
    report[0..4].copy_from_slice(&channel.to_be_bytes());
    report[4] = 0x80 | CtapHidCommand::Init.as_byte();
    report[5..13].copy_from_slice(&nonce);
    harness.send_report(report).await;
    harness.settle().await;

    let outbound = harness.hid_outbound.lock().await;
    assert_eq!(outbound.len(), 1);
    let reply = outbound[0];
    assert_eq!(&reply[0..4], &channel.to_be_bytes());
    assert_eq!(reply[4], 0x80 | CtapHidCommand::Init.as_byte());
    assert_eq!(&reply[7..15], &nonce);
}
