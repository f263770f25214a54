use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::mpsc::UnboundedReceiver, time::timeout};

use sma_victron_grid_meter::{
    grid_meter, AttributeStore, AttributeValue, BusPeer, ChangeBatch, ChangeNotifier,
    MeterListener, StoreError,
};

/// Builds SMA energy meter telegrams the way the meter lays them out on the wire
struct MockMeterTelegram {
    bytes: Vec<u8>,
}

impl MockMeterTelegram {
    const PHASE_BLOCKS: [usize; 3] = [164, 308, 452];

    fn new(serial: u32) -> Self {
        let mut bytes = vec![0u8; 600];
        bytes[0..4].copy_from_slice(b"SMA\0");
        bytes[16..18].copy_from_slice(&0x6069u16.to_be_bytes());
        bytes[20..24].copy_from_slice(&serial.to_be_bytes());
        Self { bytes }
    }

    fn u32_at(mut self, offset: usize, value: u32) -> Self {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        self
    }

    fn u64_at(mut self, offset: usize, value: u64) -> Self {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
        self
    }

    /// Power in 0.1 W, energy in watt seconds
    fn totals(self, import_power: u32, export_power: u32, import_ws: u64, export_ws: u64) -> Self {
        self.u32_at(32, import_power)
            .u32_at(52, export_power)
            .u64_at(40, import_ws)
            .u64_at(60, export_ws)
    }

    fn phase(self, index: usize, import_power: u32, export_power: u32, millivolts: u32) -> Self {
        let base = Self::PHASE_BLOCKS[index];
        self.u32_at(base + 4, import_power)
            .u32_at(base + 24, export_power)
            .u32_at(base + 132, millivolts)
    }

    fn build(self) -> Vec<u8> {
        self.bytes
    }
}

struct Bridge {
    store: Arc<AttributeStore>,
    peer: BusPeer,
    changes: UnboundedReceiver<ChangeBatch>,
    meter_addr: SocketAddr,
    sender: UdpSocket,
}

/// Starts the receive loop on a loopback socket instead of the multicast group
async fn start_bridge(serial_filter: Option<u32>) -> Bridge {
    let store = Arc::new(AttributeStore::new());
    grid_meter::initialize(&store);
    let (notifier, changes) = ChangeNotifier::new();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let meter_addr = socket.local_addr().unwrap();
    MeterListener::new(store.clone(), notifier, serial_filter).spawn(socket);

    Bridge {
        peer: BusPeer::new(store.clone()),
        store,
        changes,
        meter_addr,
        sender: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
    }
}

impl Bridge {
    async fn send(&self, telegram: &[u8]) {
        self.sender.send_to(telegram, self.meter_addr).await.unwrap();
    }

    async fn next_batch(&mut self) -> Option<ChangeBatch> {
        timeout(Duration::from_millis(500), self.changes.recv())
            .await
            .ok()
            .flatten()
    }
}

fn typical_telegram(serial: u32) -> Vec<u8> {
    MockMeterTelegram::new(serial)
        .totals(19090, 0, 12_960_000, 3_600_000)
        .phase(0, 6900, 0, 230_000)
        .phase(1, 6900, 0, 230_000)
        .phase(2, 5290, 0, 230_000)
        .build()
}

#[tokio::test]
async fn test_full_integration() {
    let mut bridge = start_bridge(None).await;

    // Test 1: a telegram updates the published state and emits one batch
    bridge.send(&typical_telegram(1900123456)).await;
    let batch = bridge
        .next_batch()
        .await
        .expect("Should receive change notification");

    assert_eq!(batch["/Ac/Power"].value, AttributeValue::Double(1909.0));
    assert_eq!(batch["/Ac/L1/Current"].value, AttributeValue::Double(3.0));
    assert_eq!(batch["/Ac/Current"].value, AttributeValue::Double(8.3));
    assert_eq!(batch["/Ac/Voltage"].value, AttributeValue::Double(230.0));
    assert_eq!(batch["/Ac/Energy/Forward"].text, "3.60kWh");
    assert_eq!(batch["/Ac/Energy/Reverse"].text, "1.00kWh");
    assert!(!batch.contains_key("/Serial"));

    assert_eq!(
        bridge.peer.get_value("/Ac/Power").unwrap(),
        AttributeValue::Double(1909.0)
    );
    assert_eq!(bridge.peer.get_text("/Ac/L3/Power").unwrap(), "529.00W");
    println!("✅ Test 1 passed: telegram decoded and published");

    // Test 2: the same telegram again produces no traffic
    bridge.send(&typical_telegram(1900123456)).await;
    assert!(
        bridge.next_batch().await.is_none(),
        "Unchanged telegram should not notify"
    );
    println!("✅ Test 2 passed: identical telegram is silent");

    // Test 3: only the changed paths are in the next batch
    let telegram = MockMeterTelegram::new(1900123456)
        .totals(19090, 0, 12_960_000, 3_600_000)
        .phase(0, 6900, 0, 230_000)
        .phase(1, 6900, 0, 230_000)
        .phase(2, 0, 2300, 230_000)
        .build();
    bridge.send(&telegram).await;
    let batch = bridge.next_batch().await.expect("Should receive changes");
    let mut paths: Vec<_> = batch.keys().map(String::as_str).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["/Ac/Current", "/Ac/L3/Current", "/Ac/L3/Power"]
    );
    assert_eq!(batch["/Ac/L3/Power"].value, AttributeValue::Double(-230.0));
    assert_eq!(batch["/Ac/L3/Current"].value, AttributeValue::Double(-1.0));
    println!("✅ Test 3 passed: only changed paths notified");
}

#[tokio::test]
async fn test_rejected_telegrams_are_ignored() {
    let mut bridge = start_bridge(Some(42)).await;
    let before = bridge.store.snapshot_all().unwrap();

    // Foreign meter, broadcast serial, wrong protocol and a short packet
    bridge.send(&typical_telegram(43)).await;
    bridge.send(&typical_telegram(0xFFFF_FFFF)).await;
    let mut wrong_protocol = typical_telegram(42);
    wrong_protocol[16..18].copy_from_slice(&0x6081u16.to_be_bytes());
    bridge.send(&wrong_protocol).await;
    bridge.send(&typical_telegram(42)[..100]).await;

    assert!(bridge.next_batch().await.is_none());
    assert_eq!(bridge.store.snapshot_all().unwrap(), before);

    // The loop keeps running and accepts the configured meter
    bridge.send(&typical_telegram(42)).await;
    assert!(bridge.next_batch().await.is_some());
    println!("✅ Test passed: rejected telegrams leave state untouched");
}

#[tokio::test]
async fn test_bus_writes_do_not_notify() {
    let mut bridge = start_bridge(None).await;

    assert_eq!(
        bridge
            .peer
            .set_value("/CustomName", AttributeValue::Text("Main".to_string()))
            .unwrap(),
        0
    );
    assert_eq!(
        bridge.peer.get_value("/CustomName").unwrap(),
        AttributeValue::Text("Main".to_string())
    );
    assert!(bridge.next_batch().await.is_none());
}

#[tokio::test]
async fn test_zero_voltage_phase() {
    let mut bridge = start_bridge(None).await;

    let telegram = MockMeterTelegram::new(1)
        .phase(0, 1000, 0, 0)
        .phase(1, 0, 0, 230_000)
        .phase(2, 0, 0, 230_000)
        .build();
    bridge.send(&telegram).await;
    let batch = bridge.next_batch().await.expect("Should receive changes");
    assert_eq!(batch["/Ac/L1/Power"].value, AttributeValue::Double(100.0));
    assert!(!batch.contains_key("/Ac/L1/Current"));
    assert_eq!(
        bridge.peer.get_value("/Ac/L1/Current").unwrap(),
        AttributeValue::Double(0.0)
    );
}

#[test]
fn test_uninitialized_bus_peer() {
    let peer = BusPeer::new(Arc::new(AttributeStore::new()));
    assert_eq!(peer.get_text("/Serial"), Err(StoreError::NotInitialized));
}
