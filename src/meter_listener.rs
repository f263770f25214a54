use crate::attribute_store::AttributeStore;
use crate::change_notifier::ChangeNotifier;
use crate::frame_decoder::{self, DecodeError};
use crate::grid_meter;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest datagram we accept from the network
const MAX_DATAGRAM_SIZE: usize = 8192;
const RECEIVE_RETRY_BASE: Duration = Duration::from_millis(50);
const RECEIVE_RETRY_MAX: Duration = Duration::from_secs(5);

/// Receive loop for meter telegrams. Decodes each datagram, applies it to the
/// store and queues one notification per frame that changed anything.
pub struct MeterListener {
    store: Arc<AttributeStore>,
    notifier: ChangeNotifier,
    serial_filter: Option<u32>,
}

impl MeterListener {
    pub fn new(
        store: Arc<AttributeStore>,
        notifier: ChangeNotifier,
        serial_filter: Option<u32>,
    ) -> Self {
        Self {
            store,
            notifier,
            serial_filter,
        }
    }

    /// Processes one datagram and returns how many paths changed.
    ///
    /// A rejected datagram leaves the store untouched and sends nothing.
    pub fn handle_message(&self, datagram: &[u8]) -> Result<usize, DecodeError> {
        let frame = frame_decoder::decode(datagram, self.serial_filter)?;

        tracing::debug!("Total W: {}", frame.total_power_watts);
        tracing::debug!("Total Buy kWh: {}", frame.total_energy_imported_kwh);
        tracing::debug!("Total Sell kWh: {}", frame.total_energy_exported_kwh);
        tracing::info!(
            "Meter update received: {:.2} kWh bought and {:.2} kWh sold, {:.1} W currently flowing",
            frame.total_energy_imported_kwh,
            frame.total_energy_exported_kwh,
            frame.total_power_watts
        );
        grid_meter::log_phase_table(&frame);

        let changed = match self
            .store
            .apply_measurements(&grid_meter::measurements_for(&frame))
        {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!("Dropping meter update: {e}");
                return Ok(0);
            }
        };
        let count = changed.len();
        self.notifier.notify(changed);
        Ok(count)
    }

    /// Spawns the receive loop on its own task
    pub fn spawn(self, socket: UdpSocket) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(socket).await;
        })
    }

    /// Reads datagrams forever. Socket errors are logged and reading continues.
    pub async fn run(&self, socket: UdpSocket) {
        match socket.local_addr() {
            Ok(addr) => tracing::info!("Listening for meter updates on {addr}"),
            Err(e) => tracing::warn!("Listening for meter updates on unknown address: {e}"),
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut consecutive_errors = 0u32;
        loop {
            let (len, src) = match socket.recv_from(&mut buffer).await {
                Ok(received) => {
                    consecutive_errors = 0;
                    received
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = receive_retry_delay(consecutive_errors);
                    tracing::warn!(
                        "Failed to receive datagram ({consecutive_errors} in a row), retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            tracing::trace!("Received {len} byte datagram from {src}");

            match self.handle_message(&buffer[..len]) {
                Ok(0) => tracing::debug!("Meter update from {src} changed nothing"),
                Ok(count) => tracing::debug!("Meter update from {src} changed {count} paths"),
                Err(DecodeError::ForeignMeter { expected, actual }) => tracing::debug!(
                    "Ignoring update from meter {actual}, listening for {expected} only"
                ),
                Err(reason) => tracing::debug!("Rejected datagram from {src}: {reason}"),
            }
        }
    }
}

/// Exponential backoff after repeated socket errors, capped at five seconds
fn receive_retry_delay(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    RECEIVE_RETRY_BASE
        .saturating_mul(1 << exponent)
        .min(RECEIVE_RETRY_MAX)
}

/// Binds to the multicast port on all interfaces and joins `group`
pub async fn bind_multicast(group: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
    socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
    tracing::info!("Joined multicast group {group}");
    Ok(socket)
}
