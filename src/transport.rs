//! # Transport Module
//!
//! The fixed set of things the device manager needs from a radio:
//! probe for an adapter, scan, connect + subscribe to heart-rate
//! notifications, disconnect. Two implementations are selected at runtime:
//!
//! - `Transport::Ble`: a real adapter through btleplug
//! - `Transport::Mock`: an in-process simulated radio with scriptable
//!   peripherals, for running without hardware and for tests
//!
//! A successful connect yields a `Link`: a channel of raw 0x2A37 payloads that
//! ends with `LinkEvent::Closed` (or the channel closing) when the peripheral
//! goes away.

use crate::config::MockConfig;
use crate::device_scanner::{
    find_peripheral, first_adapter, scan_devices, sort_by_signal,
    DiscoveredDevice, HEART_RATE_MEASUREMENT_UUID,
};
use crate::error::{ConnectionError, ScanError};
use crate::mock::BpmWalk;
use crate::sample::Source;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Peripheral as _, ValueNotification};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const LINK_BUFFER: usize = 64;

/// How long to listen for a device that is not in the adapter's cache yet
const CONNECT_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw Heart Rate Measurement payload
    Notification(Vec<u8>),
    /// Fresh signal strength reading in dBm
    Rssi(i16),
    /// The peripheral disconnected
    Closed,
}

/// How a link is torn down
enum LinkHandle {
    Ble(Peripheral),
    Mock(MockTransport),
}

/// An active, subscribed connection to one peripheral
pub struct Link {
    pub address: String,
    pub rssi: Option<i16>,
    events: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
    handle: LinkHandle,
}

impl Link {
    /// Next event from the peripheral; `None` means the link is gone
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

#[derive(Clone)]
pub enum Transport {
    Ble(BleTransport),
    Mock(MockTransport),
}

impl Transport {
    /// Whether a radio is present. Checked once at startup.
    pub fn probe(&self) -> Result<(), ConnectionError> {
        match self {
            Transport::Ble(ble) => ble.probe(),
            Transport::Mock(mock) => mock.probe(),
        }
    }

    /// Source tag for samples that arrive over this transport
    pub fn sample_source(&self) -> Source {
        match self {
            Transport::Ble(_) => Source::Real,
            Transport::Mock(_) => Source::Mock,
        }
    }

    pub async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
        match self {
            Transport::Ble(ble) => ble.scan(window).await,
            Transport::Mock(mock) => mock.scan(window).await,
        }
    }

    /// Connect and subscribe to heart rate notifications
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<Link, ConnectionError> {
        match self {
            Transport::Ble(ble) => ble.connect(address, timeout).await,
            Transport::Mock(mock) => mock.connect(address),
        }
    }

    /// Tear a link down; best effort, errors are only logged.
    ///
    /// Gives up after `timeout` so a wedged radio cannot hold up shutdown.
    pub async fn disconnect(&self, link: Link, timeout: Duration) {
        link.cancel.cancel();
        let address = link.address;
        let closing = async {
            match link.handle {
                LinkHandle::Ble(peripheral) => {
                    peripheral.disconnect().await.map_err(|e| e.to_string())
                }
                LinkHandle::Mock(mock) => {
                    mock.detach(&address).await;
                    Ok(())
                }
            }
        };

        match tokio::time::timeout(timeout, closing).await {
            Ok(Ok(())) => log::info!("Disconnected from {}", address),
            Ok(Err(e)) => log::warn!("Disconnect from {} failed: {}", address, e),
            Err(_) => log::warn!(
                "Disconnect from {} did not finish within {} ms, abandoning it",
                address,
                timeout.as_millis()
            ),
        }
    }
}

/// btleplug-backed transport
#[derive(Clone)]
pub struct BleTransport {
    adapter: Option<Adapter>,
}

impl BleTransport {
    /// Look for an adapter once; without one the transport stays unavailable
    pub async fn new() -> Self {
        match first_adapter().await {
            Ok(adapter) => BleTransport { adapter: Some(adapter) },
            Err(e) => {
                log::warn!("Bluetooth unavailable: {}", e);
                BleTransport { adapter: None }
            }
        }
    }

    fn adapter(&self) -> Result<&Adapter, ConnectionError> {
        self.adapter.as_ref().ok_or(ConnectionError::AdapterUnavailable)
    }

    fn probe(&self) -> Result<(), ConnectionError> {
        self.adapter().map(|_| ())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let adapter = self.adapter.as_ref().ok_or(ScanError::AdapterUnavailable)?;
        scan_devices(adapter, window).await
    }

    async fn locate(
        &self,
        adapter: &Adapter,
        address: &str,
    ) -> Result<Peripheral, ConnectionError> {
        if let Some(peripheral) = find_peripheral(adapter, address).await? {
            return Ok(peripheral);
        }
        // not cached yet: listen briefly, then look again
        scan_devices(adapter, CONNECT_DISCOVERY_WINDOW).await?;
        find_peripheral(adapter, address)
            .await?
            .ok_or_else(|| ConnectionError::DeviceNotFound(address.to_string()))
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<Link, ConnectionError> {
        let adapter = self.adapter()?;
        let peripheral = self.locate(adapter, address).await?;
        let failed = |reason: String| ConnectionError::ConnectFailed {
            address: address.to_string(),
            reason,
        };

        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => return Err(failed(format!("timed out after {} ms", timeout.as_millis()))),
        }

        match self.subscribe(adapter, &peripheral, address).await {
            Ok(link) => Ok(link),
            Err(e) => {
                let _ = tokio::time::timeout(timeout, peripheral.disconnect()).await;
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        adapter: &Adapter,
        peripheral: &Peripheral,
        address: &str,
    ) -> Result<Link, ConnectionError> {
        let failed = |reason: String| ConnectionError::ConnectFailed {
            address: address.to_string(),
            reason,
        };

        peripheral
            .discover_services()
            .await
            .map_err(|e| failed(format!("service discovery failed: {}", e)))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid == HEART_RATE_MEASUREMENT_UUID
                    && c.properties.contains(CharPropFlags::NOTIFY)
            })
            .ok_or_else(|| failed("heart rate measurement characteristic not found".to_string()))?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| failed(format!("subscribe failed: {}", e)))?;

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| failed(format!("notification stream unavailable: {}", e)))?;
        let central_events = adapter
            .events()
            .await
            .map_err(|e| failed(format!("adapter event stream unavailable: {}", e)))?;

        let rssi = peripheral.properties().await.ok().flatten().and_then(|p| p.rssi);
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(pump_notifications(
            notifications,
            central_events,
            peripheral.clone(),
            tx,
            cancel.clone(),
        ));

        log::info!("Subscribed to heart rate notifications from {}", address);
        Ok(Link {
            address: address.to_string(),
            rssi,
            events: rx,
            cancel,
            handle: LinkHandle::Ble(peripheral.clone()),
        })
    }
}

/// Forward heart rate notifications into the link channel until the device
/// disconnects or the link is cancelled. Adapter updates for the peripheral
/// are forwarded as RSSI readings.
async fn pump_notifications(
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    mut central_events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    peripheral: Peripheral,
    tx: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let id = peripheral.id();
    let mut central_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notification = notifications.next() => match notification {
                Some(n) if n.uuid == HEART_RATE_MEASUREMENT_UUID => {
                    if tx.send(LinkEvent::Notification(n.value)).await.is_err() {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    let _ = tx.send(LinkEvent::Closed).await;
                    break;
                }
            },
            event = central_events.next(), if central_open => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                    let _ = tx.send(LinkEvent::Closed).await;
                    break;
                }
                Some(CentralEvent::DeviceUpdated(updated)) if updated == id => {
                    let rssi = peripheral.properties().await.ok().flatten().and_then(|p| p.rssi);
                    if let Some(rssi) = rssi {
                        // readings are advisory, never block notifications on them
                        let _ = tx.try_send(LinkEvent::Rssi(rssi));
                    }
                }
                Some(_) => {}
                None => central_open = false,
            },
        }
    }
}

struct MockDevice {
    info: DiscoveredDevice,
    in_range: bool,
    failures_left: u32,
    stall_disconnect: bool,
    link: Option<mpsc::Sender<LinkEvent>>,
}

#[derive(Default)]
struct MockRadio {
    adapter_missing: bool,
    devices: Vec<MockDevice>,
}

impl MockRadio {
    fn device_mut(&mut self, address: &str) -> Option<&mut MockDevice> {
        self.devices.iter_mut().find(|d| d.info.address == address)
    }
}

/// In-process simulated radio
#[derive(Clone, Default)]
pub struct MockTransport {
    radio: Arc<Mutex<MockRadio>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A radio that behaves like a machine with no Bluetooth adapter
    pub fn without_adapter() -> Self {
        let transport = Self::default();
        transport.radio.lock().adapter_missing = true;
        transport
    }

    /// Put a simulated heart-rate monitor in range
    pub fn add_device(
        &self,
        address: &str,
        name: Option<&str>,
        rssi: Option<i16>,
    ) -> MockPeripheral {
        self.radio.lock().devices.push(MockDevice {
            info: DiscoveredDevice::new(address, name.map(str::to_string), rssi),
            in_range: true,
            failures_left: 0,
            stall_disconnect: false,
            link: None,
        });
        MockPeripheral {
            address: address.to_string(),
            transport: self.clone(),
        }
    }

    fn probe(&self) -> Result<(), ConnectionError> {
        if self.radio.lock().adapter_missing {
            Err(ConnectionError::AdapterUnavailable)
        } else {
            Ok(())
        }
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, ScanError> {
        if self.radio.lock().adapter_missing {
            return Err(ScanError::AdapterUnavailable);
        }
        tokio::time::sleep(window).await;

        let mut devices: Vec<DiscoveredDevice> = self
            .radio
            .lock()
            .devices
            .iter()
            .filter(|d| d.in_range)
            .map(|d| d.info.clone())
            .collect();
        sort_by_signal(&mut devices);
        Ok(devices)
    }

    fn connect(&self, address: &str) -> Result<Link, ConnectionError> {
        let mut radio = self.radio.lock();
        if radio.adapter_missing {
            return Err(ConnectionError::AdapterUnavailable);
        }
        let device = radio
            .device_mut(address)
            .filter(|d| d.in_range)
            .ok_or_else(|| ConnectionError::DeviceNotFound(address.to_string()))?;

        if device.failures_left > 0 {
            device.failures_left -= 1;
            return Err(ConnectionError::ConnectFailed {
                address: address.to_string(),
                reason: "simulated connect failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        device.link = Some(tx);
        Ok(Link {
            address: address.to_string(),
            rssi: device.info.rssi,
            events: rx,
            cancel: CancellationToken::new(),
            handle: LinkHandle::Mock(self.clone()),
        })
    }

    async fn detach(&self, address: &str) {
        let stalled = match self.radio.lock().device_mut(address) {
            Some(device) if device.stall_disconnect => true,
            Some(device) => {
                device.link = None;
                false
            }
            None => false,
        };
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

/// Test and demo handle for one simulated peripheral
#[derive(Clone)]
pub struct MockPeripheral {
    address: String,
    transport: MockTransport,
}

impl MockPeripheral {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Deliver a raw payload; false when nothing is connected
    pub fn notify_raw(&self, payload: Vec<u8>) -> bool {
        let mut radio = self.transport.radio.lock();
        match radio.device_mut(&self.address).and_then(|d| d.link.as_ref()) {
            Some(link) => link.try_send(LinkEvent::Notification(payload)).is_ok(),
            None => false,
        }
    }

    /// Deliver a heart rate in the 8-bit or 16-bit measurement format
    pub fn notify_bpm(&self, bpm: u16) -> bool {
        let payload = match u8::try_from(bpm) {
            Ok(small) => vec![0x00, small],
            Err(_) => {
                let [lo, hi] = bpm.to_le_bytes();
                vec![0x01, lo, hi]
            }
        };
        self.notify_raw(payload)
    }

    pub fn is_linked(&self) -> bool {
        let mut radio = self.transport.radio.lock();
        radio
            .device_mut(&self.address)
            .map_or(false, |d| d.link.as_ref().map_or(false, |l| !l.is_closed()))
    }

    /// Simulate the peripheral dropping the connection
    pub fn drop_link(&self) {
        let mut radio = self.transport.radio.lock();
        if let Some(link) = radio.device_mut(&self.address).and_then(|d| d.link.take()) {
            let _ = link.try_send(LinkEvent::Closed);
        }
    }

    /// Walk out of (or back into) radio range
    pub fn set_in_range(&self, in_range: bool) {
        let mut radio = self.transport.radio.lock();
        if let Some(device) = radio.device_mut(&self.address) {
            device.in_range = in_range;
        }
    }

    /// Report a new signal strength, to the active link as well
    pub fn set_rssi(&self, rssi: i16) -> bool {
        let mut radio = self.transport.radio.lock();
        match radio.device_mut(&self.address) {
            Some(device) => {
                device.info.rssi = Some(rssi);
                device
                    .link
                    .as_ref()
                    .map_or(false, |link| link.try_send(LinkEvent::Rssi(rssi)).is_ok())
            }
            None => false,
        }
    }

    /// Make disconnect requests hang, like a wedged radio stack
    pub fn stall_disconnects(&self, stall: bool) {
        let mut radio = self.transport.radio.lock();
        if let Some(device) = radio.device_mut(&self.address) {
            device.stall_disconnect = stall;
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        let mut radio = self.transport.radio.lock();
        if let Some(device) = radio.device_mut(&self.address) {
            device.failures_left = count;
        }
    }

    /// Feed this peripheral from a random walk until cancelled
    pub async fn run_demo(self, config: MockConfig, cancel: CancellationToken) {
        let mut walk = BpmWalk::new(&config);
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.notify_bpm(walk.next_bpm());
                }
            }
        }
    }
}
