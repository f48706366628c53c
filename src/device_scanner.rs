use crate::error::ScanError;
use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Heart Rate GATT service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name,
            rssi,
        }
    }
}

/// Strongest signal first; devices without an RSSI reading go last
pub fn sort_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
}

/// Stable address for a peripheral.
///
/// CoreBluetooth hides MAC addresses (they read as all zeros), so the
/// platform peripheral id is used there instead.
pub fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

/// First Bluetooth adapter on this machine
pub async fn first_adapter() -> Result<Adapter, ScanError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to create BLE manager: {}", e)))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to get adapters: {}", e)))?;

    adapters.into_iter().next().ok_or(ScanError::AdapterUnavailable)
}

/// Scans for nearby devices advertising the Heart Rate service
pub async fn scan_devices(
    adapter: &Adapter,
    window: Duration,
) -> Result<Vec<DiscoveredDevice>, ScanError> {
    let filter = ScanFilter {
        services: vec![HEART_RATE_SERVICE_UUID],
    };
    adapter
        .start_scan(filter)
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to start scan: {}", e)))?;

    tokio::time::sleep(window).await;

    adapter
        .stop_scan()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to stop scan: {}", e)))?;

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to get peripherals: {}", e)))?;

    let mut devices = Vec::new();

    for peripheral in peripherals {
        // Not every backend honours the scan filter, so check the advertisement too
        if let Ok(Some(props)) = peripheral.properties().await {
            if props.services.contains(&HEART_RATE_SERVICE_UUID) {
                devices.push(DiscoveredDevice::new(
                    peripheral_address(&peripheral),
                    props.local_name,
                    props.rssi,
                ));
            }
        }
    }

    sort_by_signal(&mut devices);
    log::info!("Scan found {} heart rate device(s)", devices.len());
    Ok(devices)
}

/// Find an already-discovered peripheral by address
pub async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<Peripheral>, ScanError> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| ScanError::ScanFailed(format!("Failed to get peripherals: {}", e)))?;

    Ok(peripherals
        .into_iter()
        .find(|p| peripheral_address(p).eq_ignore_ascii_case(address)))
}
