use std::time::Duration;

use anyhow::Result;
use bluer::{Address, AdapterEvent, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{pin_mut, StreamExt};
use tracing::{debug, info};

/// A BLE device seen during discovery.
#[derive(Debug, Clone)]
pub struct BleDevice {
    pub name: Option<String>,
    pub address: Address,
    pub rssi: Option<i16>,
}

/// Run LE discovery for `duration` and list what was seen, strongest signal first.
///
/// Scanning also helps wake up the BlueZ LE stack before a reconnect.
pub async fn scan_le_devices(duration: Duration) -> Result<Vec<BleDevice>> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        })
        .await?;

    info!("Scanning for BLE devices ({:?})", duration);
    let mut seen = Vec::new();
    {
        let events = adapter.discover_devices().await?;
        pin_mut!(events);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        if !seen.contains(&addr) {
                            seen.push(addr);
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }

    let mut result = Vec::with_capacity(seen.len());
    for addr in seen {
        let device = adapter.device(addr)?;
        let name = device.name().await?;
        let rssi = device.rssi().await?;
        debug!("Found device: {:?} ({}), rssi={:?}", name, addr, rssi);
        result.push(BleDevice {
            name,
            address: addr,
            rssi,
        });
    }

    result.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
    info!("Found {} BLE devices", result.len());
    Ok(result)
}
