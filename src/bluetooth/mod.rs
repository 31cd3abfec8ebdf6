pub mod gatt;
pub mod scanner;

use async_trait::async_trait;
use bluer::Uuid;
use tokio::sync::mpsc;

/// QXW service (0xFF12 in the Bluetooth base UUID).
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff12_0000_1000_8000_00805f9b34fb);

/// Characteristic commands are written to (write-without-response).
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ff15_0000_1000_8000_00805f9b34fb);

/// Characteristic responses are notified on.
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000ff14_0000_1000_8000_00805f9b34fb);

/// GATT endpoints the controller resolves during service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattUuids {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl Default for GattUuids {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            write: WRITE_UUID,
            notify: NOTIFY_UUID,
        }
    }
}

/// Something a link reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Value notified on the notify characteristic.
    Notification(Vec<u8>),
    /// The peripheral went away (out of range, powered off, ...).
    Disconnected,
}

pub type LinkEventSender = mpsc::Sender<LinkEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("service {0} not found")]
    ServiceMissing(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

impl From<bluer::Error> for LinkError {
    fn from(e: bluer::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

/// A BLE connection to one peripheral, as consumed by the connection controller.
///
/// Implementations are driven strictly in order: `connect`, `discover`,
/// `subscribe`, any number of `write`s, then `unsubscribe`/`disconnect`.
#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    /// Establish the GATT connection. Notifications and the disconnection
    /// signal are delivered on `events` from now on.
    async fn connect(&self, events: LinkEventSender) -> Result<(), LinkError>;

    /// Resolve the service and its write/notify characteristics.
    async fn discover(&self, uuids: GattUuids) -> Result<(), LinkError>;

    /// Start notifications on the notify characteristic.
    async fn subscribe(&self) -> Result<(), LinkError>;

    async fn unsubscribe(&self) -> Result<(), LinkError>;

    /// Write without response to the write characteristic.
    async fn write(&self, data: &[u8]) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}
