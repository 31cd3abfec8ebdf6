pub mod controller;
pub mod equalizer;
pub mod info;

pub use controller::{ConnectionController, Timing};
pub use equalizer::{Band, EqState, Preset};
pub use info::DeviceInfo;

/// Events delivered to the CLI/UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    PresetConfirmed,
    CustomEqConfirmed,
    DeviceInfoReceived(DeviceInfo),
    /// A notification that was not a QXW frame (`None`) or had an unknown command.
    Unrecognized(Option<u8>),
    Disconnected,
}

/// Why a connection attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    GattConnect,
    ServiceNotFound,
    Link,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Ready,
    Disconnecting,
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    /// States from which `connect` may start a new attempt.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "Failed({:?})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}
