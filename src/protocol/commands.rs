/// Command and frame-type codes for the QXW protocol.
/// Every field on the wire is a single byte.

/// "QXW" magic prefix at the start of every frame.
pub const MAGIC: [u8; 3] = [0x51, 0x58, 0x57];

/// Sub-code that must follow the DeviceInfo command byte in a device-info notification.
pub const DEVICE_INFO_SUBCODE: u8 = 0x02;

/// Commands understood by the earbuds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Select a built-in EQ preset. Payload: 1 byte preset number.
    SelectEq,
    /// Upload the full 8-band custom EQ. Payload: 24 bytes.
    CustomEq,
    /// Request battery levels and device name. Payload: empty.
    DeviceInfo,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::SelectEq => 0x10,
            Command::CustomEq => 0x20,
            Command::DeviceInfo => 0x27,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x10 => Some(Command::SelectEq),
            0x20 => Some(Command::CustomEq),
            0x27 => Some(Command::DeviceInfo),
            _ => None,
        }
    }

    /// Frame type the device expects for this command.
    ///
    /// CustomEq is sent with the Notify type even though it travels host to device.
    pub const fn request_type(self) -> FrameType {
        match self {
            Command::SelectEq | Command::DeviceInfo => FrameType::Request,
            Command::CustomEq => FrameType::Notify,
        }
    }
}

/// Frame type byte. A protocol convention rather than a direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Notify,
}

impl FrameType {
    pub const fn code(self) -> u8 {
        match self {
            FrameType::Request => 0x01,
            FrameType::Notify => 0x03,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FrameType::Request),
            0x03 => Some(FrameType::Notify),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for cmd in [Command::SelectEq, Command::CustomEq, Command::DeviceInfo] {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(0x99), None);
    }

    #[test]
    fn test_custom_eq_uses_notify_type() {
        assert_eq!(Command::CustomEq.request_type(), FrameType::Notify);
        assert_eq!(Command::SelectEq.request_type(), FrameType::Request);
        assert_eq!(FrameType::Notify.code(), 0x03);
    }
}
