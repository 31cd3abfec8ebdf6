use super::commands::{Command, FrameType, DEVICE_INFO_SUBCODE, MAGIC};
use crate::error::{Error, Result};

/// Bytes preceding the payload: magic(3) + command + type + length.
pub const HEADER_LEN: usize = 6;

/// The length field is a single byte.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// A QXW protocol frame.
///
/// Wire format:
/// ```text
/// [0x51 0x58 0x57] [command] [type] [length N] [payload: N bytes]
/// ```
///
/// Command and type are kept as raw bytes so frames with codes this crate
/// does not know about can still be built and parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QxwFrame {
    command: u8,
    frame_type: u8,
    payload: Vec<u8>,
}

impl QxwFrame {
    /// Build a frame for a known command.
    pub fn new(command: Command, frame_type: FrameType, payload: Vec<u8>) -> Result<Self> {
        Self::from_raw_parts(command.code(), frame_type.code(), payload)
    }

    /// Build a frame from raw codes. Fails if the payload does not fit the length byte.
    pub fn from_raw_parts(command: u8, frame_type: u8, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Argument(format!(
                "payload of {} bytes exceeds {} byte frame limit",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(Self {
            command,
            frame_type,
            payload,
        })
    }

    /// `QXW 10 01 01 <preset>`
    pub fn select_eq(preset: u8) -> Self {
        Self {
            command: Command::SelectEq.code(),
            frame_type: Command::SelectEq.request_type().code(),
            payload: vec![preset],
        }
    }

    /// `QXW 20 03 18 <8 x [index, gain, q]>`
    pub fn custom_eq(bands: [u8; 24]) -> Self {
        Self {
            command: Command::CustomEq.code(),
            frame_type: Command::CustomEq.request_type().code(),
            payload: bands.to_vec(),
        }
    }

    /// `QXW 27 01 00`
    pub fn device_info_request() -> Self {
        Self {
            command: Command::DeviceInfo.code(),
            frame_type: Command::DeviceInfo.request_type().code(),
            payload: Vec::new(),
        }
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    /// The command as a known variant, if it is one.
    pub fn command_kind(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize this frame to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.command);
        out.push(self.frame_type);
        // Bounded by the constructors.
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Strictly parse a complete frame, honouring the length byte.
    ///
    /// Device notifications do not always carry a length byte (see [`decode`]);
    /// this is for frames built by [`QxwFrame::to_bytes`] or typed in by hand.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Format(format!("frame too short: {} bytes", data.len())));
        }
        if data[..3] != MAGIC {
            return Err(Error::Format(format!(
                "invalid magic: {}",
                hex::encode(&data[..3])
            )));
        }
        let len = data[5] as usize;
        if data.len() != HEADER_LEN + len {
            return Err(Error::Format(format!(
                "length byte says {} payload bytes, frame carries {}",
                len,
                data.len() - HEADER_LEN
            )));
        }
        Ok(Self {
            command: data[3],
            frame_type: data[4],
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}

impl std::fmt::Display for QxwFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cmd={:02X} type={:02X} len={}",
            self.command,
            self.frame_type,
            self.payload.len()
        )?;
        if !self.payload.is_empty() {
            write!(f, " payload={}", hex::encode(&self.payload))?;
        }
        Ok(())
    }
}

/// Encode `(command, type, payload)` straight to wire bytes.
pub fn encode(command: Command, frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(QxwFrame::new(command, frame_type, payload.to_vec())?.to_bytes())
}

/// A decoded inbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// SelectEq acknowledgement.
    PresetAck,
    /// CustomEq acknowledgement.
    CustomEqAck,
    /// Device-info payload: everything after the `27 02` header.
    DeviceInfo(Vec<u8>),
    /// Not a QXW frame (`None`) or a command this crate does not handle.
    Unrecognized(Option<u8>),
}

impl Notification {
    /// The command this notification answers, used for response correlation.
    pub fn command(&self) -> Option<Command> {
        match self {
            Notification::PresetAck => Some(Command::SelectEq),
            Notification::CustomEqAck => Some(Command::CustomEq),
            Notification::DeviceInfo(_) => Some(Command::DeviceInfo),
            Notification::Unrecognized(_) => None,
        }
    }
}

/// Decode an inbound notification. Never fails: malformed input is `Unrecognized`.
///
/// Notifications are `QXW <command> <sub/type> ...`. Only device-info carries a
/// payload worth reading, and it starts right after the `0x02` sub-code.
///
/// This reads device notifications, not frames produced by [`encode`]: it
/// keeps only the command's meaning and drops the type and payload. To get
/// `(command, type, payload)` back from encoded bytes, use
/// [`QxwFrame::from_bytes`].
pub fn decode(data: &[u8]) -> Notification {
    if data.len() < 5 || data[..3] != MAGIC {
        return Notification::Unrecognized(None);
    }

    let code = data[3];
    match Command::from_code(code) {
        Some(Command::SelectEq) => Notification::PresetAck,
        Some(Command::CustomEq) => Notification::CustomEqAck,
        Some(Command::DeviceInfo) if data[4] == DEVICE_INFO_SUBCODE => {
            Notification::DeviceInfo(data[5..].to_vec())
        }
        _ => Notification::Unrecognized(Some(code)),
    }
}

/// Hex helpers for logs, Display and the raw command.
pub mod hex {
    pub fn encode(data: &[u8]) -> String {
        data.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a hex string, ignoring whitespace.
    pub fn decode(s: &str) -> Option<Vec<u8>> {
        let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 || !digits.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        digits
            .chunks(2)
            .map(|pair| {
                let s = std::str::from_utf8(pair).ok()?;
                u8::from_str_radix(s, 16).ok()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(Command::SelectEq, FrameType::Request, &[0x04]).unwrap();
        assert_eq!(bytes, vec![0x51, 0x58, 0x57, 0x10, 0x01, 0x01, 0x04]);
    }

    #[test]
    fn test_device_info_request() {
        let bytes = QxwFrame::device_info_request().to_bytes();
        assert_eq!(bytes, vec![0x51, 0x58, 0x57, 0x27, 0x01, 0x00]);
    }

    #[test]
    fn test_custom_eq_header() {
        let bytes = QxwFrame::custom_eq([0u8; 24]).to_bytes();
        assert_eq!(&bytes[..6], &[0x51, 0x58, 0x57, 0x20, 0x03, 24]);
        assert_eq!(bytes.len(), 30);
    }

    #[test]
    fn test_payload_too_long() {
        let err = encode(Command::CustomEq, FrameType::Notify, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(encode(Command::CustomEq, FrameType::Notify, &[0u8; 255]).is_ok());
    }

    #[test]
    fn test_roundtrip_strict_parse() {
        for len in [0usize, 1, 24, 255] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let bytes = encode(Command::DeviceInfo, FrameType::Notify, &payload).unwrap();
            let frame = QxwFrame::from_bytes(&bytes).unwrap();
            assert_eq!(frame.command_kind(), Some(Command::DeviceInfo));
            assert_eq!(frame.frame_type(), FrameType::Notify.code());
            assert_eq!(frame.payload(), payload.as_slice());
        }
    }

    #[test]
    fn test_strict_parse_rejects_bad_length() {
        let mut bytes = QxwFrame::select_eq(1).to_bytes();
        bytes.push(0xFF);
        assert!(matches!(QxwFrame::from_bytes(&bytes), Err(Error::Format(_))));
        assert!(QxwFrame::from_bytes(&[0x51, 0x58]).is_err());
    }

    #[test]
    fn test_decode_keeps_only_command_meaning() {
        let bytes = encode(Command::SelectEq, FrameType::Request, &[0x02]).unwrap();
        assert_eq!(decode(&bytes), Notification::PresetAck);
        let frame = QxwFrame::from_bytes(&bytes).unwrap();
        assert_eq!(
            (frame.command(), frame.frame_type(), frame.payload()),
            (0x10, 0x01, &[0x02][..])
        );
    }

    #[test]
    fn test_decode_acks() {
        assert_eq!(
            decode(&[0x51, 0x58, 0x57, 0x10, 0x01]),
            Notification::PresetAck
        );
        assert_eq!(
            decode(&[0x51, 0x58, 0x57, 0x20, 0x03, 0x00]),
            Notification::CustomEqAck
        );
    }

    #[test]
    fn test_decode_device_info() {
        let data = [
            0x51, 0x58, 0x57, 0x27, 0x02, 0x01, 0x03, 0x64, 0x64, 0x00, 0x05, b'H', b'e', b'l',
            b'l', b'o',
        ];
        match decode(&data) {
            Notification::DeviceInfo(payload) => {
                assert_eq!(payload.len(), 11);
                assert_eq!(payload[2], 0x64);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_device_info_wrong_subcode() {
        assert_eq!(
            decode(&[0x51, 0x58, 0x57, 0x27, 0x01, 0x00]),
            Notification::Unrecognized(Some(0x27))
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        assert_eq!(
            decode(&[0x51, 0x58, 0x57, 0x99, 0x01, 0x00]),
            Notification::Unrecognized(Some(0x99))
        );
    }

    #[test]
    fn test_decode_never_panics_on_garbage() {
        assert_eq!(decode(&[]), Notification::Unrecognized(None));
        assert_eq!(decode(&[0x51, 0x58, 0x57, 0x10]), Notification::Unrecognized(None));
        assert_eq!(
            decode(&[0x5A, 0x00, 0x05, 0x00, 0x01, 0x08]),
            Notification::Unrecognized(None)
        );
        for len in 0..12 {
            let data = vec![0xFFu8; len];
            assert_eq!(decode(&data), Notification::Unrecognized(None));
        }
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex::decode("51 58 57"), Some(vec![0x51, 0x58, 0x57]));
        assert_eq!(hex::decode("5"), None);
        assert_eq!(hex::decode("zz"), None);
    }
}
