use crate::error::{Error, Result};

/// Bytes before the trailing name region: reserved, reserved, left, right, reserved.
const FIXED_LEN: usize = 5;

/// Longest name the length-prefix scan accepts.
const MAX_NAME_LEN: usize = 31;

/// Battery and name reported by a device-info notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub battery_left: u8,
    pub battery_right: u8,
    pub name: String,
}

impl DeviceInfo {
    /// Parse the payload that follows `QXW 27 02`.
    ///
    /// Layout: `[?, ?, left%, right%, ?, ...trailing fields..., len, name...]`.
    /// The trailing region is undocumented, so the name is found by scanning
    /// backwards from the end for a byte that works as a length prefix of a
    /// printable ASCII run. The match nearest the end wins. Arbitrary trailing
    /// bytes can produce a false positive; there is no way to rule that out
    /// without the vendor's layout.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < FIXED_LEN {
            return Err(Error::Format(format!(
                "device info payload too short: {} bytes",
                payload.len()
            )));
        }

        Ok(Self {
            battery_left: payload[2],
            battery_right: payload[3],
            name: find_name(payload).unwrap_or_default(),
        })
    }
}

fn find_name(payload: &[u8]) -> Option<String> {
    (FIXED_LEN..payload.len()).rev().find_map(|i| {
        let len = payload[i] as usize;
        if len == 0 || len > MAX_NAME_LEN {
            return None;
        }
        let run = payload.get(i + 1..i + 1 + len)?;
        if run.iter().all(|&b| (0x20..=0x7E).contains(&b)) {
            // Printable ASCII is valid UTF-8.
            Some(String::from_utf8_lossy(run).into_owned())
        } else {
            None
        }
    })
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.name.is_empty() {
            "(unnamed)"
        } else {
            &self.name
        };
        write!(
            f,
            "{}: battery L={}% R={}%",
            name, self.battery_left, self.battery_right
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let payload = [
            0x01, 0x03, 0x64, 0x64, 0x00, 0x05, b'H', b'e', b'l', b'l', b'o',
        ];
        let info = DeviceInfo::parse(&payload).unwrap();
        assert_eq!(
            info,
            DeviceInfo {
                battery_left: 100,
                battery_right: 100,
                name: "Hello".into(),
            }
        );
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            DeviceInfo::parse(&[0x01, 0x03, 0x64, 0x64]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_no_name() {
        let info = DeviceInfo::parse(&[0x01, 0x03, 0x50, 0x4E, 0x00]).unwrap();
        assert_eq!(info.battery_left, 80);
        assert_eq!(info.battery_right, 78);
        assert_eq!(info.name, "");
    }

    #[test]
    fn test_name_after_trailing_fields() {
        let mut payload = vec![0x01, 0x03, 0x2A, 0x37, 0x00, 0xFF, 0xEE, 0x00];
        payload.push(8);
        payload.extend_from_slice(b"Fairbuds");
        let info = DeviceInfo::parse(&payload).unwrap();
        assert_eq!(info.name, "Fairbuds");
        assert_eq!(info.battery_left, 42);
        assert_eq!(info.battery_right, 55);
    }

    #[test]
    fn test_rightmost_candidate_wins() {
        // Index 5 ("AB") and index 8 ("CD") are both valid prefixes.
        // The backwards scan reaches index 8 first.
        let payload = [0x00, 0x00, 0x10, 0x20, 0x00, 0x02, b'A', b'B', 0x02, b'C', b'D'];
        let info = DeviceInfo::parse(&payload).unwrap();
        assert_eq!(info.name, "CD");
    }

    #[test]
    fn test_rejects_non_printable_run() {
        let payload = [0x00, 0x00, 0x10, 0x20, 0x00, 0x03, b'A', 0x07, b'B'];
        assert_eq!(DeviceInfo::parse(&payload).unwrap().name, "");
    }

    #[test]
    fn test_length_prefix_must_fit() {
        let payload = [0x00, 0x00, 0x10, 0x20, 0x00, 0x09, b'A', b'B'];
        assert_eq!(DeviceInfo::parse(&payload).unwrap().name, "");
    }

    #[test]
    fn test_fixed_bytes_are_not_scanned() {
        // payload[4] = 1 would frame "X" if the scan went below index 5.
        let payload = [0x00, 0x00, 0x10, 0x20, 0x01, b'X'];
        assert_eq!(DeviceInfo::parse(&payload).unwrap().name, "");
    }

    #[test]
    fn test_long_prefix_ignored() {
        let mut payload = vec![0x00, 0x00, 0x10, 0x20, 0x00, 32];
        payload.extend_from_slice(&[b'a'; 32]);
        assert_eq!(DeviceInfo::parse(&payload).unwrap().name, "");
    }
}
