//! Fixed-point encoding of band gain and Q-factor.
//!
//! Gain: `byte = round(dB * 10) + 120`, so 0 = -12.0 dB, 120 = 0 dB, 255 = +13.5 dB.
//! Q:    `byte = round(Q * 10)`, so 7 = Q 0.7, 30 = Q 3.0.
//!
//! Rounding is half away from zero (`f64::round`). Out-of-range inputs are
//! clamped to the byte range without error; callers that need strict
//! validation check [`GAIN_MIN_DB`]/[`GAIN_MAX_DB`] themselves.

/// Encoded value for 0 dB.
pub const GAIN_OFFSET: u8 = 120;

/// Encoded steps per dB / per unit of Q.
pub const SCALE: f64 = 10.0;

/// Advisory UI range. Not enforced by the protocol.
pub const GAIN_MIN_DB: f64 = -12.0;
pub const GAIN_MAX_DB: f64 = 13.5;

/// Encoded Q used when nothing else is set (Q = 0.7).
pub const DEFAULT_Q: u8 = 7;

fn clamp_to_byte(value: f64) -> u8 {
    value.clamp(0.0, u8::MAX as f64) as u8
}

/// Encode a gain in dB. NaN encodes as 0 dB.
pub fn encode_gain(db: f64) -> u8 {
    if db.is_nan() {
        return GAIN_OFFSET;
    }
    clamp_to_byte((db * SCALE).round() + GAIN_OFFSET as f64)
}

pub fn decode_gain(byte: u8) -> f64 {
    (byte as f64 - GAIN_OFFSET as f64) / SCALE
}

/// Encode a real Q-factor. NaN encodes as the default Q.
pub fn encode_q(q: f64) -> u8 {
    if q.is_nan() {
        return DEFAULT_Q;
    }
    clamp_to_byte((q * SCALE).round())
}

pub fn decode_q(byte: u8) -> f64 {
    byte as f64 / SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_anchor_points() {
        assert_eq!(encode_gain(-12.0), 0);
        assert_eq!(encode_gain(0.0), 120);
        assert_eq!(encode_gain(13.5), 255);
        assert_eq!(encode_gain(6.0), 0xB4);
    }

    #[test]
    fn test_gain_clamps_silently() {
        assert_eq!(encode_gain(-40.0), 0);
        assert_eq!(encode_gain(99.0), 255);
        assert_eq!(encode_gain(f64::INFINITY), 255);
        assert_eq!(encode_gain(f64::NEG_INFINITY), 0);
        assert_eq!(encode_gain(f64::NAN), GAIN_OFFSET);
    }

    #[test]
    fn test_gain_rounds_half_away_from_zero() {
        assert_eq!(encode_gain(0.25), 123);
        assert_eq!(encode_gain(-0.25), 117);
        assert_eq!(encode_gain(1.04), 130);
    }

    #[test]
    fn test_gain_roundtrip_in_ui_range() {
        let mut db = GAIN_MIN_DB;
        while db <= GAIN_MAX_DB {
            let decoded = decode_gain(encode_gain(db));
            assert!((decoded - db).abs() < 0.05, "{} -> {}", db, decoded);
            assert_eq!(encode_gain(decoded), encode_gain(db));
            db += 0.1;
        }
    }

    #[test]
    fn test_every_byte_decodes_and_reencodes() {
        for byte in 0..=u8::MAX {
            assert_eq!(encode_gain(decode_gain(byte)), byte);
            assert_eq!(encode_q(decode_q(byte)), byte);
        }
    }

    #[test]
    fn test_q_encoding() {
        assert_eq!(encode_q(0.7), 7);
        assert_eq!(encode_q(3.0), 30);
        assert_eq!(encode_q(-1.0), 0);
        assert_eq!(encode_q(100.0), 255);
        assert_eq!(encode_q(f64::NAN), DEFAULT_Q);
        assert!((decode_q(7) - 0.7).abs() < 1e-9);
    }
}
