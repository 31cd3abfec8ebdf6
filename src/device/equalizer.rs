use crate::error::{Error, Result};
use crate::protocol::param::{self, DEFAULT_Q, GAIN_OFFSET};

/// Number of parametric EQ bands.
pub const BAND_COUNT: usize = 8;

/// Centre frequency of each band, in band order.
pub const BAND_FREQUENCIES_HZ: [u32; BAND_COUNT] = [60, 100, 230, 500, 1100, 2400, 5400, 12000];

/// One of the fixed EQ bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub index: u8,
    pub frequency_hz: u32,
}

impl Band {
    pub fn all() -> impl Iterator<Item = Band> {
        BAND_FREQUENCIES_HZ
            .iter()
            .enumerate()
            .map(|(i, &frequency_hz)| Band {
                index: i as u8,
                frequency_hz,
            })
    }

    pub fn get(index: usize) -> Result<Band> {
        check_band(index)?;
        Ok(Band {
            index: index as u8,
            frequency_hz: BAND_FREQUENCIES_HZ[index],
        })
    }
}

fn check_band(index: usize) -> Result<()> {
    if index >= BAND_COUNT {
        return Err(Error::Range {
            what: "band",
            value: index as i64,
            min: 0,
            max: BAND_COUNT as i64 - 1,
        });
    }
    Ok(())
}

/// Built-in DSP presets.
///
/// Studio is the usual base for custom EQ, but the device accepts custom EQ
/// on top of any preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Main,
    BassBoost,
    Flat,
    Studio,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::Main, Preset::BassBoost, Preset::Flat, Preset::Studio];

    pub const fn number(self) -> u8 {
        match self {
            Preset::Main => 1,
            Preset::BassBoost => 2,
            Preset::Flat => 3,
            Preset::Studio => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Preset::Main => "Main",
            Preset::BassBoost => "Bass boost",
            Preset::Flat => "Flat",
            Preset::Studio => "Studio",
        }
    }

    pub fn from_number(number: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.number() == number)
            .ok_or(Error::Range {
                what: "preset",
                value: number as i64,
                min: 1,
                max: 4,
            })
    }

    /// Parse a preset by its short command name (`main`, `bass`, `flat`, `studio`) or number.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "main" | "1" => Some(Preset::Main),
            "bass" | "2" => Some(Preset::BassBoost),
            "flat" | "3" => Some(Preset::Flat),
            "studio" | "4" => Some(Preset::Studio),
            _ => None,
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoded gain and Q for a single band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSetting {
    pub gain: u8,
    pub q: u8,
}

impl BandSetting {
    pub fn gain_db(&self) -> f64 {
        param::decode_gain(self.gain)
    }

    pub fn q_factor(&self) -> f64 {
        param::decode_q(self.q)
    }
}

impl Default for BandSetting {
    fn default() -> Self {
        Self {
            gain: GAIN_OFFSET,
            q: DEFAULT_Q,
        }
    }
}

/// The full 8-band custom EQ. Always transmitted whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EqState {
    bands: [BandSetting; BAND_COUNT],
}

impl EqState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_band(&mut self, index: usize, gain_db: f64, q: f64) -> Result<()> {
        check_band(index)?;
        self.bands[index] = BandSetting {
            gain: param::encode_gain(gain_db),
            q: param::encode_q(q),
        };
        Ok(())
    }

    pub fn set_band_gain(&mut self, index: usize, gain_db: f64) -> Result<()> {
        check_band(index)?;
        self.bands[index].gain = param::encode_gain(gain_db);
        Ok(())
    }

    pub fn set_band_q(&mut self, index: usize, q: f64) -> Result<()> {
        check_band(index)?;
        self.bands[index].q = param::encode_q(q);
        Ok(())
    }

    /// Replace all bands from `(gain_db, q)` pairs. Nothing changes unless exactly 8 are given.
    pub fn apply_preset(&mut self, bands: &[(f64, f64)]) -> Result<()> {
        if bands.len() != BAND_COUNT {
            return Err(Error::Argument(format!(
                "expected {} bands, got {}",
                BAND_COUNT,
                bands.len()
            )));
        }
        let mut next = [BandSetting::default(); BAND_COUNT];
        for (slot, &(gain_db, q)) in next.iter_mut().zip(bands) {
            *slot = BandSetting {
                gain: param::encode_gain(gain_db),
                q: param::encode_q(q),
            };
        }
        self.bands = next;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.bands = [BandSetting::default(); BAND_COUNT];
    }

    pub fn band(&self, index: usize) -> Result<BandSetting> {
        check_band(index)?;
        Ok(self.bands[index])
    }

    pub fn bands(&self) -> &[BandSetting; BAND_COUNT] {
        &self.bands
    }

    /// `[index, gain, q]` triplets for bands 0..7.
    pub fn to_custom_eq_payload(&self) -> [u8; BAND_COUNT * 3] {
        let mut out = [0u8; BAND_COUNT * 3];
        for (i, band) in self.bands.iter().enumerate() {
            out[i * 3] = i as u8;
            out[i * 3 + 1] = band.gain;
            out[i * 3 + 2] = band.q;
        }
        out
    }
}

impl std::fmt::Display for EqState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (band, setting) in Band::all().zip(self.bands.iter()) {
            writeln!(
                f,
                "  Band {}: {:5} Hz  {:+5.1} dB  Q {:.1}",
                band.index,
                band.frequency_hz,
                setting.gain_db(),
                setting.q_factor()
            )?;
        }
        Ok(())
    }
}
