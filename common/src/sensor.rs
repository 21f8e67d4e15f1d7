use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::Slot;

/// Largest framesize index the OV2640 driver accepts (UXGA).
pub const MAX_FRAMESIZE: u8 = 13;

/// Live sensor controls reachable from `/control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorControl {
    Framesize,
    Quality,
    Contrast,
    Brightness,
    Saturation,
    GainCeiling,
    Colorbar,
    Awb,
    Aec,
    Hmirror,
    Vflip,
    AwbGain,
    AgcGain,
    AecValue,
    Aec2,
    Dcw,
    AeLevel,
}

impl SensorControl {
    /// Control backing a persisted slot. Coffee slots have none.
    pub fn for_slot(slot: Slot) -> Option<Self> {
        let control = match slot {
            Slot::Quality => Self::Quality,
            Slot::Contrast => Self::Contrast,
            Slot::Brightness => Self::Brightness,
            Slot::Saturation => Self::Saturation,
            Slot::GainCeiling => Self::GainCeiling,
            Slot::Colorbar => Self::Colorbar,
            Slot::Awb => Self::Awb,
            Slot::Aec => Self::Aec,
            Slot::Hmirror => Self::Hmirror,
            Slot::Vflip => Self::Vflip,
            Slot::AwbGain => Self::AwbGain,
            Slot::AgcGain => Self::AgcGain,
            Slot::AecValue => Self::AecValue,
            Slot::Aec2 => Self::Aec2,
            Slot::Dcw => Self::Dcw,
            Slot::AeLevel => Self::AeLevel,
            _ => return None,
        };
        Some(control)
    }

    /// Whether the persisted byte is a two's-complement signed value.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Contrast | Self::Brightness | Self::Saturation | Self::AeLevel
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("{control:?} rejected value {value}")]
    Rejected { control: SensorControl, value: i32 },
    #[error("sensor is not available")]
    Unavailable,
}

/// Snapshot of the driver's status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorStatus {
    pub framesize: u8,
    pub quality: u8,
    pub brightness: i8,
    pub contrast: i8,
    pub saturation: i8,
    pub awb: u8,
    pub awb_gain: u8,
    pub aec: u8,
    pub aec2: u8,
    pub ae_level: i8,
    pub aec_value: u16,
    pub agc_gain: u8,
    pub gainceiling: u8,
    pub bpc: u8,
    pub wpc: u8,
    pub raw_gma: u8,
    pub lenc: u8,
    pub vflip: u8,
    pub hmirror: u8,
    pub dcw: u8,
    pub colorbar: u8,
}

pub trait Sensor {
    fn apply(&mut self, control: SensorControl, value: i32) -> Result<(), SensorError>;

    fn status(&self) -> SensorStatus;

    /// Framesize changes are only honored while the sensor emits JPEG.
    fn is_jpeg(&self) -> bool;
}

/// Pixel dimensions of an esp32-camera framesize index.
pub fn frame_dimensions(framesize: u8) -> Option<(usize, usize)> {
    let dims = match framesize {
        0 => (96, 96),
        1 => (160, 120),
        2 => (176, 144),
        3 => (240, 176),
        4 => (240, 240),
        5 => (320, 240),
        6 => (400, 296),
        7 => (480, 320),
        8 => (640, 480),
        9 => (800, 600),
        10 => (1024, 768),
        11 => (1280, 720),
        12 => (1280, 1024),
        13 => (1600, 1200),
        _ => return None,
    };
    Some(dims)
}

/// Software stand-in for the OV2640, range-checking like its driver.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    status: SensorStatus,
    jpeg: bool,
}

impl SimulatedSensor {
    pub fn new(jpeg: bool) -> Self {
        Self {
            status: SensorStatus {
                framesize: 5,
                quality: 10,
                awb: 1,
                awb_gain: 1,
                aec: 1,
                aec_value: 204,
                dcw: 1,
                bpc: 0,
                wpc: 1,
                raw_gma: 1,
                lenc: 1,
                ..SensorStatus::default()
            },
            jpeg,
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        frame_dimensions(self.status.framesize).unwrap_or((320, 240))
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Sensor for SimulatedSensor {
    fn apply(&mut self, control: SensorControl, value: i32) -> Result<(), SensorError> {
        let rejected = SensorError::Rejected { control, value };
        let in_range = |lo: i32, hi: i32| (lo..=hi).contains(&value);
        let toggle = u8::from(value != 0);
        let status = &mut self.status;

        match control {
            SensorControl::Framesize => {
                if !in_range(0, i32::from(MAX_FRAMESIZE)) {
                    return Err(rejected);
                }
                status.framesize = value as u8;
            }
            SensorControl::Quality => {
                if !in_range(0, 63) {
                    return Err(rejected);
                }
                status.quality = value as u8;
            }
            SensorControl::Contrast | SensorControl::Brightness | SensorControl::Saturation
            | SensorControl::AeLevel => {
                if !in_range(-2, 2) {
                    return Err(rejected);
                }
                let level = value as i8;
                match control {
                    SensorControl::Contrast => status.contrast = level,
                    SensorControl::Brightness => status.brightness = level,
                    SensorControl::Saturation => status.saturation = level,
                    _ => status.ae_level = level,
                }
            }
            SensorControl::GainCeiling => {
                if !in_range(0, 6) {
                    return Err(rejected);
                }
                status.gainceiling = value as u8;
            }
            SensorControl::AgcGain => {
                if !in_range(0, 30) {
                    return Err(rejected);
                }
                status.agc_gain = value as u8;
            }
            SensorControl::AecValue => {
                if !in_range(0, 1200) {
                    return Err(rejected);
                }
                status.aec_value = value as u16;
            }
            SensorControl::Colorbar => status.colorbar = toggle,
            SensorControl::Awb => status.awb = toggle,
            SensorControl::Aec => status.aec = toggle,
            SensorControl::Hmirror => status.hmirror = toggle,
            SensorControl::Vflip => status.vflip = toggle,
            SensorControl::AwbGain => status.awb_gain = toggle,
            SensorControl::Aec2 => status.aec2 = toggle,
            SensorControl::Dcw => status.dcw = toggle,
        }
        Ok(())
    }

    fn status(&self) -> SensorStatus {
        self.status
    }

    fn is_jpeg(&self) -> bool {
        self.jpeg
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn every_sensor_slot_maps_to_a_control() {
        let mapped = Slot::ALL
            .into_iter()
            .filter(|slot| SensorControl::for_slot(*slot).is_some())
            .count();
        assert_eq!(mapped, 16);
        for slot in Slot::ALL {
            assert_eq!(SensorControl::for_slot(slot).is_none(), slot.is_coffee());
        }
    }

    #[test]
    fn simulated_sensor_rejects_out_of_range() {
        let mut sensor = SimulatedSensor::default();
        assert_eq!(
            sensor.apply(SensorControl::Brightness, 3),
            Err(SensorError::Rejected {
                control: SensorControl::Brightness,
                value: 3
            })
        );
        sensor.apply(SensorControl::Brightness, -2).unwrap();
        sensor.apply(SensorControl::Vflip, 7).unwrap();

        let status = sensor.status();
        assert_eq!(status.brightness, -2);
        assert_eq!(status.vflip, 1);
    }

    #[test]
    fn framesize_drives_dimensions() {
        let mut sensor = SimulatedSensor::default();
        assert_eq!(sensor.dimensions(), (320, 240));
        sensor.apply(SensorControl::Framesize, 8).unwrap();
        assert_eq!(sensor.dimensions(), (640, 480));
        assert!(sensor.apply(SensorControl::Framesize, 14).is_err());
        assert_eq!(frame_dimensions(14), None);
    }
}
