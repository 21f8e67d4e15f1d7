use serde::{Deserialize, Serialize};

use crate::{
    sensor::SensorStatus,
    settings::{SettingsTable, Slot},
};

/// Body of `/status`. Field order matches what the web page expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
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
    pub coffee_min: u8,
    pub coffee_max: u8,
    pub coffee_left: u8,
    pub coffee_right: u8,
    pub coffee_cups: u8,
    pub coffee_text: u8,
    pub coffee_obscure: u8,
    pub coffee_potid: u8,
    pub coffee_exists_x: u8,
    pub coffee_exists_y: u8,
    pub coffee_exists_threshold: u8,
}

impl StatusReport {
    /// Live values come from the sensor, coffee values from the table.
    pub fn build(sensor: &SensorStatus, table: &SettingsTable) -> Self {
        Self {
            framesize: sensor.framesize,
            quality: sensor.quality,
            brightness: sensor.brightness,
            contrast: sensor.contrast,
            saturation: sensor.saturation,
            awb: sensor.awb,
            awb_gain: sensor.awb_gain,
            aec: sensor.aec,
            aec2: sensor.aec2,
            ae_level: sensor.ae_level,
            aec_value: sensor.aec_value,
            agc_gain: sensor.agc_gain,
            gainceiling: sensor.gainceiling,
            bpc: sensor.bpc,
            wpc: sensor.wpc,
            raw_gma: sensor.raw_gma,
            lenc: sensor.lenc,
            vflip: sensor.vflip,
            hmirror: sensor.hmirror,
            dcw: sensor.dcw,
            colorbar: sensor.colorbar,
            coffee_min: table.get(Slot::CoffeeMin),
            coffee_max: table.get(Slot::CoffeeMax),
            coffee_left: table.get(Slot::CoffeeLeft),
            coffee_right: table.get(Slot::CoffeeRight),
            coffee_cups: table.get(Slot::CoffeeCups),
            coffee_text: table.get(Slot::CoffeeText),
            coffee_obscure: table.get(Slot::CoffeeObscure),
            coffee_potid: table.get(Slot::CoffeePotId),
            coffee_exists_x: table.get(Slot::CoffeeExistsX),
            coffee_exists_y: table.get(Slot::CoffeeExistsY),
            coffee_exists_threshold: table.get(Slot::CoffeeExistsThreshold),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sensor::{Sensor, SensorControl, SimulatedSensor};

    fn report() -> (StatusReport, SettingsTable) {
        let mut table = SettingsTable::default();
        for (i, slot) in Slot::ALL.into_iter().filter(|s| s.is_coffee()).enumerate() {
            table.set(slot, 200 + i as i32);
        }
        let mut sensor = SimulatedSensor::default();
        sensor.apply(SensorControl::Brightness, -1).unwrap();
        sensor.apply(SensorControl::AecValue, 900).unwrap();

        (StatusReport::build(&sensor.status(), &table), table)
    }

    #[test]
    fn json_round_trips_every_field() {
        let (status, table) = report();
        let json = status.to_json().unwrap();

        let parsed: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 32);
        for slot in Slot::ALL.into_iter().filter(|s| s.is_coffee()) {
            assert_eq!(object[slot.name()], u64::from(table.get(slot)), "{}", slot.name());
        }
        assert_eq!(object["brightness"], -1);
        assert_eq!(object["aec_value"], 900);
    }

    #[test]
    fn keys_keep_device_order() {
        let (status, _) = report();
        let json = status.to_json().unwrap();

        assert!(json.starts_with(r#"{"framesize":5,"quality":10,"brightness":-1,"#));
        assert!(json.ends_with(r#""coffee_exists_y":206,"coffee_exists_threshold":200}"#));
    }
}
