//! `/control?var=<name>&val=<int>` dispatch.

use log::{info, warn};
use thiserror::Error;

use crate::{
    sensor::{Sensor, SensorControl, SensorError},
    settings::{SettingsStore, SettingsTable, Slot},
};

/// Parameters must fit the device's 32-byte buffers, terminator included.
pub const MAX_PARAM_LEN: usize = 31;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("query is missing `{0}`")]
    Missing(&'static str),
    #[error("`{0}` is longer than 31 bytes")]
    TooLong(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub var: String,
    pub val: i32,
}

impl ControlRequest {
    /// Parses a raw query string. Both `var` and `val` are required; `val`
    /// is read like C `atoi`, so junk parses as 0.
    pub fn from_query(query: &str) -> Result<Self, ControlError> {
        let var = required(query, "var")?;
        let val = required(query, "val")?;
        Ok(Self {
            var,
            val: atoi(&val),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    /// Unknown variable, or a framesize change while not in JPEG mode.
    Ignored,
    Rejected(SensorError),
}

impl ControlOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Rejected(_) => 500,
            Self::Applied | Self::Ignored => 200,
        }
    }
}

/// Applies one control request. The persisted byte is written before the
/// sensor setter runs, and the store is committed whatever the outcome.
pub fn apply_control<S, P>(
    request: &ControlRequest,
    sensor: &mut S,
    table: &mut SettingsTable,
    store: &P,
) -> ControlOutcome
where
    S: Sensor + ?Sized,
    P: SettingsStore + ?Sized,
{
    let val = request.val;
    let outcome = if request.var == "framesize" {
        if sensor.is_jpeg() {
            to_outcome(sensor.apply(SensorControl::Framesize, val))
        } else {
            ControlOutcome::Ignored
        }
    } else if let Some(slot) = Slot::from_name(&request.var) {
        table.set(slot, val);
        match SensorControl::for_slot(slot) {
            Some(control) => to_outcome(sensor.apply(control, val)),
            None => ControlOutcome::Applied,
        }
    } else {
        ControlOutcome::Ignored
    };

    let writes = table.take_pending();
    if let Err(err) = store.commit(&writes) {
        warn!("failed to commit settings: {err}");
    }

    match &outcome {
        ControlOutcome::Applied => info!("control {}={val}", request.var),
        ControlOutcome::Ignored => info!("control {}={val} ignored", request.var),
        ControlOutcome::Rejected(err) => warn!("control {}={val} failed: {err}", request.var),
    }
    outcome
}

/// Pushes every persisted sensor byte onto the live sensor. Returns how many
/// controls were rejected; each rejection is logged and skipped.
pub fn restore_sensor<S: Sensor + ?Sized>(sensor: &mut S, table: &SettingsTable) -> usize {
    let mut rejected = 0;
    for slot in Slot::ALL {
        let Some(control) = SensorControl::for_slot(slot) else {
            continue;
        };
        let value = if control.is_signed() {
            i32::from(table.get_signed(slot))
        } else {
            i32::from(table.get(slot))
        };
        if let Err(err) = sensor.apply(control, value) {
            warn!("failed to restore {}: {err}", slot.name());
            rejected += 1;
        }
    }
    rejected
}

fn to_outcome(result: Result<(), SensorError>) -> ControlOutcome {
    match result {
        Ok(()) => ControlOutcome::Applied,
        Err(err) => ControlOutcome::Rejected(err),
    }
}

fn required(query: &str, key: &'static str) -> Result<String, ControlError> {
    let raw = query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find_map(|(name, value)| (name == key).then_some(value))
        .ok_or(ControlError::Missing(key))?;

    let value = decode_component(raw);
    if value.len() > MAX_PARAM_LEN {
        return Err(ControlError::TooLong(key));
    }
    Ok(value)
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).map(|digit| digit as u8)
}

/// Leading whitespace, optional sign, then digits up to the first non-digit.
fn atoi(text: &str) -> i32 {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        value = (value * 10 + i64::from(byte - b'0')).min(i64::from(i32::MAX) + 1);
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
