use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Number of addressable bytes in the persisted table. Address 0 is unused.
pub const SETTINGS_SLOTS: usize = 28;

pub type SharedSettings = Arc<Mutex<SettingsTable>>;

/// One persisted byte. The discriminant is the byte address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Slot {
    Quality = 1,
    Contrast = 2,
    Brightness = 3,
    Saturation = 4,
    GainCeiling = 5,
    Colorbar = 6,
    Awb = 7,
    CoffeeExistsThreshold = 8,
    Aec = 9,
    Hmirror = 10,
    Vflip = 11,
    AwbGain = 12,
    AgcGain = 13,
    AecValue = 14,
    Aec2 = 15,
    Dcw = 16,
    CoffeeCups = 17,
    CoffeeText = 18,
    CoffeeObscure = 19,
    CoffeePotId = 20,
    CoffeeExistsX = 21,
    CoffeeExistsY = 22,
    AeLevel = 23,
    CoffeeMin = 24,
    CoffeeMax = 25,
    CoffeeLeft = 26,
    CoffeeRight = 27,
}

impl Slot {
    pub const ALL: [Slot; 27] = [
        Self::Quality,
        Self::Contrast,
        Self::Brightness,
        Self::Saturation,
        Self::GainCeiling,
        Self::Colorbar,
        Self::Awb,
        Self::CoffeeExistsThreshold,
        Self::Aec,
        Self::Hmirror,
        Self::Vflip,
        Self::AwbGain,
        Self::AgcGain,
        Self::AecValue,
        Self::Aec2,
        Self::Dcw,
        Self::CoffeeCups,
        Self::CoffeeText,
        Self::CoffeeObscure,
        Self::CoffeePotId,
        Self::CoffeeExistsX,
        Self::CoffeeExistsY,
        Self::AeLevel,
        Self::CoffeeMin,
        Self::CoffeeMax,
        Self::CoffeeLeft,
        Self::CoffeeRight,
    ];

    pub fn address(self) -> usize {
        self as usize
    }

    pub fn from_address(address: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.address() == address)
    }

    /// Control variable name, also used as the key in the status JSON and the host store.
    pub fn name(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Contrast => "contrast",
            Self::Brightness => "brightness",
            Self::Saturation => "saturation",
            Self::GainCeiling => "gainceiling",
            Self::Colorbar => "colorbar",
            Self::Awb => "awb",
            Self::CoffeeExistsThreshold => "coffee_exists_threshold",
            Self::Aec => "aec",
            Self::Hmirror => "hmirror",
            Self::Vflip => "vflip",
            Self::AwbGain => "awb_gain",
            Self::AgcGain => "agc_gain",
            Self::AecValue => "aec_value",
            Self::Aec2 => "aec2",
            Self::Dcw => "dcw",
            Self::CoffeeCups => "coffee_cups",
            Self::CoffeeText => "coffee_text",
            Self::CoffeeObscure => "coffee_obscure",
            Self::CoffeePotId => "coffee_potid",
            Self::CoffeeExistsX => "coffee_exists_x",
            Self::CoffeeExistsY => "coffee_exists_y",
            Self::AeLevel => "ae_level",
            Self::CoffeeMin => "coffee_min",
            Self::CoffeeMax => "coffee_max",
            Self::CoffeeLeft => "coffee_left",
            Self::CoffeeRight => "coffee_right",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.name() == name)
    }

    pub fn is_coffee(self) -> bool {
        matches!(
            self,
            Self::CoffeeExistsThreshold
                | Self::CoffeeCups
                | Self::CoffeeText
                | Self::CoffeeObscure
                | Self::CoffeePotId
                | Self::CoffeeExistsX
                | Self::CoffeeExistsY
                | Self::CoffeeMin
                | Self::CoffeeMax
                | Self::CoffeeLeft
                | Self::CoffeeRight
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("settings backend: {0}")]
    Backend(String),
}

/// Byte table of camera tuning and coffee detection parameters.
///
/// Writes are staged in `pending` until the caller hands them to a
/// [`SettingsStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsTable {
    bytes: [u8; SETTINGS_SLOTS],
    pending: Vec<(Slot, u8)>,
}

impl Default for SettingsTable {
    fn default() -> Self {
        let mut bytes = [0_u8; SETTINGS_SLOTS];
        for (slot, value) in [
            (Slot::Quality, 10),
            (Slot::Awb, 1),
            (Slot::CoffeeExistsThreshold, 100),
            (Slot::Aec, 1),
            (Slot::AwbGain, 1),
            (Slot::AecValue, 204),
            (Slot::Dcw, 1),
            (Slot::CoffeeCups, 12),
            (Slot::CoffeeText, 1),
            (Slot::CoffeePotId, 1),
            (Slot::CoffeeExistsX, 50),
            (Slot::CoffeeExistsY, 90),
            (Slot::CoffeeMin, 10),
            (Slot::CoffeeMax, 90),
            (Slot::CoffeeLeft, 30),
            (Slot::CoffeeRight, 70),
        ] {
            bytes[slot.address()] = value;
        }

        Self {
            bytes,
            pending: Vec::new(),
        }
    }
}

impl SettingsTable {
    pub fn from_bytes(bytes: [u8; SETTINGS_SLOTS]) -> Self {
        Self {
            bytes,
            pending: Vec::new(),
        }
    }

    pub fn bytes(&self) -> &[u8; SETTINGS_SLOTS] {
        &self.bytes
    }

    pub fn get(&self, slot: Slot) -> u8 {
        self.bytes[slot.address()]
    }

    /// Reads a slot holding a signed sensor control (-2..=2 style values).
    pub fn get_signed(&self, slot: Slot) -> i8 {
        self.get(slot) as i8
    }

    /// Toggle slots are only "on" when they hold exactly 1.
    pub fn flag(&self, slot: Slot) -> bool {
        self.get(slot) == 1
    }

    /// Stores the low byte of `value` and stages the write for commit.
    pub fn set(&mut self, slot: Slot, value: i32) {
        let byte = value as u8;
        self.bytes[slot.address()] = byte;
        self.pending.push((slot, byte));
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending(&mut self) -> Vec<(Slot, u8)> {
        std::mem::take(&mut self.pending)
    }
}

/// Persistent backing for the settings table.
pub trait SettingsStore {
    fn load(&self) -> Result<SettingsTable, StoreError>;

    /// Persists `writes` synchronously. Called after every control request,
    /// with an empty slice when the request changed nothing.
    fn commit(&self, writes: &[(Slot, u8)]) -> Result<(), StoreError>;
}

/// In-memory store, used when no persistent backend is available.
#[derive(Debug)]
pub struct MemoryStore {
    bytes: Mutex<[u8; SETTINGS_SLOTS]>,
    commits: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(table: &SettingsTable) -> Self {
        Self {
            bytes: Mutex::new(*table.bytes()),
            commits: Mutex::new(0),
        }
    }

    pub fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap()
    }

    pub fn stored(&self, slot: Slot) -> u8 {
        self.bytes.lock().unwrap()[slot.address()]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&SettingsTable::default())
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<SettingsTable, StoreError> {
        Ok(SettingsTable::from_bytes(*self.bytes.lock().unwrap()))
    }

    fn commit(&self, writes: &[(Slot, u8)]) -> Result<(), StoreError> {
        let mut bytes = self.bytes.lock().unwrap();
        for (slot, value) in writes {
            bytes[slot.address()] = *value;
        }
        *self.commits.lock().unwrap() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_addresses_are_unique_and_in_range() {
        let mut seen = [false; SETTINGS_SLOTS];
        for slot in Slot::ALL {
            assert!(slot.address() > 0 && slot.address() < SETTINGS_SLOTS);
            assert!(!seen[slot.address()], "duplicate address for {slot:?}");
            seen[slot.address()] = true;
            assert_eq!(Slot::from_address(slot.address()), Some(slot));
            assert_eq!(Slot::from_name(slot.name()), Some(slot));
        }
    }

    #[test]
    fn set_keeps_low_byte_and_stages_write() {
        let mut table = SettingsTable::default();
        table.set(Slot::AecValue, 600);
        table.set(Slot::Brightness, -2);

        assert_eq!(table.get(Slot::AecValue), 88);
        assert_eq!(table.get_signed(Slot::Brightness), -2);
        assert_eq!(
            table.take_pending(),
            vec![(Slot::AecValue, 88), (Slot::Brightness, 254)]
        );
        assert!(!table.has_pending());
    }

    #[test]
    fn flags_require_exact_one() {
        let mut table = SettingsTable::default();
        table.set(Slot::CoffeeObscure, 2);
        assert!(!table.flag(Slot::CoffeeObscure));
        table.set(Slot::CoffeeObscure, 1);
        assert!(table.flag(Slot::CoffeeObscure));
    }

    #[test]
    fn memory_store_counts_empty_commits() {
        let store = MemoryStore::default();
        store.commit(&[]).unwrap();
        store.commit(&[(Slot::CoffeeCups, 8)]).unwrap();

        assert_eq!(store.commit_count(), 2);
        assert_eq!(store.stored(Slot::CoffeeCups), 8);
        assert_eq!(store.load().unwrap().get(Slot::CoffeeCups), 8);
    }
}
