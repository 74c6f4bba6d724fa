//! Catalogs of the values a controller may report or accept.
//!
//! Both catalogs are closed: every key is listed here together with its
//! wire address, its fixed-point scale and its unit. Bounds for setpoints
//! are not part of the catalog, the device reports them at runtime.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::{Error, Result};

/// Raw value a device uses for "provided, but no reading available".
pub(crate) const RAW_NO_VALUE: i16 = i16::MIN;

/// The unit of measurement of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Degrees Celsius.
    Celsius,
    /// Percent, used for relative humidity and fan duty cycles.
    Percent,
    /// CO2 concentration.
    PartsPerMillion,
    /// Fan speed in revolutions per minute.
    RevolutionsPerMinute,
    /// A number of days.
    Days,
    /// Unitless values like levels, flags and states.
    None,
}

impl Unit {
    /// The display symbol, empty for unitless values.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::PartsPerMillion => "ppm",
            Unit::RevolutionsPerMinute => "rpm",
            Unit::Days => "d",
            Unit::None => "",
        }
    }
}

/// Static metadata of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    /// Stable snake_case identifier.
    pub name: &'static str,
    /// Register address used on the wire.
    pub address: u16,
    /// Fixed-point divider: a raw value of `215` with a scale of `10` is `21.5`.
    pub scale: u16,
    /// Unit of measurement.
    pub unit: Unit,
}

impl KeyInfo {
    const fn new(name: &'static str, address: u16, scale: u16, unit: Unit) -> KeyInfo {
        KeyInfo {
            name,
            address,
            scale,
            unit,
        }
    }

    /// Convert a value at native scale into the raw fixed-point representation.
    ///
    /// The result is rounded and saturated, it never collides with the
    /// "no value" marker.
    pub fn to_raw(&self, value: f64) -> i16 {
        let raw = (value * f64::from(self.scale)).round();
        if raw.is_nan() {
            0
        } else if raw >= f64::from(i16::MAX) {
            i16::MAX
        } else if raw <= f64::from(i16::MIN + 1) {
            i16::MIN + 1
        } else {
            raw as i16
        }
    }

    /// The smallest step representable on the wire.
    pub fn resolution(&self) -> f64 {
        1.0 / f64::from(self.scale)
    }

    /// Convert a raw fixed-point value into the native scale.
    pub fn from_raw(&self, raw: i16) -> f64 {
        f64::from(raw) / f64::from(self.scale)
    }

    /// A human readable name, e.g. `"Co2 Level"` becomes `"CO2 Level"`.
    pub fn friendly_name(&self) -> String {
        self.name
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| match part {
                "co2" | "cts" | "rpm" => part.to_ascii_uppercase(),
                _ => {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                        None => String::new(),
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A read-only value reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatapointKey {
    /// Supply air temperature.
    TempSupply,
    /// Outdoor air temperature.
    TempOutside,
    /// Exhaust air temperature.
    TempExhaust,
    /// Extract air temperature.
    TempExtract,
    /// Room temperature.
    TempRoom,
    /// Heat pump condenser temperature.
    TempCondenser,
    /// Heat pump evaporator temperature.
    TempEvaporator,
    /// Hot water tank temperature, top sensor.
    TempHotwaterTop,
    /// Hot water tank temperature, bottom sensor.
    TempHotwaterBottom,
    /// Relative humidity of the extract air.
    Humidity,
    /// CO2 level of the extract air.
    Co2Level,
    /// Supply fan duty cycle.
    SupplyFanPwm,
    /// Extract fan duty cycle.
    ExtractFanPwm,
    /// Supply fan speed.
    SupplyFanRpm,
    /// Extract fan speed.
    ExtractFanRpm,
    /// Bypass damper state.
    BypassActive,
    /// Defrost cycle state.
    DefrostActive,
    /// Compressor state.
    CompressorActive,
    /// Active alarm code, `0` if none.
    AlarmStatus,
    /// Days left until the filter needs to be replaced.
    FilterDaysLeft,
    /// Internal CTS controller state.
    CtsState,
}

impl DatapointKey {
    /// All datapoint keys.
    pub const ALL: &'static [DatapointKey] = &[
        DatapointKey::TempSupply,
        DatapointKey::TempOutside,
        DatapointKey::TempExhaust,
        DatapointKey::TempExtract,
        DatapointKey::TempRoom,
        DatapointKey::TempCondenser,
        DatapointKey::TempEvaporator,
        DatapointKey::TempHotwaterTop,
        DatapointKey::TempHotwaterBottom,
        DatapointKey::Humidity,
        DatapointKey::Co2Level,
        DatapointKey::SupplyFanPwm,
        DatapointKey::ExtractFanPwm,
        DatapointKey::SupplyFanRpm,
        DatapointKey::ExtractFanRpm,
        DatapointKey::BypassActive,
        DatapointKey::DefrostActive,
        DatapointKey::CompressorActive,
        DatapointKey::AlarmStatus,
        DatapointKey::FilterDaysLeft,
        DatapointKey::CtsState,
    ];

    /// The static metadata of this key.
    pub fn info(self) -> KeyInfo {
        match self {
            DatapointKey::TempSupply => KeyInfo::new("temp_supply", 20, 10, Unit::Celsius),
            DatapointKey::TempOutside => KeyInfo::new("temp_outside", 21, 10, Unit::Celsius),
            DatapointKey::TempExhaust => KeyInfo::new("temp_exhaust", 22, 10, Unit::Celsius),
            DatapointKey::TempExtract => KeyInfo::new("temp_extract", 23, 10, Unit::Celsius),
            DatapointKey::TempRoom => KeyInfo::new("temp_room", 24, 10, Unit::Celsius),
            DatapointKey::TempCondenser => KeyInfo::new("temp_condenser", 25, 10, Unit::Celsius),
            DatapointKey::TempEvaporator => KeyInfo::new("temp_evaporator", 26, 10, Unit::Celsius),
            DatapointKey::TempHotwaterTop => {
                KeyInfo::new("temp_hotwater_top", 27, 10, Unit::Celsius)
            }
            DatapointKey::TempHotwaterBottom => {
                KeyInfo::new("temp_hotwater_bottom", 28, 10, Unit::Celsius)
            }
            DatapointKey::Humidity => KeyInfo::new("humidity", 30, 1, Unit::Percent),
            DatapointKey::Co2Level => KeyInfo::new("co2_level", 31, 1, Unit::PartsPerMillion),
            DatapointKey::SupplyFanPwm => KeyInfo::new("supply_fan_pwm", 40, 1, Unit::Percent),
            DatapointKey::ExtractFanPwm => KeyInfo::new("extract_fan_pwm", 41, 1, Unit::Percent),
            DatapointKey::SupplyFanRpm => {
                KeyInfo::new("supply_fan_rpm", 42, 1, Unit::RevolutionsPerMinute)
            }
            DatapointKey::ExtractFanRpm => {
                KeyInfo::new("extract_fan_rpm", 43, 1, Unit::RevolutionsPerMinute)
            }
            DatapointKey::BypassActive => KeyInfo::new("bypass_active", 50, 1, Unit::None),
            DatapointKey::DefrostActive => KeyInfo::new("defrost_active", 51, 1, Unit::None),
            DatapointKey::CompressorActive => KeyInfo::new("compressor_active", 52, 1, Unit::None),
            DatapointKey::AlarmStatus => KeyInfo::new("alarm_status", 53, 1, Unit::None),
            DatapointKey::FilterDaysLeft => KeyInfo::new("filter_days_left", 60, 1, Unit::Days),
            DatapointKey::CtsState => KeyInfo::new("cts_state", 61, 1, Unit::None),
        }
    }

    /// The stable string identifier.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look up a key by its wire address.
    pub fn from_address(address: u16) -> Option<DatapointKey> {
        DatapointKey::ALL
            .iter()
            .copied()
            .find(|key| key.info().address == address)
    }
}

/// A read/write value with device enforced bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetpointKey {
    /// Ventilation level.
    FanSpeed,
    /// Target room temperature.
    TempSetpoint,
    /// Lower limit of the supply air temperature.
    TempMinSupply,
    /// Upper limit of the supply air temperature.
    TempMaxSupply,
    /// Temperature offset at which the bypass opens.
    BypassOpenOffset,
    /// Humidity level below which ventilation is reduced.
    HumidityLowLimit,
    /// CO2 level above which ventilation is increased.
    Co2Setpoint,
    /// Filter replacement interval.
    FilterIntervalDays,
    /// Hot water target temperature.
    HotwaterSetpoint,
    /// Temperature reduction while in away mode.
    ReduceHeating,
}

impl SetpointKey {
    /// All setpoint keys.
    pub const ALL: &'static [SetpointKey] = &[
        SetpointKey::FanSpeed,
        SetpointKey::TempSetpoint,
        SetpointKey::TempMinSupply,
        SetpointKey::TempMaxSupply,
        SetpointKey::BypassOpenOffset,
        SetpointKey::HumidityLowLimit,
        SetpointKey::Co2Setpoint,
        SetpointKey::FilterIntervalDays,
        SetpointKey::HotwaterSetpoint,
        SetpointKey::ReduceHeating,
    ];

    /// The static metadata of this key.
    pub fn info(self) -> KeyInfo {
        match self {
            SetpointKey::FanSpeed => KeyInfo::new("fan_speed", 100, 1, Unit::None),
            SetpointKey::TempSetpoint => KeyInfo::new("temp_setpoint", 101, 10, Unit::Celsius),
            SetpointKey::TempMinSupply => KeyInfo::new("temp_min_supply", 102, 10, Unit::Celsius),
            SetpointKey::TempMaxSupply => KeyInfo::new("temp_max_supply", 103, 10, Unit::Celsius),
            SetpointKey::BypassOpenOffset => {
                KeyInfo::new("bypass_open_offset", 104, 10, Unit::Celsius)
            }
            SetpointKey::HumidityLowLimit => {
                KeyInfo::new("humidity_low_limit", 105, 1, Unit::Percent)
            }
            SetpointKey::Co2Setpoint => KeyInfo::new("co2_setpoint", 106, 1, Unit::PartsPerMillion),
            SetpointKey::FilterIntervalDays => {
                KeyInfo::new("filter_interval_days", 107, 1, Unit::Days)
            }
            SetpointKey::HotwaterSetpoint => {
                KeyInfo::new("hotwater_setpoint", 108, 10, Unit::Celsius)
            }
            SetpointKey::ReduceHeating => KeyInfo::new("reduce_heating", 109, 10, Unit::Celsius),
        }
    }

    /// The stable string identifier.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look up a key by its wire address.
    pub fn from_address(address: u16) -> Option<SetpointKey> {
        SetpointKey::ALL
            .iter()
            .copied()
            .find(|key| key.info().address == address)
    }
}

impl FromStr for DatapointKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<DatapointKey> {
        DatapointKey::ALL
            .iter()
            .copied()
            .find(|key| key.name() == s)
            .ok_or_else(|| Error::UnknownKey(s.to_string()))
    }
}

impl FromStr for SetpointKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<SetpointKey> {
        SetpointKey::ALL
            .iter()
            .copied()
            .find(|key| key.name() == s)
            .ok_or_else(|| Error::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for DatapointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for SetpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Either a datapoint or a setpoint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// A datapoint key.
    Datapoint(DatapointKey),
    /// A setpoint key.
    Setpoint(SetpointKey),
}

impl Key {
    /// The static metadata of this key.
    pub fn info(self) -> KeyInfo {
        match self {
            Key::Datapoint(key) => key.info(),
            Key::Setpoint(key) => key.info(),
        }
    }

    /// The stable string identifier.
    pub fn name(self) -> &'static str {
        self.info().name
    }
}

impl From<DatapointKey> for Key {
    fn from(key: DatapointKey) -> Key {
        Key::Datapoint(key)
    }
}

impl From<SetpointKey> for Key {
    fn from(key: SetpointKey) -> Key {
        Key::Setpoint(key)
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Key> {
        s.parse::<DatapointKey>()
            .map(Key::Datapoint)
            .or_else(|_| s.parse::<SetpointKey>().map(Key::Setpoint))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bounds of a setpoint as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SetpointRange {
    /// Lowest accepted value.
    pub min: f64,
    /// Highest accepted value.
    pub max: f64,
    /// Increment between accepted values.
    pub step: f64,
}

impl SetpointRange {
    /// Whether `value` lies inside the inclusive range.
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}
