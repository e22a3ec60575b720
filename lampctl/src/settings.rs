use std::{fmt, ops::Range, str::FromStr};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::ERROR_MARKER;

/// Errors that can happen while decoding a device setting field.
///
/// The wire format has no delimiters within a field group; fields are cut
/// out of the response at fixed character offsets. Do not adjust the
/// offsets without changing the device firmware as well.
#[derive(Error, Debug, Diagnostic)]
pub enum DecodeError {
    /// The settings response was not the expected JSON object.
    #[error("response is not a valid settings object")]
    #[diagnostic(code(lampctl::settings::decode::json))]
    Json(#[from] serde_json::Error),
    /// A field was shorter than its fixed-width layout.
    #[error("field '{field}' is shorter than its fixed layout")]
    #[diagnostic(code(lampctl::settings::decode::truncated))]
    Truncated {
        /// The field that was cut short
        field: &'static str,
    },
    /// A field contained a malformed number.
    #[error("field '{field}' contains a malformed number")]
    #[diagnostic(code(lampctl::settings::decode::number))]
    BadNumber {
        /// The field that failed to parse
        field: &'static str,
    },
}

fn slice<'a>(s: &'a str, range: Range<usize>, field: &'static str) -> Result<&'a str, DecodeError> {
    s.get(range).ok_or(DecodeError::Truncated { field })
}

fn number<T: FromStr>(s: &str, field: &'static str) -> Result<T, DecodeError> {
    s.trim().parse().map_err(|_| DecodeError::BadNumber { field })
}

/// A 7-bit weekday mask: bit `i` set means the alarm fires on weekday `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct DowMask(u8);

impl DowMask {
    /// Number of addressable weekdays.
    pub const DAYS: u8 = 7;

    /// Mask with no weekday enabled.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a mask from raw bits; bits outside the 7 weekdays are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7f)
    }

    /// The raw bit pattern.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether the given weekday index (0..7) is enabled.
    pub const fn contains(self, day: u8) -> bool {
        day < Self::DAYS && self.0 & (1 << day) != 0
    }

    /// Returns the mask with the given weekday index enabled.
    pub const fn with(self, day: u8) -> Self {
        if day < Self::DAYS {
            Self(self.0 | (1 << day))
        } else {
            self
        }
    }

    /// Iterates over the enabled weekday indices.
    pub fn days(self) -> impl Iterator<Item = u8> {
        (0..Self::DAYS).filter(move |day| self.contains(*day))
    }
}

impl fmt::LowerHex for DowMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for DowMask {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = u8::from_str_radix(s.trim(), 16)
            .map_err(|_| DecodeError::BadNumber { field: "alarm" })?;
        Ok(Self::from_bits(bits))
    }
}

/// The device RTC state, as reported by the settings fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceClock {
    /// Hour, 0..24
    pub hour: u8,
    /// Minute, 0..60
    pub minute: u8,
    /// Second, 0..60
    pub second: u8,
    /// Day of month, 1..=31
    pub day: u8,
    /// Month, 1..=12
    pub month: u8,
    /// Full year
    pub year: u16,
}

impl DeviceClock {
    /// Decodes the fixed-width `HH:MM:SS DD/MM/YYYY` clock field.
    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            hour: number(slice(s, 0..2, "time")?, "time")?,
            minute: number(slice(s, 3..5, "time")?, "time")?,
            second: number(slice(s, 6..8, "time")?, "time")?,
            day: number(slice(s, 9..11, "time")?, "time")?,
            month: number(slice(s, 12..14, "time")?, "time")?,
            year: number(slice(s, 15..19, "time")?, "time")?,
        })
    }
}

/// The device alarm state, as reported by the settings fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlarmSetting {
    /// Whether the alarm is armed
    pub enabled: bool,
    /// Alarm hour, 0..24
    pub hour: u8,
    /// Alarm minute, 0..60
    pub minute: u8,
    /// Enabled weekdays
    pub days: DowMask,
}

impl AlarmSetting {
    /// Decodes the fixed-width `<E|D> HH:MM <dow-hex>` alarm field.
    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            enabled: slice(s, 0..1, "alarm")? == "E",
            hour: number(slice(s, 2..4, "alarm")?, "alarm")?,
            minute: number(slice(s, 5..7, "alarm")?, "alarm")?,
            days: slice(s, 8..10, "alarm")?.parse()?,
        })
    }
}

/// The device brightness state, as reported by the settings fetch.
///
/// The numeric level is reported in both modes; in auto mode it is the
/// value the light sensor currently drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Brightness {
    /// Whether brightness is driven by the light sensor
    pub auto: bool,
    /// PWM level, 0..=1023
    pub level: u16,
}

impl Brightness {
    /// Decodes the fixed-width `<A|M> NNNN` brightness field.
    pub fn decode(s: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            auto: slice(s, 0..1, "brightness")? == "A",
            level: number(
                s.get(2..).ok_or(DecodeError::Truncated {
                    field: "brightness",
                })?,
                "brightness",
            )?,
        })
    }
}

/// Decodes the sunrise duration field (decimal minutes).
pub fn decode_sunrise_duration(s: &str) -> Result<u16, DecodeError> {
    number(s, "sunrise duration")
}

/// An error the device reported for a single settings field.
///
/// Carries the device's message verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FieldError(pub String);

/// The wire shape of the settings-fetch response.
#[derive(Debug, Deserialize)]
struct RawSettings {
    time: String,
    alarm: String,
    #[serde(rename = "sunrise duration")]
    sunrise_duration: String,
    brightness: String,
}

/// The decoded settings-fetch response.
///
/// The device reports each field independently and may fail some of them
/// while the rest stay valid; one bad field does not invalidate the others.
/// Failed fields carry the device's error message verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsReport {
    /// The device RTC state
    pub clock: Result<DeviceClock, FieldError>,
    /// The alarm state
    pub alarm: Result<AlarmSetting, FieldError>,
    /// Sunrise duration in minutes, 0..=1440
    pub sunrise_duration: Result<u16, FieldError>,
    /// The brightness state
    pub brightness: Result<Brightness, FieldError>,
}

fn field<T>(
    raw: &str,
    decode: impl FnOnce(&str) -> Result<T, DecodeError>,
) -> Result<Result<T, FieldError>, DecodeError> {
    if raw.starts_with(ERROR_MARKER) {
        Ok(Err(FieldError(raw.to_string())))
    } else {
        decode(raw).map(Ok)
    }
}

impl SettingsReport {
    /// Decodes the JSON settings response.
    ///
    /// Only a malformed response errors here; per-field device errors are
    /// recorded inside the report.
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        let raw: RawSettings = serde_json::from_str(raw)?;
        Ok(Self {
            clock: field(&raw.time, DeviceClock::decode)?,
            alarm: field(&raw.alarm, AlarmSetting::decode)?,
            sunrise_duration: field(&raw.sunrise_duration, decode_sunrise_duration)?,
            brightness: field(&raw.brightness, Brightness::decode)?,
        })
    }

    /// Whether at least one field failed.
    pub fn is_partial(&self) -> bool {
        self.clock.is_err()
            || self.alarm.is_err()
            || self.sunrise_duration.is_err()
            || self.brightness.is_err()
    }

    /// Whether every field failed.
    pub fn all_failed(&self) -> bool {
        self.clock.is_err()
            && self.alarm.is_err()
            && self.sunrise_duration.is_err()
            && self.brightness.is_err()
    }

    /// Aggregates the per-field error messages into one human-readable
    /// string, or `None` if every field decoded.
    pub fn error_summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Err(err) = &self.clock {
            parts.push(format!("Get time error: {err}"));
        }
        if let Err(err) = &self.alarm {
            parts.push(format!("Get alarm error: {err}"));
        }
        if let Err(err) = &self.sunrise_duration {
            parts.push(format!("Get sunrise duration error: {err}"));
        }
        if let Err(err) = &self.brightness {
            parts.push(format!("Get brightness error: {err}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_clock_fields() {
        let clock = DeviceClock::decode("12:34:56 07/08/2023").unwrap();
        assert_eq!(
            clock,
            DeviceClock {
                hour: 12,
                minute: 34,
                second: 56,
                day: 7,
                month: 8,
                year: 2023,
            }
        );
    }

    #[test]
    fn decode_clock_truncated() {
        assert!(matches!(
            DeviceClock::decode("12:34:56 07/08"),
            Err(DecodeError::Truncated { field: "time" })
        ));
    }

    #[test]
    fn decode_alarm_fields() {
        let alarm = AlarmSetting::decode("E 06:15 2A").unwrap();
        assert!(alarm.enabled);
        assert_eq!(alarm.hour, 6);
        assert_eq!(alarm.minute, 15);
        assert_eq!(alarm.days.bits(), 0x2a);
        assert_eq!(alarm.days.days().collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn decode_alarm_disabled() {
        let alarm = AlarmSetting::decode("D 22:30 00").unwrap();
        assert!(!alarm.enabled);
        assert_eq!(alarm.days, DowMask::empty());
    }

    #[test]
    fn decode_brightness_manual() {
        assert_eq!(
            Brightness::decode("M 0512").unwrap(),
            Brightness {
                auto: false,
                level: 512,
            }
        );
    }

    #[test]
    fn decode_brightness_auto() {
        assert_eq!(
            Brightness::decode("A 1023").unwrap(),
            Brightness {
                auto: true,
                level: 1023,
            }
        );
    }

    #[test]
    fn dow_mask_hex_round_trip() {
        let mask: DowMask = "2A".parse().unwrap();
        assert_eq!(format!("{mask:x}"), "2a");
        assert_eq!("2a".parse::<DowMask>().unwrap(), mask);
    }

    #[test]
    fn dow_mask_ignores_bit_seven() {
        assert_eq!(DowMask::from_bits(0xff).bits(), 0x7f);
        assert!(!DowMask::empty().with(7).contains(7));
    }

    #[test]
    fn report_partial_failure() {
        let raw = r#"{
            "time": "12:34:56 07/08/2023",
            "alarm": "E 06:15 2A",
            "sunrise duration": "ERROR: sunrise duration unavailable",
            "brightness": "M 0512"
        }"#;
        let report = SettingsReport::from_json(raw).unwrap();

        assert!(report.clock.is_ok());
        assert!(report.alarm.is_ok());
        assert!(report.brightness.is_ok());
        assert!(report.is_partial());
        assert!(!report.all_failed());

        let summary = report.error_summary().unwrap();
        assert_eq!(
            summary,
            "Get sunrise duration error: ERROR: sunrise duration unavailable"
        );
    }

    #[test]
    fn report_full_success() {
        let raw = r#"{
            "time": "00:00:00 01/01/2024",
            "alarm": "D 00:00 00",
            "sunrise duration": "0030",
            "brightness": "A 0000"
        }"#;
        let report = SettingsReport::from_json(raw).unwrap();
        assert!(!report.is_partial());
        assert_eq!(report.error_summary(), None);
        assert_eq!(report.sunrise_duration, Ok(30));
    }

    #[test]
    fn report_all_failed() {
        let raw = r#"{
            "time": "ERROR 1",
            "alarm": "ERROR 2",
            "sunrise duration": "ERROR 3",
            "brightness": "ERROR 4"
        }"#;
        let report = SettingsReport::from_json(raw).unwrap();
        assert!(report.all_failed());
        let summary = report.error_summary().unwrap();
        assert!(summary.contains("ERROR 1"));
        assert!(summary.contains("ERROR 4"));
    }

    #[test]
    fn report_rejects_non_json() {
        assert!(matches!(
            SettingsReport::from_json("DONE"),
            Err(DecodeError::Json(_))
        ));
    }
}
