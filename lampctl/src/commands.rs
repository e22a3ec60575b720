use chrono::NaiveDateTime;

use crate::{registry::idents, settings::DowMask};

/// Maximum sunrise duration the device accepts, in minutes.
pub const MAX_SUNRISE_MINUTES: u16 = 1440;

/// Maximum brightness PWM level the device accepts.
pub const MAX_BRIGHTNESS: u16 = 1023;

/// A typed request for one of the standard device commands.
///
/// Arguments are encoded exactly as the bridge firmware parses them;
/// numeric ranges are clamped to the device limits at encode time.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Fetch all device settings.
    GetSettings,
    /// Set the device RTC.
    SetDateTime(NaiveDateTime),
    /// Set the alarm time and weekday mask.
    SetAlarm {
        /// Alarm hour, 0..24
        hour: u8,
        /// Alarm minute, 0..60
        minute: u8,
        /// Weekdays the alarm fires on
        days: DowMask,
    },
    /// Arm (`true`) or disarm (`false`) the alarm.
    EnableAlarm(bool),
    /// Set the sunrise duration in minutes (clamped to 0..=1440).
    SetSunriseDuration(u16),
    /// Set the manual brightness level (clamped to 0..=1023).
    SetBrightness(u16),
    /// Reboot the MCU.
    Reboot,
    /// Flash MCU firmware from a file on the bridge filesystem.
    FlashFirmware {
        /// Path of the firmware image on the bridge
        path: String,
    },
}

impl Command {
    /// The wire identifier of this command.
    pub fn identifier(&self) -> &'static str {
        match self {
            Command::GetSettings => idents::GET_SETTINGS,
            Command::SetDateTime(_) => idents::SET_DATETIME,
            Command::SetAlarm { .. } => idents::SET_ALARM_TIME,
            Command::EnableAlarm(_) => idents::ENABLE_ALARM,
            Command::SetSunriseDuration(_) => idents::SET_SUNRISE_DURATION,
            Command::SetBrightness(_) => idents::SET_BRIGHTNESS,
            Command::Reboot => idents::REBOOT,
            Command::FlashFirmware { .. } => idents::FLASH_FIRMWARE,
        }
    }

    /// The encoded argument string, or `None` for argument-less commands.
    pub fn encode_args(&self) -> Option<String> {
        match self {
            Command::GetSettings | Command::Reboot => None,
            Command::SetDateTime(datetime) => {
                Some(datetime.format("%H:%M:%S %d/%m/%Y").to_string())
            }
            Command::SetAlarm {
                hour,
                minute,
                days,
            } => Some(format!("{hour:02}:{minute:02} {days:x}")),
            Command::EnableAlarm(enable) => Some(if *enable { "E" } else { "D" }.to_string()),
            Command::SetSunriseDuration(minutes) => {
                Some(format!("{:04}", (*minutes).min(MAX_SUNRISE_MINUTES)))
            }
            Command::SetBrightness(level) => {
                Some(format!("{:04}", (*level).min(MAX_BRIGHTNESS)))
            }
            Command::FlashFirmware { path } => Some(format!("\"{path}\"")),
        }
    }

    /// The full wire line: `<identifier>` or `<identifier> <args>`.
    pub fn encode_line(&self) -> String {
        match self.encode_args() {
            Some(args) => format!("{} {}", self.identifier(), args),
            None => self.identifier().to_string(),
        }
    }
}
