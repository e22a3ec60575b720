use std::collections::HashMap;

use crate::{
    dispatcher::CommandFailure,
    settings::SettingsReport,
};

/// Prefix marking a device response (or settings field) as an error.
pub const ERROR_MARKER: &str = "ERROR";

/// The literal a multi-response command ends with on success.
pub const DONE_LITERAL: &str = "DONE";

/// The wire identifiers of the standard device commands.
///
/// These strings are the protocol contract with the bridge firmware.
pub mod idents {
    /// Fetch all device settings as one JSON object
    pub const GET_SETTINGS: &str = "get_arduino_settings";
    /// Set the device RTC
    pub const SET_DATETIME: &str = "set_arduino_datetime";
    /// Arm or disarm the alarm
    pub const ENABLE_ALARM: &str = "enable_arduino_alarm";
    /// Set the alarm time and weekday mask
    pub const SET_ALARM_TIME: &str = "set_arduino_alarm_time";
    /// Set the sunrise duration in minutes
    pub const SET_SUNRISE_DURATION: &str = "set_arduino_sunrise_duration";
    /// Set the manual brightness level
    pub const SET_BRIGHTNESS: &str = "set_arduino_brightness";
    /// Reboot the MCU; streams status lines until `DONE`
    pub const REBOOT: &str = "reboot_arduino";
    /// Flash MCU firmware from a file on the bridge filesystem
    pub const FLASH_FIRMWARE: &str = "upload_arduino_firmware";
    /// Start streaming the device debug log over the channel
    pub const START_READING_LOGS: &str = "start_reading_logs";
    /// Stop streaming the device debug log
    pub const STOP_READING_LOGS: &str = "stop_reading_logs";
}

/// How many responses a command produces before it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// Exactly one response message, which is the terminal result.
    SingleResponse,
    /// Any number of progress lines, terminated by [`DONE_LITERAL`] or an
    /// [`ERROR_MARKER`]-prefixed line.
    StreamUntilTerminal,
}

/// The decoded payload of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// The raw response line, for commands without a structured decoder.
    Text(String),
    /// The decoded settings report.
    Settings(SettingsReport),
}

/// Decoder applied to the successful response of a command.
///
/// A decoder may itself conclude that the command failed, e.g. when every
/// field of a settings report carries an error.
pub type ResponseDecoder = fn(&str) -> Result<ResponsePayload, CommandFailure>;

/// The dispatch rules for one command identifier.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// The wire identifier
    pub identifier: &'static str,
    /// The response arity policy
    pub policy: ResponsePolicy,
    /// Structured decoder for the terminal response, if any
    pub decoder: Option<ResponseDecoder>,
}

fn decode_settings(raw: &str) -> Result<ResponsePayload, CommandFailure> {
    let report = SettingsReport::from_json(raw)?;
    if report.all_failed() {
        return Err(CommandFailure::DeviceReported(
            report.error_summary().unwrap_or_default(),
        ));
    }
    Ok(ResponsePayload::Settings(report))
}

/// The table mapping command identifiers to their dispatch rules.
///
/// The dispatcher never branches on a specific command; everything it needs
/// to route a response lives in this table, so new device commands are added
/// by registering a spec, not by touching dispatch logic.
pub struct CommandRegistry {
    specs: HashMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
        }
    }

    /// Builds the registry of the standard device commands.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        for identifier in [
            idents::SET_DATETIME,
            idents::ENABLE_ALARM,
            idents::SET_ALARM_TIME,
            idents::SET_SUNRISE_DURATION,
            idents::SET_BRIGHTNESS,
            idents::FLASH_FIRMWARE,
        ] {
            registry.register(CommandSpec {
                identifier,
                policy: ResponsePolicy::SingleResponse,
                decoder: None,
            });
        }

        registry.register(CommandSpec {
            identifier: idents::GET_SETTINGS,
            policy: ResponsePolicy::SingleResponse,
            decoder: Some(decode_settings),
        });

        registry.register(CommandSpec {
            identifier: idents::REBOOT,
            policy: ResponsePolicy::StreamUntilTerminal,
            decoder: None,
        });

        registry
    }

    /// Registers a command spec, replacing any previous one for the same
    /// identifier.
    pub fn register(&mut self, spec: CommandSpec) {
        self.specs.insert(spec.identifier, spec);
    }

    /// Looks up the spec for an identifier.
    pub fn get(&self, identifier: &str) -> Option<&CommandSpec> {
        self.specs.get(identifier)
    }

    /// Iterates over the registered identifiers.
    pub fn identifiers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
