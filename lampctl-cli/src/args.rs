use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command line client for the SAD-Lamp sunrise alarm lamp
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(disable_help_subcommand = true)]
pub struct App {
    /// Device host name or IP
    #[arg(short = 'H', long)]
    pub host: String,

    /// Port of the WebSocket message channel
    #[arg(long, default_value_t = 81)]
    pub channel_port: u16,

    /// Port of the HTTP firmware upload endpoint
    #[arg(long, default_value_t = 80)]
    pub upload_port: u16,

    /// Firmware upload timeout (in s, 0 = unbounded)
    #[arg(short, long, default_value_t = 0)]
    pub timeout: u64,

    /// Print results as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Show a progress bar during uploads
    #[arg(short, long)]
    pub progress: bool,

    /// Command group
    #[command(subcommand)]
    pub group: Group,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Fetch all device settings
    Get,
    /// Set the device clock
    SetDatetime {
        /// The datetime to set, e.g. '2026-08-30T06:15:00'.
        /// Defaults to the current local time.
        value: Option<String>,
    },
    /// Set the alarm time and weekdays
    SetAlarm {
        /// Alarm time as HH:MM
        time: String,
        /// Weekday indices the alarm fires on (0-6), comma separated
        #[arg(short, long, value_delimiter = ',')]
        days: Vec<u8>,
    },
    /// Arm the alarm
    EnableAlarm,
    /// Disarm the alarm
    DisableAlarm,
    /// Set the sunrise duration in minutes (0-1440)
    SetSunriseDuration {
        /// Duration in minutes
        minutes: u16,
    },
    /// Set the manual brightness level (0-1023)
    SetBrightness {
        /// PWM level
        level: u16,
    },
}

#[derive(Debug, Subcommand)]
pub enum Group {
    /// Device settings management
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Reboot the MCU, streaming its status lines
    Reboot,
    /// Tail the device debug log
    Logs {
        /// Stop after this many log messages (0 = run until the connection
        /// drops)
        #[arg(short, long, default_value_t = 0)]
        count: u64,
    },
    /// Reboot the ESP bridge itself
    RebootEsp,
    /// Clear the bridge's stored WiFi credentials
    ResetWifi,
    /// Upload bridge firmware over HTTP
    Upload {
        /// The firmware image file
        file: PathBuf,
    },
    /// Flash MCU firmware from a file on the bridge filesystem
    Flash {
        /// Path of the image on the bridge
        path: String,
    },
    /// Send a raw command line over the channel
    Raw {
        /// The wire identifier
        identifier: String,
        /// Pre-encoded argument string
        args: Option<String>,
        /// Expect a status stream terminated by DONE instead of a single
        /// response
        #[arg(long)]
        stream: bool,
    },
}
