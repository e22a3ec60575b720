#![forbid(unsafe_code)]

mod args;
use args::{Group, SettingsCommand};

mod formatting;
use formatting::{print_report, report_json};

mod progress;
use progress::with_upload_progress;

use std::{
    fs::File,
    io::{self, Write},
    time::Duration,
};

use clap::Parser;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use lampctl::{
    LampClient,
    client::{CommandError, ConnectError, ConnectParams},
    registry::{CommandSpec, DONE_LITERAL, ResponsePayload, ResponsePolicy},
    settings::DowMask,
    upload::{REBOOT_GRACE, UploadError},
};
use miette::Diagnostic;
use thiserror::Error;

/// Possible CLI errors.
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Failed to connect to the device")]
    #[diagnostic(code(lampctl::cli::connect_failed))]
    ConnectFailed(#[from] ConnectError),
    #[error("Command execution failed")]
    #[diagnostic(code(lampctl::cli::execution_failed))]
    CommandExecutionFailed(#[from] CommandError),
    #[error("Firmware upload failed")]
    #[diagnostic(code(lampctl::cli::upload_failed))]
    UploadFailed(#[from] UploadError),
    #[error("Json encode failed")]
    #[diagnostic(code(lampctl::cli::json_encode))]
    JsonEncodeError(#[source] serde_json::Error),
    #[error("Failed to read the firmware image")]
    #[diagnostic(code(lampctl::cli::input))]
    InputReadFailed(#[source] std::io::Error),
    #[error("Failed to parse datetime string")]
    #[diagnostic(code(lampctl::cli::chrono_parse))]
    ChronoParseFailed(#[from] chrono::ParseError),
    #[error("Failed to parse alarm time, expected HH:MM")]
    #[diagnostic(code(lampctl::cli::alarm_time))]
    BadAlarmTime,
    #[error("Weekday index out of range (0-6): {0}")]
    #[diagnostic(code(lampctl::cli::alarm_day))]
    BadAlarmDay(u8),
}

fn parse_alarm_time(time: &str) -> Result<(u8, u8), CliError> {
    let (hour, minute) = time.split_once(':').ok_or(CliError::BadAlarmTime)?;
    let hour: u8 = hour.parse().map_err(|_| CliError::BadAlarmTime)?;
    let minute: u8 = minute.parse().map_err(|_| CliError::BadAlarmTime)?;
    if hour >= 24 || minute >= 60 {
        return Err(CliError::BadAlarmTime);
    }
    Ok((hour, minute))
}

fn cli_main() -> Result<(), CliError> {
    let multi = MultiProgress::new();
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .build();
    LogWrapper::new(multi.clone(), logger).try_init().ok();

    let args = args::App::parse();

    let mut client = LampClient::connect(
        &args.host,
        ConnectParams {
            channel_port: args.channel_port,
            upload_port: args.upload_port,
            upload_timeout: (args.timeout != 0).then(|| Duration::from_secs(args.timeout)),
        },
    )?;

    match args.group {
        Group::Settings { command } => match command {
            SettingsCommand::Get => {
                let report = client.get_settings()?;
                if let Some(summary) = report.error_summary() {
                    log::warn!("{summary}");
                }

                if args.json {
                    let json = serde_json::to_string_pretty(&report_json(&report))
                        .map_err(CliError::JsonEncodeError)?;
                    println!("{json}");
                } else {
                    print_report(&report);
                }
            }
            SettingsCommand::SetDatetime { value } => {
                let datetime = match value {
                    Some(value) => value.parse::<chrono::NaiveDateTime>()?,
                    None => chrono::Local::now().naive_local(),
                };
                client.set_datetime(datetime)?;
                println!("Set device time to: {}", datetime.format("%F %T"));
            }
            SettingsCommand::SetAlarm { time, days } => {
                let (hour, minute) = parse_alarm_time(&time)?;
                let mut mask = DowMask::empty();
                for day in days {
                    if day >= DowMask::DAYS {
                        return Err(CliError::BadAlarmDay(day));
                    }
                    mask = mask.with(day);
                }
                client.set_alarm(hour, minute, mask)?;
            }
            SettingsCommand::EnableAlarm => client.enable_alarm(true)?,
            SettingsCommand::DisableAlarm => client.enable_alarm(false)?,
            SettingsCommand::SetSunriseDuration { minutes } => {
                client.set_sunrise_duration(minutes)?;
            }
            SettingsCommand::SetBrightness { level } => client.set_brightness(level)?,
        },
        Group::Reboot => {
            client.reboot(Some(&mut |line: &str| println!("{line}")))?;
        }
        Group::Logs { count } => {
            let mut seen = 0u64;
            client.stream_logs(&mut |chunk: &str| {
                // Log chunks carry their own line breaks.
                print!("{chunk}");
                io::stdout().flush().ok();
                seen += 1;
                count == 0 || seen < count
            })?;
        }
        Group::RebootEsp => {
            let body = client.reboot_esp()?;
            if !body.is_empty() {
                println!("{body}");
            }
            println!("The bridge is rebooting; reconnect once it is back up");
        }
        Group::ResetWifi => {
            let body = client.reset_wifi_settings()?;
            if !body.is_empty() {
                println!("{body}");
            }
            println!(
                "WiFi settings cleared; connect to the SAD-Lamp_AP access point to reconfigure"
            );
        }
        Group::Upload { file } => {
            let image = File::open(&file).map_err(CliError::InputReadFailed)?;
            let size = image.metadata().map_err(CliError::InputReadFailed)?.len();

            let body = with_upload_progress(&multi, args.progress, size, |progress| {
                client.upload_firmware(image, size, progress)
            })?;

            if !body.is_empty() {
                println!("{body}");
            }
            println!(
                "Upload accepted, the device is rebooting; reconnect in about {} s",
                REBOOT_GRACE.as_secs()
            );
        }
        Group::Flash { path } => {
            client.flash_firmware(path)?;
        }
        Group::Raw {
            identifier,
            args: command_args,
            stream,
        } => {
            // The registry keys on 'static identifiers; a one-off leak per
            // invocation is fine for a short-lived CLI process.
            let identifier: &'static str = Box::leak(identifier.into_boxed_str());
            client.registry_mut().register(CommandSpec {
                identifier,
                policy: if stream {
                    ResponsePolicy::StreamUntilTerminal
                } else {
                    ResponsePolicy::SingleResponse
                },
                decoder: None,
            });

            let payload = client.execute_raw(
                identifier,
                command_args.as_deref(),
                Some(&mut |line: &str| println!("{line}")),
            )?;
            if let ResponsePayload::Text(text) = payload {
                if !text.is_empty() && text != DONE_LITERAL {
                    println!("{text}");
                }
            }
        }
    }

    Ok(())
}

fn main() -> miette::Result<()> {
    cli_main().map_err(Into::into)
}
