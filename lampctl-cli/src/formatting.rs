use console::style;
use lampctl::settings::{AlarmSetting, Brightness, DeviceClock, FieldError, SettingsReport};
use serde_json::json;

fn field_json<T: serde::Serialize>(field: &Result<T, FieldError>) -> serde_json::Value {
    match field {
        Ok(value) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        Err(err) => json!({ "error": err.to_string() }),
    }
}

/// Renders the settings report as a JSON object keyed by the wire field
/// names; failed fields become `{"error": ...}` objects.
pub fn report_json(report: &SettingsReport) -> serde_json::Value {
    json!({
        "time": field_json(&report.clock),
        "alarm": field_json(&report.alarm),
        "sunrise duration": field_json(&report.sunrise_duration),
        "brightness": field_json(&report.brightness),
    })
}

fn print_field<T>(key: &str, field: &Result<T, FieldError>, render: impl FnOnce(&T) -> String) {
    match field {
        Ok(value) => println!("{key:<17} {}", render(value)),
        Err(err) => println!("{key:<17} {}", style(err).red()),
    }
}

fn render_clock(clock: &DeviceClock) -> String {
    format!(
        "{:02}:{:02}:{:02} {:02}/{:02}/{:04}",
        clock.hour, clock.minute, clock.second, clock.day, clock.month, clock.year
    )
}

fn render_alarm(alarm: &AlarmSetting) -> String {
    let days = alarm
        .days
        .days()
        .map(|day| day.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{:02}:{:02} ({}) on days [{days}]",
        alarm.hour,
        alarm.minute,
        if alarm.enabled { "armed" } else { "disarmed" },
    )
}

fn render_brightness(brightness: &Brightness) -> String {
    format!(
        "{} ({})",
        brightness.level,
        if brightness.auto { "auto" } else { "manual" }
    )
}

/// Prints the settings report as aligned key/value lines; failed fields
/// show the device's message in red.
pub fn print_report(report: &SettingsReport) {
    print_field("time", &report.clock, render_clock);
    print_field("alarm", &report.alarm, render_alarm);
    print_field("sunrise duration", &report.sunrise_duration, |minutes| {
        format!("{minutes} min")
    });
    print_field("brightness", &report.brightness, render_brightness);
}
