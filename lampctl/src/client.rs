use std::{
    io::Read,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::NaiveDateTime;
use miette::Diagnostic;
use thiserror::Error;

use crate::{
    commands::Command,
    dispatcher::{
        CommandFailure, CommandOutcome, DispatchEvent, Dispatcher, InFlightCommand, IssueError,
    },
    registry::{CommandRegistry, ResponsePayload, idents},
    settings::{DowMask, SettingsReport},
    transport::{ChannelEvent, ChannelTransport},
    upload::{HttpUploader, UPLOAD_SLOT, UploadError, UploadProgressFn, UploadSession},
};

/// The port the bridge serves the WebSocket channel on.
const CHANNEL_PORT: u16 = 81;

/// Connection parameters for [`LampClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Port of the WebSocket message channel. Default: `81`.
    pub channel_port: u16,
    /// Port of the HTTP firmware upload endpoint. Default: `80`.
    pub upload_port: u16,
    /// Overall timeout for the firmware upload exchange.
    /// Default: `None` (unbounded; images over a slow link take a while).
    pub upload_timeout: Option<Duration>,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            channel_port: CHANNEL_PORT,
            upload_port: 80,
            upload_timeout: None,
        }
    }
}

/// Possible error values of [`LampClient::connect`].
#[derive(Error, Debug, Diagnostic)]
pub enum ConnectError {
    /// Opening the message channel failed.
    #[error("failed to open the device message channel")]
    #[diagnostic(code(lampctl::client::connect::channel))]
    Channel(#[from] crate::transport::ConnectError),
    /// Preparing the firmware upload client failed.
    #[error("failed to prepare the firmware upload client")]
    #[diagnostic(code(lampctl::client::connect::upload))]
    Upload(#[from] UploadError),
}

/// Errors a command can resolve with.
#[derive(Error, Debug, Diagnostic)]
pub enum CommandError {
    /// The command was never sent.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Issue(#[from] IssueError),
    /// The command was sent and reached the `Failed` terminal state.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Failed(#[from] CommandFailure),
}

/// A high level client for the lamp's control channel and firmware upload
/// path.
///
/// This struct is the central entry point of this crate. It owns the
/// dispatch state machine and enforces the device's one-operation-at-a-time
/// constraint across both the message channel and the upload path: issuing
/// anything while either is busy is rejected with
/// [`IssueError::CommandInProgress`] / [`UploadError::Busy`] and nothing
/// goes on the wire.
pub struct LampClient {
    dispatcher: Dispatcher,
    uploader: Option<HttpUploader>,
    upload: Option<Arc<Mutex<UploadSession>>>,
}

impl LampClient {
    /// Connects to a device by host name or IP.
    ///
    /// ```no_run
    /// # use lampctl::LampClient;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut client = LampClient::connect("192.168.4.1", Default::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(host: &str, params: ConnectParams) -> Result<Self, ConnectError> {
        let transport = crate::transport::WebSocketTransport::connect(&format!(
            "ws://{host}:{}/",
            params.channel_port
        ))?;
        let uploader = HttpUploader::new(
            format!("http://{host}:{}", params.upload_port),
            params.upload_timeout,
        )?;

        Ok(Self::from_parts(
            transport,
            CommandRegistry::standard(),
            Some(uploader),
        ))
    }

    /// Builds a client from its parts; used with custom transports.
    pub fn from_parts<T: ChannelTransport + Send + 'static>(
        transport: T,
        registry: CommandRegistry,
        uploader: Option<HttpUploader>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::with_registry(transport, registry),
            uploader,
            upload: None,
        }
    }

    /// The command currently in flight, if any.
    pub fn in_flight(&self) -> Option<&InFlightCommand> {
        self.dispatcher.in_flight()
    }

    /// Whether a command or an upload is currently active.
    pub fn is_busy(&self) -> bool {
        self.dispatcher.is_busy() || self.upload_active()
    }

    /// Mutable access to the command registry, for registering additional
    /// device commands.
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        self.dispatcher.registry_mut()
    }

    fn upload_active(&self) -> bool {
        self.upload.as_ref().is_some_and(|session| {
            session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_active()
        })
    }

    /// Issues a command and pumps the channel until it reaches a terminal
    /// state.
    ///
    /// Non-terminal status lines of multi-response commands are forwarded
    /// to `progress` as they arrive. Connection loss fails the command with
    /// [`CommandFailure::TransportClosed`]; the client is idle again
    /// afterwards, but the channel stays lost; there is no reconnect.
    pub fn execute(
        &mut self,
        command: &Command,
        progress: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ResponsePayload, CommandError> {
        self.check_upload_idle()?;
        self.dispatcher.issue(command)?;
        self.pump(progress)
    }

    /// Issues a command by identifier with pre-encoded arguments and pumps
    /// the channel until it reaches a terminal state.
    ///
    /// The identifier must be present in the command registry; see
    /// [`LampClient::registry_mut`] for registering additional device
    /// commands.
    pub fn execute_raw(
        &mut self,
        identifier: &str,
        arguments: Option<&str>,
        progress: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ResponsePayload, CommandError> {
        self.check_upload_idle()?;
        self.dispatcher.issue_raw(identifier, arguments)?;
        self.pump(progress)
    }

    fn check_upload_idle(&self) -> Result<(), IssueError> {
        if self.upload_active() {
            return Err(IssueError::CommandInProgress {
                current: UPLOAD_SLOT,
            });
        }
        Ok(())
    }

    fn pump(
        &mut self,
        mut progress: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ResponsePayload, CommandError> {
        loop {
            let event = match self.dispatcher.transport_mut().poll_event() {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("channel receive failed: {err}");
                    self.dispatcher.handle_disconnect();
                    return Err(CommandFailure::TransportClosed.into());
                }
            };

            match event {
                ChannelEvent::Message(raw) => match self.dispatcher.handle_message(&raw) {
                    Ok(DispatchEvent::Progress { line, .. }) => {
                        if let Some(progress) = &mut progress {
                            progress(&line);
                        }
                    }
                    Ok(DispatchEvent::Terminal(CommandOutcome::Succeeded {
                        payload, ..
                    })) => return Ok(payload),
                    Ok(DispatchEvent::Terminal(CommandOutcome::Failed { failure, .. })) => {
                        return Err(failure.into());
                    }
                    Err(violation) => log::warn!("{violation}"),
                },
                ChannelEvent::Closed => {
                    self.dispatcher.handle_disconnect();
                    return Err(CommandFailure::TransportClosed.into());
                }
            }
        }
    }

    /// Fetches all device settings.
    ///
    /// A partially failed report (some fields carrying device errors) still
    /// succeeds; check [`SettingsReport::error_summary`]. Only a report
    /// with every field failed resolves as an error.
    pub fn get_settings(&mut self) -> Result<SettingsReport, CommandError> {
        match self.execute(&Command::GetSettings, None)? {
            ResponsePayload::Settings(report) => Ok(report),
            ResponsePayload::Text(text) => Err(CommandFailure::DeviceReported(format!(
                "unexpected settings response: {text}"
            ))
            .into()),
        }
    }

    /// Sets the device RTC.
    pub fn set_datetime(&mut self, datetime: NaiveDateTime) -> Result<(), CommandError> {
        self.execute(&Command::SetDateTime(datetime), None)
            .map(drop)
    }

    /// Sets the alarm time and weekday mask.
    pub fn set_alarm(&mut self, hour: u8, minute: u8, days: DowMask) -> Result<(), CommandError> {
        self.execute(
            &Command::SetAlarm {
                hour,
                minute,
                days,
            },
            None,
        )
        .map(drop)
    }

    /// Arms or disarms the alarm.
    pub fn enable_alarm(&mut self, enable: bool) -> Result<(), CommandError> {
        self.execute(&Command::EnableAlarm(enable), None).map(drop)
    }

    /// Sets the sunrise duration in minutes (clamped to the device range).
    pub fn set_sunrise_duration(&mut self, minutes: u16) -> Result<(), CommandError> {
        self.execute(&Command::SetSunriseDuration(minutes), None)
            .map(drop)
    }

    /// Sets the manual brightness level (clamped to the device range).
    pub fn set_brightness(&mut self, level: u16) -> Result<(), CommandError> {
        self.execute(&Command::SetBrightness(level), None).map(drop)
    }

    /// Reboots the MCU, streaming its status lines to `progress`.
    ///
    /// The device emits a variable number of status lines over several
    /// seconds before the terminal `DONE`.
    pub fn reboot(
        &mut self,
        progress: Option<&mut dyn FnMut(&str)>,
    ) -> Result<(), CommandError> {
        self.execute(&Command::Reboot, progress).map(drop)
    }

    /// Flashes MCU firmware from a file already on the bridge filesystem.
    pub fn flash_firmware(
        &mut self,
        path: impl Into<String>,
    ) -> Result<(), CommandError> {
        self.execute(&Command::FlashFirmware { path: path.into() }, None)
            .map(drop)
    }

    /// Uploads a bridge firmware image over HTTP.
    ///
    /// Rejected with [`UploadError::Busy`] while a command or another
    /// upload is active. Returns the device's response body on success;
    /// the caller should wait [`crate::upload::REBOOT_GRACE`] and then
    /// reconnect to pick up the new firmware. There is no auto-retry: a
    /// failed upload must be resubmitted.
    pub fn upload_firmware<R: Read + Send + 'static>(
        &mut self,
        firmware: R,
        size: u64,
        progress: Option<Box<UploadProgressFn>>,
    ) -> Result<String, UploadError> {
        let session = self.begin_upload(size)?;

        let uploader = match &self.uploader {
            Some(uploader) => uploader,
            None => {
                session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .fail();
                self.upload = None;
                return Err(UploadError::NotConfigured);
            }
        };

        let result = uploader.upload(&session, firmware, progress);
        self.upload = None;
        result
    }

    /// Streams the device debug log to `sink` until it returns `false`.
    ///
    /// Log mode occupies the whole channel: the bridge forwards raw log
    /// data instead of command responses, so issuing anything while a
    /// command or upload is active is rejected the same way commands are.
    /// Payloads are forwarded verbatim, one channel message at a time;
    /// they carry their own line breaks. On a clean stop the stop request
    /// is sent so the bridge quits forwarding.
    pub fn stream_logs(
        &mut self,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), CommandError> {
        self.check_upload_idle()?;
        if let Some(current) = self.dispatcher.in_flight() {
            return Err(IssueError::CommandInProgress {
                current: current.identifier,
            }
            .into());
        }

        self.dispatcher
            .transport_mut()
            .send_text(idents::START_READING_LOGS)
            .map_err(IssueError::from)?;

        loop {
            match self.dispatcher.transport_mut().poll_event() {
                Ok(ChannelEvent::Message(raw)) => {
                    let chunk = String::from_utf8_lossy(&raw);
                    if !sink(&chunk) {
                        break;
                    }
                }
                Ok(ChannelEvent::Closed) => {
                    return Err(CommandFailure::TransportClosed.into());
                }
                Err(err) => {
                    log::warn!("channel receive failed: {err}");
                    return Err(CommandFailure::TransportClosed.into());
                }
            }
        }

        self.dispatcher
            .transport_mut()
            .send_text(idents::STOP_READING_LOGS)
            .map_err(IssueError::from)?;
        Ok(())
    }

    /// Reboots the ESP bridge itself over its HTTP maintenance endpoint.
    ///
    /// The message channel drops while the bridge restarts; reconnect once
    /// it is back up.
    pub fn reboot_esp(&self) -> Result<String, UploadError> {
        self.maintenance()?.reboot_esp()
    }

    /// Clears the bridge's stored WiFi credentials.
    ///
    /// The bridge reboots into its `SAD-Lamp_AP` configuration access
    /// point afterwards.
    pub fn reset_wifi_settings(&self) -> Result<String, UploadError> {
        self.maintenance()?.reset_wifi_settings()
    }

    fn maintenance(&self) -> Result<&HttpUploader, UploadError> {
        self.uploader.as_ref().ok_or(UploadError::NotConfigured)
    }

    /// Installs a new upload session, enforcing the one-operation-at-a-time
    /// boundary against both the dispatcher and any previous upload.
    pub fn begin_upload(&mut self, size: u64) -> Result<Arc<Mutex<UploadSession>>, UploadError> {
        if self.dispatcher.is_busy() || self.upload_active() {
            return Err(UploadError::Busy);
        }

        let session = Arc::new(Mutex::new(UploadSession::new(size)));
        self.upload = Some(Arc::clone(&session));
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use crate::{
        registry::idents,
        transport::{ReceiveError, SendError},
        upload::UploadState,
    };

    use super::*;

    /// Scripted transport: pre-loaded inbound events, recorded sends.
    #[derive(Default, Clone)]
    struct ScriptedTransport {
        sent: Arc<Mutex<Vec<String>>>,
        inbound: Arc<Mutex<VecDeque<ChannelEvent>>>,
    }

    impl ScriptedTransport {
        fn push_message(&self, text: &str) {
            self.inbound
                .lock()
                .unwrap()
                .push_back(ChannelEvent::Message(text.as_bytes().to_vec()));
        }

        fn push_closed(&self) {
            self.inbound.lock().unwrap().push_back(ChannelEvent::Closed);
        }
    }

    impl ChannelTransport for ScriptedTransport {
        fn send_text(&mut self, line: &str) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn poll_event(&mut self) -> Result<ChannelEvent, ReceiveError> {
            Ok(self
                .inbound
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ChannelEvent::Closed))
        }
    }

    fn client() -> (LampClient, ScriptedTransport) {
        let transport = ScriptedTransport::default();
        let client =
            LampClient::from_parts(transport.clone(), CommandRegistry::standard(), None);
        (client, transport)
    }

    #[test]
    fn set_brightness_round_trip() {
        let (mut client, transport) = client();
        transport.push_message("DONE");

        client.set_brightness(512).unwrap();
        assert_eq!(
            transport.sent.lock().unwrap().clone(),
            vec!["set_arduino_brightness 0512"]
        );
        assert!(!client.is_busy());
    }

    #[test]
    fn reboot_forwards_progress_lines() {
        let (mut client, transport) = client();
        transport.push_message("Resetting MCU...");
        transport.push_message("Handshake ok");
        transport.push_message("DONE");

        let mut lines = Vec::new();
        client
            .reboot(Some(&mut |line: &str| lines.push(line.to_string())))
            .unwrap();
        assert_eq!(lines, vec!["Resetting MCU...", "Handshake ok"]);
    }

    #[test]
    fn device_error_resolves_as_failed() {
        let (mut client, transport) = client();
        transport.push_message("ERROR: alarm rejected");

        let err = client.enable_alarm(true).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Failed(CommandFailure::DeviceReported(_))
        ));
        assert!(!client.is_busy());
    }

    #[test]
    fn disconnect_mid_command_fails_and_unblocks() {
        let (mut client, transport) = client();
        transport.push_message("Resetting MCU...");
        transport.push_closed();

        let err = client.reboot(None).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Failed(CommandFailure::TransportClosed)
        ));
        assert!(!client.is_busy());
    }

    #[test]
    fn get_settings_with_partial_failure_succeeds() {
        let (mut client, transport) = client();
        transport.push_message(
            r#"{
                "time": "12:34:56 07/08/2023",
                "alarm": "E 06:15 2A",
                "sunrise duration": "ERROR: not stored",
                "brightness": "M 0512"
            }"#,
        );

        let report = client.get_settings().unwrap();
        assert!(report.clock.is_ok());
        assert!(report.is_partial());
        assert!(
            report
                .error_summary()
                .unwrap()
                .contains("sunrise duration")
        );
    }

    #[test]
    fn upload_blocks_commands() {
        let (mut client, transport) = client();
        let session = client.begin_upload(1000).unwrap();
        assert!(client.is_busy());

        let err = client.set_brightness(100).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Issue(IssueError::CommandInProgress {
                current: UPLOAD_SLOT
            })
        ));
        assert!(transport.sent.lock().unwrap().is_empty());

        // A second upload is rejected as well.
        assert!(matches!(client.begin_upload(1), Err(UploadError::Busy)));

        // Once the session resolves, the client is free again.
        session.lock().unwrap().fail();
        assert_eq!(session.lock().unwrap().state(), UploadState::Failed);
        transport.push_message("DONE");
        client.set_brightness(100).unwrap();
    }

    #[test]
    fn command_blocks_upload() {
        let (mut client, transport) = client();
        // Leave a command in flight by scripting no response yet.
        transport.push_message("line");
        let _ = client.dispatcher.issue(&Command::Reboot);
        assert!(client.dispatcher.is_busy());

        assert!(matches!(client.begin_upload(1), Err(UploadError::Busy)));
    }

    #[test]
    fn stream_logs_round_trip() {
        let (mut client, transport) = client();
        transport.push_message("boot: wifi up\n");
        transport.push_message("alarm armed\n");

        let mut chunks = Vec::new();
        client
            .stream_logs(&mut |chunk: &str| {
                chunks.push(chunk.to_string());
                chunks.len() < 2
            })
            .unwrap();

        assert_eq!(chunks, vec!["boot: wifi up\n", "alarm armed\n"]);
        assert_eq!(
            transport.sent.lock().unwrap().clone(),
            vec!["start_reading_logs", "stop_reading_logs"]
        );
        assert!(!client.is_busy());
    }

    #[test]
    fn stream_logs_rejected_while_command_in_flight() {
        let (mut client, transport) = client();
        client.dispatcher.issue(&Command::Reboot).unwrap();

        let err = client.stream_logs(&mut |_| true).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Issue(IssueError::CommandInProgress { .. })
        ));
        // Only the reboot command went on the wire, no log start.
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_logs_reports_disconnect() {
        let (mut client, transport) = client();
        transport.push_message("one line\n");
        transport.push_closed();

        let err = client.stream_logs(&mut |_| true).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Failed(CommandFailure::TransportClosed)
        ));
    }

    #[test]
    fn esp_maintenance_without_endpoint_is_rejected() {
        let (client, _) = client();
        assert!(matches!(
            client.reboot_esp(),
            Err(UploadError::NotConfigured)
        ));
        assert!(matches!(
            client.reset_wifi_settings(),
            Err(UploadError::NotConfigured)
        ));
    }

    #[test]
    fn upload_without_endpoint_is_rejected() {
        let (mut client, _) = client();
        let err = client
            .upload_firmware(std::io::Cursor::new(vec![0u8; 4]), 4, None)
            .unwrap_err();
        assert!(matches!(err, UploadError::NotConfigured));
        assert!(!client.is_busy());
    }

    #[test]
    fn raw_message_while_idle_is_ignored_on_next_command() {
        let (mut client, transport) = client();
        // A stale line arrives before the response; the dispatcher logs the
        // violation for the idle case, and here the line simply resolves the
        // next single-response command.
        transport.push_message("DONE");
        client.set_sunrise_duration(30).unwrap();
        assert_eq!(
            transport.sent.lock().unwrap().clone(),
            vec![format!("{} 0030", idents::SET_SUNRISE_DURATION)]
        );
    }
}
