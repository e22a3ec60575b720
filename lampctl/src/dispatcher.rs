use std::time::Instant;

use miette::Diagnostic;
use thiserror::Error;

use crate::{
    commands::Command,
    registry::{
        CommandRegistry, DONE_LITERAL, ERROR_MARKER, ResponseDecoder, ResponsePayload,
        ResponsePolicy,
    },
    settings::DecodeError,
    transport::{ChannelTransport, SendError},
};

/// The command currently awaiting resolution.
///
/// At most one of these exists at any time; it is the busy-state token of
/// the whole channel.
#[derive(Debug, Clone, Copy)]
pub struct InFlightCommand {
    /// The wire identifier of the command
    pub identifier: &'static str,
    /// The response arity policy the command was issued under
    pub policy: ResponsePolicy,
    /// When the command was sent
    pub issued_at: Instant,
    decoder: Option<ResponseDecoder>,
}

/// Reasons a command cannot be issued.
#[derive(Error, Debug, Diagnostic)]
pub enum IssueError {
    /// Another command is still awaiting its terminal response.
    ///
    /// Nothing was sent; the caller retries once the current command
    /// resolves.
    #[error("command '{current}' is still in progress")]
    #[diagnostic(code(lampctl::dispatcher::busy))]
    CommandInProgress {
        /// The identifier of the in-flight command
        current: &'static str,
    },
    /// The identifier is not in the command registry.
    #[error("unknown command '{identifier}'")]
    #[diagnostic(code(lampctl::dispatcher::unknown))]
    UnknownCommand {
        /// The identifier that was looked up
        identifier: String,
    },
    /// Sending on the channel failed. No command was installed.
    #[error("sending failed")]
    #[diagnostic(code(lampctl::dispatcher::send))]
    Send(#[from] SendError),
}

/// An inbound message arrived while no command was in flight.
///
/// This is a protocol violation by the device (or a stale message from a
/// previous connection); it is reported so callers can log it, but it is
/// not fatal and leaves the dispatcher untouched.
#[derive(Error, Debug, Diagnostic)]
#[error("received '{message}' with no command in flight")]
#[diagnostic(code(lampctl::dispatcher::protocol_violation))]
pub struct ProtocolViolation {
    /// The unexpected message
    pub message: String,
}

/// Why a command reached the `Failed` terminal state.
#[derive(Error, Debug, Diagnostic)]
pub enum CommandFailure {
    /// The device responded with an error message, reproduced verbatim.
    #[error("{0}")]
    #[diagnostic(code(lampctl::dispatcher::device_error))]
    DeviceReported(String),
    /// The connection dropped while the command was in flight.
    #[error("connection to the device was lost")]
    #[diagnostic(code(lampctl::dispatcher::transport_closed))]
    TransportClosed,
    /// The terminal response could not be decoded.
    #[error(transparent)]
    #[diagnostic(code(lampctl::dispatcher::malformed))]
    MalformedResponse(#[from] DecodeError),
}

/// The terminal result of a command.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The command finished successfully.
    Succeeded {
        /// The wire identifier of the finished command
        identifier: &'static str,
        /// The decoded terminal payload
        payload: ResponsePayload,
    },
    /// The command failed.
    Failed {
        /// The wire identifier of the failed command
        identifier: &'static str,
        /// The reason
        failure: CommandFailure,
    },
}

/// What an inbound message meant for the in-flight command.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A non-terminal status line of a multi-response command.
    ///
    /// The command stays in flight.
    Progress {
        /// The wire identifier of the in-flight command
        identifier: &'static str,
        /// The status line, verbatim
        line: String,
    },
    /// The command reached a terminal state and was cleared.
    Terminal(CommandOutcome),
}

/// Routes inbound messages to the single in-flight command.
///
/// All state transitions happen on delivery of discrete external events
/// (a caller issues a command, the transport delivers a message or reports
/// disconnect) and none of them block. The dispatcher performs no retries
/// and enforces no timeout; a command that never receives a terminal
/// response keeps the channel busy until the connection drops.
pub struct Dispatcher {
    registry: CommandRegistry,
    transport: Box<dyn ChannelTransport + Send>,
    in_flight: Option<InFlightCommand>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given transport with the standard
    /// command registry.
    pub fn new<T: ChannelTransport + Send + 'static>(transport: T) -> Self {
        Self::with_registry(transport, CommandRegistry::standard())
    }

    /// Creates a dispatcher with a custom command registry.
    pub fn with_registry<T: ChannelTransport + Send + 'static>(
        transport: T,
        registry: CommandRegistry,
    ) -> Self {
        Self {
            registry,
            transport: Box::new(transport),
            in_flight: None,
        }
    }

    /// The command currently in flight, if any.
    pub fn in_flight(&self) -> Option<&InFlightCommand> {
        self.in_flight.as_ref()
    }

    /// Whether a command is awaiting its terminal response.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The command registry.
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Mutable access to the command registry, for registering additional
    /// device commands.
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    /// Mutable access to the underlying transport, for event polling.
    pub fn transport_mut(&mut self) -> &mut (dyn ChannelTransport + Send) {
        self.transport.as_mut()
    }

    /// Encodes and sends a command, installing it as the in-flight command.
    pub fn issue(&mut self, command: &Command) -> Result<(), IssueError> {
        self.issue_raw(command.identifier(), command.encode_args().as_deref())
    }

    /// Sends a command by identifier with pre-encoded arguments.
    ///
    /// Rejected without sending anything while another command is in
    /// flight. A send failure also leaves no command installed.
    pub fn issue_raw(&mut self, identifier: &str, args: Option<&str>) -> Result<(), IssueError> {
        if let Some(current) = &self.in_flight {
            return Err(IssueError::CommandInProgress {
                current: current.identifier,
            });
        }

        let spec = self
            .registry
            .get(identifier)
            .ok_or_else(|| IssueError::UnknownCommand {
                identifier: identifier.to_string(),
            })?;
        let (identifier, policy, decoder) = (spec.identifier, spec.policy, spec.decoder);

        let line = match args {
            Some(args) => format!("{identifier} {args}"),
            None => identifier.to_string(),
        };

        log::debug!("TX: {line}");
        self.transport.send_text(&line)?;

        self.in_flight = Some(InFlightCommand {
            identifier,
            policy,
            issued_at: Instant::now(),
            decoder,
        });

        Ok(())
    }

    /// Routes an inbound message against the in-flight command's policy.
    ///
    /// Messages are decoded as text lossily; the device may emit
    /// non-printable bytes through the same channel.
    pub fn handle_message(&mut self, raw: &[u8]) -> Result<DispatchEvent, ProtocolViolation> {
        let text = String::from_utf8_lossy(raw).into_owned();
        log::debug!("RX: {text}");

        let Some(command) = self.in_flight else {
            return Err(ProtocolViolation { message: text });
        };

        match command.policy {
            ResponsePolicy::SingleResponse => {
                // The one message is terminal, whatever it contains.
                self.in_flight = None;
                Ok(DispatchEvent::Terminal(resolve_single(&command, text)))
            }
            ResponsePolicy::StreamUntilTerminal => {
                if text.starts_with(ERROR_MARKER) {
                    self.in_flight = None;
                    Ok(DispatchEvent::Terminal(CommandOutcome::Failed {
                        identifier: command.identifier,
                        failure: CommandFailure::DeviceReported(text),
                    }))
                } else if text == DONE_LITERAL {
                    self.in_flight = None;
                    Ok(DispatchEvent::Terminal(CommandOutcome::Succeeded {
                        identifier: command.identifier,
                        payload: ResponsePayload::Text(text),
                    }))
                } else {
                    Ok(DispatchEvent::Progress {
                        identifier: command.identifier,
                        line: text,
                    })
                }
            }
        }
    }

    /// Force-clears the in-flight command after a connection loss.
    ///
    /// Returns the terminal failure exactly once; repeated calls (or a
    /// disconnect racing a terminal response) return `None` so the failure
    /// is never emitted twice.
    pub fn handle_disconnect(&mut self) -> Option<CommandOutcome> {
        let command = self.in_flight.take()?;
        log::warn!(
            "channel closed with '{}' in flight after {:?}",
            command.identifier,
            command.issued_at.elapsed()
        );
        Some(CommandOutcome::Failed {
            identifier: command.identifier,
            failure: CommandFailure::TransportClosed,
        })
    }
}

fn resolve_single(command: &InFlightCommand, text: String) -> CommandOutcome {
    if text.starts_with(ERROR_MARKER) {
        return CommandOutcome::Failed {
            identifier: command.identifier,
            failure: CommandFailure::DeviceReported(text),
        };
    }

    match command.decoder {
        Some(decoder) => match decoder(&text) {
            Ok(payload) => CommandOutcome::Succeeded {
                identifier: command.identifier,
                payload,
            },
            Err(failure) => CommandOutcome::Failed {
                identifier: command.identifier,
                failure,
            },
        },
        None => CommandOutcome::Succeeded {
            identifier: command.identifier,
            payload: ResponsePayload::Text(text),
        },
    }
}
