#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

/// A high level client for the lamp's control channel and firmware upload path
pub mod client;
pub use client::LampClient;

/// Typed command requests and their wire encodings
pub mod commands;

/// The single-outstanding-command dispatch state machine
pub mod dispatcher;

/// The command table: response policy and decoder per wire identifier
pub mod registry;

/// Device setting types and their fixed-offset wire codecs
pub mod settings;

/// The persistent message channel to the device
pub mod transport;

/// Bulk firmware upload over HTTP
pub mod upload;
