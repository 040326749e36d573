#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dalyble_lib
//!
//! This crate reads telemetry from Daly BMS (Battery Management System) devices over Bluetooth LE
//! and keeps the latest reading available to other parts of a program or to other processes.
//!
//! The pieces build on each other:
//!
//! - [`protocol`]: builds the main info request frame and decodes the 129 byte response.
//! - [`session`]: one wireless connection, driven through the [`session::Transport`] trait.
//! - [`acquisition`]: the polling loop with its reconnection policy.
//! - [`cache`]: the latest snapshot and service status, optionally mirrored to JSON files.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `dalyble` command-line tool.
//! - `bluetooth`: Enables the `bluest` based [`session::Transport`] implementation.
//! - `bin-dependencies`: Enables all features required by the `dalyble` binary executable.

/// Contains error types for the library.
mod error;
/// Defines the communication protocol for Daly BMS.
pub mod protocol;
pub mod telemetry;
pub mod session;
pub mod cache;
pub mod acquisition;

pub use error::Error;

/// Bluetooth LE transport.
#[cfg_attr(docsrs, doc(cfg(feature = "bluetooth")))]
#[cfg(feature = "bluetooth")]
pub mod bluetooth;
