// This is part of async-nilan-nabto.rs.
// Copyright (c) 2020, Daniel Wippermann.
// See README.md and LICENSE.txt for details.

//! # async-nilan-nabto.rs
//!
//! A Rust library for talking to Nilan / Genvex ventilation controllers
//! over their Nabto UDP protocol asynchronously.
//!
//!
//! ## Features
//!
//! - Allows discovery of controllers in a local network or through a relay
//! - Connect to a discovered or manually addressed controller
//! - Read live datapoints and setpoints including their device reported bounds
//! - Write setpoints with readback verification
//! - Probe and setpoint write procedures producing serializable reports
//!
//!
//! ## Planned, but not yet implemented features
//!
//! - Encrypted sessions through the vendor cloud
//!
//!
//! ## Examples
//!
//! ```no_run
//! use async_nilan_nabto::{run_probe, ClientConfig, GatewayConfig};
//!
//! fn main() {
//!     async_std::task::block_on(async {
//!         // Discover and connect to the first controller found
//!         let gateway = GatewayConfig::new("me@example.com");
//!
//!         let report = run_probe(&gateway, &ClientConfig::default()).await;
//!
//!         match &report.connection_error {
//!             None => {
//!                 for (key, value) in report.datapoints.iter() {
//!                     println!("{} = {}", key, value);
//!                 }
//!             }
//!             Some(code) => println!("Probe failed: {}", code),
//!         }
//!     })
//! }
//! ```

#![warn(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::float_cmp)]

mod error;
pub use error::{DecodeError, Error, Result, TransportError, TransportErrorKind};

mod keys;
pub use keys::{DatapointKey, Key, KeyInfo, SetpointKey, SetpointRange, Unit};

pub mod codec;
pub use codec::DiscoveredDevice;

mod config;
pub use config::{AuthSettings, ClientConfig, GatewayConfig, GatewaySettings, Overrides, Settings};

mod transport;
pub use transport::{Link, Transport};

mod session;
pub use session::{
    select_target, ConnectionStatus, Phase, Session, SessionEvent, SetpointState, Target,
};

mod client;
pub use client::DeviceClient;

mod probe;
pub use probe::{run_probe, run_setpoint_write, ProbeReport, SelectedDevice, SetpointReport};

mod gateway;
pub use gateway::{Gateway, GatewayRegistry, SetpointCall};

#[cfg(test)]
mod test_utils;
