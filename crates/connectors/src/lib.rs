//! Connectors for external data sources.
//!
//! This crate provides source connectors that plug into the Sluice
//! operator API.
//!
//! ## Available Connectors
//!
//! - **Upstream** (enabled by default): recoverable, partitionable input
//!   operator that pulls offset-tagged events from an upstream event
//!   source over a persistent TCP connection, replaying from the last
//!   recovery point after restarts.
//!
//! ## Feature Flags
//!
//! - `upstream`: Enable the upstream connector (default)
//!
//! ## Example
//!
//! ```ignore
//! use sluice_api::prelude::*;
//! use sluice_connectors::upstream::{decode, UpstreamConfig, UpstreamInput};
//!
//! let config = UpstreamConfig::new("flume-sink-1:8080".parse()?);
//! let mut input = UpstreamInput::new(config, decode::utf8());
//! input.output.connect(|line: String| println!("{line}"));
//!
//! let mut driver = OperatorDriver::new(input, OperatorContext::new(1, "upstream"));
//! driver.setup()?;
//! driver.activate()?;
//! ```

#[cfg(feature = "upstream")]
pub mod upstream;
