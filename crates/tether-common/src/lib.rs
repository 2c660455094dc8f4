//! # tether-common
//!
//! Shared types for the Tether container endpoint engine.
//!
//! This crate provides:
//! - The common error type and step severity
//! - Engine configuration and well-known addressing defaults
//! - Hardware address parsing
//! - Endpoint IDs and veth name derivation

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod mac;

pub use config::{EngineConfig, OperatingMode, SnatConfig, WellKnownAddresses};
pub use error::{Severity, TetherError, TetherResult};
pub use id::EndpointId;
pub use mac::MacAddr;
