//! firewatch core - shared types for fire-sensor telemetry
//!
//! This crate provides the domain types shared between the daemon
//! (firewatchd), the wire protocol and the clients.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod reading;
pub mod secret;
pub mod validate;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use reading::{format_decimal, ReadingValues, SensorId, SensorReading};
pub use secret::SecretHash;
pub use validate::{validate, Finding, Parameter, Severity};
