//! firewatchd - sensor ingestion, registry and monitor broadcast server
//!
//! This crate provides the daemon's building blocks:
//! - `registry` - sensor registry actor holding the latest reading per sensor
//! - `server` - TCP servers for sensors and monitors
//! - `handoff` - delta/snapshot views between ingestion and relay
//! - `monitors` - authenticated monitor endpoints
//! - `relay` - background task turning handoff views into monitor pushes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        firewatchd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐     │
//! │  │  SensorServer   │────▶│       RegistryActor         │     │
//! │  │     (TCP)       │     │   (sensor state owner)      │     │
//! │  └─────────────────┘     └──────────────┬──────────────┘     │
//! │                                         │ events             │
//! │                                         ▼                    │
//! │                          ┌─────────────────────────────┐     │
//! │                          │  HandoffSource              │     │
//! │                          │  (in-memory or file-backed) │     │
//! │                          └──────────────┬──────────────┘     │
//! │                                         │ delta / snapshot   │
//! │                                         ▼                    │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐     │
//! │  │  MonitorServer  │────▶│  relay + MonitorRegistry    │     │
//! │  │     (TCP)       │     │  (push to every monitor)    │     │
//! │  └─────────────────┘     └─────────────────────────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! In split mode the registry side and the relay side run in separate
//! processes joined by a handoff directory.

pub mod config;
pub mod dispatch;
pub mod handoff;
pub mod monitors;
pub mod registry;
pub mod relay;
pub mod server;
pub mod service;
