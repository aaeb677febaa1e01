//! Bluetooth Module
//!
//! Central-role BLE coordination over a pluggable transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Coordinator                         │
//! │  (public API - scan, connect, read, write, subscribe)    │
//! └──────┬──────────────────┬───────────────────┬───────────┘
//!        │ requests         │ bookkeeping       │ timers
//!        ▼                  ▼                   ▼
//! ┌────────────┐   ┌─────────────────┐   ┌─────────────┐
//! │ Transport  │   │ PeripheralTables│   │  Pending    │
//! │ (trait)    │   │ - discovery     │   │  Registry   │
//! │            │   │ - connected     │   │ - one slot  │
//! └─────┬──────┘   └────────▲────────┘   │   per op    │
//!       │ TransportEvent    │            └──────▲──────┘
//!       ▼                   │                   │
//! ┌─────────────────────────┴───────────────────┴───────┐
//! │                  Event demultiplexer                  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Outbound trait and inbound event type
//! - [`service`] - The coordinator
//! - [`registry`] - Pending operations and their single-use completions
//! - `tables` - Discovery and connected tables
//! - `demux` - Event routing
//! - `sweeper` - Periodic pruning of absent peripherals
//! - `bluest_transport` - [`Transport`] over the `bluest` crate (feature `bluest`)

#[cfg(feature = "bluest")]
pub mod bluest_transport;
mod demux;
pub mod registry;
pub mod service;
mod sweeper;
mod tables;
pub mod transport;

pub use registry::{OpKey, OpKind, SubscriptionHandler};
pub use service::{Coordinator, ScanHandler};
pub use transport::{EventSink, Transport, TransportEvent};

#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
