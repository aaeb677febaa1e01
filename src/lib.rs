//! Central-role Bluetooth Low Energy coordinator.
//!
//! Discovers peripherals, manages their connection lifecycle and performs
//! characteristic reads, writes and subscriptions over an asynchronous
//! [`Transport`]. Every accepted request resolves exactly once, by the
//! transport's answer or by a deadline.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{BleError, TransportError};
pub use domain::models::{
    Characteristic, CharacteristicProperties, CoordinatorNotification, Peripheral, PeripheralId,
    PeripheralState, Service, SubscriptionEvent,
};
pub use domain::settings::{
    CoordinatorSettings, LogFileSettings, LogRotation, LogSettings, Settings, SettingsService,
};
pub use infrastructure::bluetooth::{Coordinator, EventSink, Transport, TransportEvent};
