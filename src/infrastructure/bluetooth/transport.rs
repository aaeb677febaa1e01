//! Transport Boundary
//!
//! The coordinator drives a wireless stack it does not control. Requests go
//! out through [`Transport`]; everything the stack reports back comes in as a
//! [`TransportEvent`] on an unbounded channel, at whatever time the stack
//! decides.

use crate::domain::error::TransportError;
use crate::domain::models::{Characteristic, PeripheralId, Service};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where a transport posts its events.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Outbound half of the wireless stack.
///
/// Every method must return promptly: the outcome of the request is reported
/// later as a [`TransportEvent`]. An `Err` means the request was not even
/// started, and no event will follow for it.
pub trait Transport: Send + Sync {
    /// Start scanning, restricted to `services` (empty = all).
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Tear down the link, or abandon an in-flight connection attempt.
    /// Either way exactly one `Disconnected` follows an `Ok`.
    fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Discover services and their characteristics.
    fn discover(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError>;

    fn write_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;
}

/// Inbound half of the wireless stack.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Radio powered on or off.
    AdapterStateChanged { powered: bool },
    /// A requested scan could not be started or was cut short.
    ScanFailed { error: TransportError },
    Discovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: i16,
    },
    Connected {
        peripheral: PeripheralId,
    },
    ConnectFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },
    /// Solicited or not.
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    Enumerated {
        peripheral: PeripheralId,
        services: Vec<Service>,
        characteristics: Vec<Characteristic>,
    },
    EnumerationFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },
    /// A read response or a notification; the stack does not distinguish.
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Result<Vec<u8>, TransportError>,
    },
    WriteAcknowledged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        error: Option<TransportError>,
    },
    NotifyStateChanged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        active: bool,
        error: Option<TransportError>,
    },
}
