use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Stable identity of a peripheral as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection lifecycle of a peripheral.
///
/// ```text
/// Unknown -> Connecting -> Connected -> Enumerating -> Enumerated
///    ^           |            ^              |
///    |           |            +--------------+ (enumeration failed)
///    +-----------+--- any state on disconnect
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeripheralState {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Enumerating,
    Enumerated,
}

impl PeripheralState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use PeripheralState::*;
        matches!(
            (self, next),
            (_, Unknown)
                | (Unknown, Connecting)
                | (Connecting, Connected)
                | (Connected, Enumerating)
                | (Enumerating, Enumerated)
                | (Enumerating, Connected)
        )
    }

    /// Services and characteristics are only meaningful in these states.
    fn holds_attributes(self) -> bool {
        matches!(self, Self::Enumerating | Self::Enumerated)
    }
}

/// A GATT service handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Service {
    pub uuid: Uuid,
    pub is_primary: bool,
}

/// What a characteristic allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A GATT characteristic handle discovered during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// One discovered device.
///
/// Callers only ever see clones; the coordinator owns the live records.
#[derive(Debug, Clone)]
pub struct Peripheral {
    id: PeripheralId,
    name: Option<String>,
    rssi: i16,
    last_seen: Instant,
    state: PeripheralState,
    services: Vec<Service>,
    characteristics: Vec<Characteristic>,
}

impl Peripheral {
    pub(crate) fn new(id: PeripheralId, now: Instant) -> Self {
        Self {
            id,
            name: None,
            rssi: 0,
            last_seen: now,
            state: PeripheralState::Unknown,
            services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// First discovered characteristic with the given UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    /// The discovered record matching a caller-supplied handle.
    pub(crate) fn discovered(&self, characteristic: &Characteristic) -> Option<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
    }

    pub(crate) fn refresh(&mut self, name: Option<String>, rssi: i16, now: Instant) {
        if name.is_some() {
            self.name = name;
        }
        self.rssi = rssi;
        self.last_seen = now;
    }

    /// Moves along the state graph. Invalid moves are refused and logged.
    pub(crate) fn set_state(&mut self, next: PeripheralState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Refusing state change {:?} -> {:?} for {}",
                self.state, next, self.id
            );
            return false;
        }
        self.state = next;
        if !next.holds_attributes() {
            self.services.clear();
            self.characteristics.clear();
        }
        true
    }

    pub(crate) fn set_attributes(
        &mut self,
        services: Vec<Service>,
        characteristics: Vec<Characteristic>,
    ) {
        if self.state.holds_attributes() {
            self.services = services;
            self.characteristics = characteristics;
        }
    }
}

/// Delivered to a subscription's standing callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The transport confirmed notifications are on. Delivered once.
    Active,
    /// A value-changed notification.
    Value(Vec<u8>),
}

/// Broadcast to every registered observer.
#[derive(Debug, Clone)]
pub enum CoordinatorNotification {
    Disconnected(Peripheral),
    ScanStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic() -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(0x2a19),
            service_uuid: Uuid::from_u128(0x180f),
            properties: CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn state_graph() {
        use PeripheralState::*;
        assert!(Unknown.can_transition_to(Connecting));
        assert!(Enumerating.can_transition_to(Connected));
        assert!(Enumerated.can_transition_to(Unknown));
        assert!(!Unknown.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Enumerating));
        assert!(!Enumerated.can_transition_to(Connecting));
    }

    #[tokio::test]
    async fn attributes_only_held_while_enumerating() {
        let mut p = Peripheral::new("p".into(), Instant::now());
        p.set_attributes(Vec::new(), vec![characteristic()]);
        assert!(p.characteristics().is_empty());

        assert!(p.set_state(PeripheralState::Connecting));
        assert!(p.set_state(PeripheralState::Connected));
        assert!(p.set_state(PeripheralState::Enumerating));
        p.set_attributes(Vec::new(), vec![characteristic()]);
        assert!(p.set_state(PeripheralState::Enumerated));
        assert!(p.characteristic(Uuid::from_u128(0x2a19)).is_some());

        assert!(p.set_state(PeripheralState::Unknown));
        assert!(p.characteristics().is_empty());
    }

    #[tokio::test]
    async fn invalid_transition_keeps_state() {
        let mut p = Peripheral::new("p".into(), Instant::now());
        assert!(!p.set_state(PeripheralState::Enumerated));
        assert_eq!(p.state(), PeripheralState::Unknown);
    }

    #[tokio::test]
    async fn refresh_keeps_name_when_absent() {
        let mut p = Peripheral::new("p".into(), Instant::now());
        p.refresh(Some("Sensor".into()), -40, Instant::now());
        p.refresh(None, -55, Instant::now());
        assert_eq!(p.name(), Some("Sensor"));
        assert_eq!(p.rssi(), -55);
    }
}
