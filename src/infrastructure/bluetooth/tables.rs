//! Discovery and connection tables.
//!
//! The discovery table owns every `Peripheral` record. The connected table is
//! the subset of identities whose link is up; its records are the same ones,
//! so a state change is visible through both views at once.

use crate::domain::models::{Peripheral, PeripheralId, PeripheralState};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub(crate) struct PeripheralTables {
    discovered: HashMap<PeripheralId, Peripheral>,
    connected: HashSet<PeripheralId>,
}

impl PeripheralTables {
    /// Scan path: refreshes signal strength and last-seen, keeps state.
    pub(crate) fn upsert_discovery(
        &mut self,
        id: &PeripheralId,
        name: Option<String>,
        rssi: i16,
        now: Instant,
    ) {
        self.discovered
            .entry(id.clone())
            .or_insert_with(|| Peripheral::new(id.clone(), now))
            .refresh(name, rssi, now);
    }

    /// Connect path: a peripheral may be connected without ever being seen
    /// by a scan.
    pub(crate) fn get_or_insert(&mut self, id: &PeripheralId, now: Instant) -> &mut Peripheral {
        self.discovered
            .entry(id.clone())
            .or_insert_with(|| Peripheral::new(id.clone(), now))
    }

    pub(crate) fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.discovered.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &PeripheralId) -> Option<&mut Peripheral> {
        self.discovered.get_mut(id)
    }

    pub(crate) fn is_connected(&self, id: &PeripheralId) -> bool {
        self.connected.contains(id)
    }

    /// Moves a `Connecting` peripheral into the connected table.
    pub(crate) fn mark_connected(&mut self, id: &PeripheralId) -> bool {
        let Some(peripheral) = self.discovered.get_mut(id) else {
            return false;
        };
        if !peripheral.set_state(PeripheralState::Connected) {
            return false;
        }
        self.connected.insert(id.clone());
        true
    }

    /// Resets to `Unknown` and leaves the connected table in one step.
    /// Returns whether the peripheral was connected.
    pub(crate) fn drop_connection(&mut self, id: &PeripheralId) -> bool {
        if let Some(peripheral) = self.discovered.get_mut(id) {
            peripheral.set_state(PeripheralState::Unknown);
        }
        self.connected.remove(id)
    }

    /// Peripherals with a link or a link attempt in flight.
    pub(crate) fn linked_ids(&self) -> Vec<PeripheralId> {
        self.discovered
            .values()
            .filter(|p| p.state() != PeripheralState::Unknown || self.connected.contains(p.id()))
            .map(|p| p.id().clone())
            .collect()
    }

    pub(crate) fn any_in_state(&self, state: PeripheralState) -> bool {
        self.discovered.values().any(|p| p.state() == state)
    }

    /// Removes idle discoveries not seen for longer than `absence`.
    /// Peripherals with a link (or a link attempt) are never pruned.
    pub(crate) fn sweep(&mut self, now: Instant, absence: Duration) -> Vec<PeripheralId> {
        let stale: Vec<PeripheralId> = self
            .discovered
            .values()
            .filter(|p| {
                p.state() == PeripheralState::Unknown
                    && !self.connected.contains(p.id())
                    && now.saturating_duration_since(p.last_seen()) > absence
            })
            .map(|p| p.id().clone())
            .collect();
        for id in &stale {
            self.discovered.remove(id);
        }
        stale
    }

    pub(crate) fn discovered_snapshot(&self) -> HashMap<PeripheralId, Peripheral> {
        self.discovered.clone()
    }

    pub(crate) fn connected_snapshot(&self) -> HashMap<PeripheralId, Peripheral> {
        self.connected
            .iter()
            .filter_map(|id| self.discovered.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.discovered.clear();
        self.connected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rediscovery_updates_in_place() {
        let mut tables = PeripheralTables::default();
        let a = PeripheralId::new("A");
        tables.upsert_discovery(&a, None, -40, Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        tables.upsert_discovery(&a, Some("Thermo".into()), -52, Instant::now());

        let snapshot = tables.discovered_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&a].rssi(), -52);
        assert_eq!(snapshot[&a].name(), Some("Thermo"));
    }

    #[tokio::test(start_paused = true)]
    async fn rediscovery_preserves_connection_state() {
        let mut tables = PeripheralTables::default();
        let a = PeripheralId::new("A");
        tables.get_or_insert(&a, Instant::now()).set_state(PeripheralState::Connecting);
        assert!(tables.mark_connected(&a));

        tables.upsert_discovery(&a, None, -60, Instant::now());
        assert_eq!(tables.get(&a).unwrap().state(), PeripheralState::Connected);
        assert_eq!(tables.connected_snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_prunes_only_stale_idle_entries() {
        let mut tables = PeripheralTables::default();
        let a = PeripheralId::new("A");
        let b = PeripheralId::new("B");
        let c = PeripheralId::new("C");
        tables.upsert_discovery(&a, None, -40, Instant::now());
        tables.upsert_discovery(&b, None, -70, Instant::now());
        tables.upsert_discovery(&c, None, -80, Instant::now());
        tables.get_or_insert(&c, Instant::now()).set_state(PeripheralState::Connecting);

        tokio::time::advance(Duration::from_secs(5)).await;
        tables.upsert_discovery(&a, None, -41, Instant::now());

        let removed = tables.sweep(Instant::now(), Duration::from_secs(3));
        assert_eq!(removed, vec![b.clone()]);
        assert!(tables.get(&a).is_some());
        assert!(tables.get(&b).is_none());
        assert!(tables.get(&c).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_connection_resets_state() {
        let mut tables = PeripheralTables::default();
        let a = PeripheralId::new("A");
        tables.get_or_insert(&a, Instant::now()).set_state(PeripheralState::Connecting);
        tables.mark_connected(&a);

        assert!(tables.drop_connection(&a));
        assert!(!tables.is_connected(&a));
        assert_eq!(tables.get(&a).unwrap().state(), PeripheralState::Unknown);
        assert!(!tables.drop_connection(&a));
    }
}
