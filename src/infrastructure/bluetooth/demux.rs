//! Event Demultiplexer
//!
//! Routes each transport event to the pending operation, subscription or
//! table it concerns. Events with nothing waiting for them are logged and
//! dropped; that is how late results after a timeout are discarded.

use crate::domain::error::{BleError, TransportError};
use crate::domain::models::{
    Characteristic, CoordinatorNotification, Peripheral, PeripheralId, PeripheralState, Service,
    SubscriptionEvent,
};
use crate::infrastructure::bluetooth::registry::{run_deferred, Deferred, OpKey, OpKind, Outcome};
use crate::infrastructure::bluetooth::service::Inner;
use crate::infrastructure::bluetooth::transport::TransportEvent;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Feeds transport events to the coordinator until either side goes away.
pub(crate) async fn pump_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event);
    }
    debug!("Transport event pump stopped");
}

impl Inner {
    pub(crate) fn dispatch(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::AdapterStateChanged { powered } => self.on_adapter_state(powered),
            TransportEvent::ScanFailed { error } => {
                warn!("Scan failed: {}", error);
                self.end_scan(None);
            }
            TransportEvent::Discovered {
                peripheral,
                name,
                rssi,
            } => self.on_discovered(&peripheral, name, rssi),
            TransportEvent::Connected { peripheral } => self.on_connected(&peripheral),
            TransportEvent::ConnectFailed { peripheral, error } => {
                self.on_connect_failed(&peripheral, error)
            }
            TransportEvent::Disconnected { peripheral, error } => {
                if self.take_abandoned(&peripheral) {
                    debug!("Abandoned link to {} is down", peripheral);
                } else {
                    self.on_disconnected(&peripheral, error)
                }
            }
            TransportEvent::Enumerated {
                peripheral,
                services,
                characteristics,
            } => self.on_enumerated(&peripheral, services, characteristics),
            TransportEvent::EnumerationFailed { peripheral, error } => {
                self.on_enumeration_failed(&peripheral, error)
            }
            TransportEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
            } => self.on_value(&peripheral, characteristic, value),
            TransportEvent::WriteAcknowledged {
                peripheral,
                characteristic,
                error,
            } => self.on_write_ack(&peripheral, characteristic, error),
            TransportEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                active,
                error,
            } => self.on_notify_state(&peripheral, characteristic, active, error),
        }
    }

    fn on_adapter_state(self: &Arc<Self>, powered: bool) {
        let linked = {
            let mut state = self.state();
            if state.enabled == powered {
                return;
            }
            state.enabled = powered;
            // A powered-off radio reports nothing more for these
            state.abandoning.clear();
            state.tables.linked_ids()
        };

        if powered {
            info!("Adapter powered on");
            return;
        }

        warn!("Adapter powered off; dropping {} link(s)", linked.len());
        self.end_scan(None);
        for id in linked {
            self.on_disconnected(&id, Some(TransportError::new("adapter powered off")));
        }
    }

    fn on_discovered(&self, id: &PeripheralId, name: Option<String>, rssi: i16) {
        let refresh = {
            let mut state = self.state();
            state.tables.upsert_discovery(id, name, rssi, Instant::now());
            state.scan_refresh()
        };
        if let Some(refresh) = refresh {
            refresh();
        }
    }

    fn on_connected(self: &Arc<Self>, id: &PeripheralId) {
        let connect_key = OpKey::link(id, OpKind::Connect);
        let enumerate_key = OpKey::link(id, OpKind::Enumerate);
        let token = {
            let mut guard = self.state();
            let state = &mut *guard;
            if !state.registry.contains(&connect_key) {
                debug!("Discarding late connect for {}", id);
                return;
            }
            // Anything queued for an earlier teardown has been delivered
            state.abandoning.remove(id);
            if !state.tables.mark_connected(id) {
                // The pending connect still resolves through its timer
                warn!("Connect event for {} in an unexpected state", id);
                return;
            }
            if let Some(peripheral) = state.tables.get_mut(id) {
                peripheral.set_state(PeripheralState::Enumerating);
            }
            let Some(token) = state.registry.rekey(&connect_key, enumerate_key.clone()) else {
                warn!("Enumeration for {} already pending", id);
                return;
            };
            let timer = self.schedule_expiry(enumerate_key.clone(), token, self.settings.enumerate_timeout());
            state.registry.arm(&enumerate_key, token, timer);
            token
        };

        info!("Connected to {}; discovering services", id);
        if let Err(e) = self.transport.discover(id) {
            self.fail_pending(&enumerate_key, token, BleError::TransportRejected(e));
        }
    }

    fn on_connect_failed(&self, id: &PeripheralId, error: TransportError) {
        let deferred = {
            let mut state = self.state();
            let Some(completion) = state.registry.resolve(&OpKey::link(id, OpKind::Connect)) else {
                debug!("Discarding late connect failure for {}: {}", id, error);
                return;
            };
            if let Some(peripheral) = state.tables.get_mut(id) {
                peripheral.set_state(PeripheralState::Unknown);
            }
            completion.fail(BleError::TransportRejected(error.clone()))
        };
        warn!("Connection to {} failed: {}", id, error);
        deferred();
    }

    /// Tears down everything tied to the link, then publishes the disconnect
    /// and finally resolves a requested disconnect.
    pub(crate) fn on_disconnected(&self, id: &PeripheralId, error: Option<TransportError>) {
        let mut deferred: Vec<Deferred> = Vec::new();
        {
            let mut state = self.state();
            let was_connected = state.tables.drop_connection(id);
            let mut pending = state.registry.drain_peripheral(id);
            let requested = pending
                .iter()
                .position(|(key, _)| key.kind == OpKind::Disconnect)
                .map(|index| pending.swap_remove(index).1);
            let subscriptions = state.take_subscriptions(Some(id));

            if !was_connected && pending.is_empty() && requested.is_none() && subscriptions.is_empty() {
                debug!("Ignoring disconnect for idle peripheral {}", id);
                return;
            }

            let acknowledging: Vec<Uuid> = pending
                .iter()
                .filter(|(key, _)| key.kind == OpKind::Subscribe)
                .filter_map(|(key, _)| key.characteristic)
                .collect();
            for (_, completion) in pending {
                deferred.push(completion.fail(BleError::PeripheralDisconnected));
            }
            for ((_, uuid), handler) in subscriptions {
                if !acknowledging.contains(&uuid) {
                    deferred.push(Box::new(move || handler(Err(BleError::PeripheralDisconnected))));
                }
            }

            let snapshot = state
                .tables
                .get(id)
                .cloned()
                .unwrap_or_else(|| Peripheral::new(id.clone(), Instant::now()));
            deferred.push(self.publish(CoordinatorNotification::Disconnected(snapshot.clone())));
            if let Some(completion) = requested {
                deferred.push(completion.finish(Ok(Outcome::Peripheral(snapshot))));
            }
        }

        match &error {
            Some(e) => warn!("{} disconnected: {}", id, e),
            None => info!("{} disconnected", id),
        }
        run_deferred(deferred);
    }

    fn on_enumerated(&self, id: &PeripheralId, services: Vec<Service>, characteristics: Vec<Characteristic>) {
        let deferred = {
            let mut state = self.state();
            let Some(completion) = state.registry.resolve(&OpKey::link(id, OpKind::Enumerate)) else {
                debug!("Discarding late enumeration for {}", id);
                return;
            };
            match state.tables.get_mut(id) {
                Some(peripheral) => {
                    peripheral.set_attributes(services, characteristics);
                    peripheral.set_state(PeripheralState::Enumerated);
                    info!(
                        "Enumerated {}: {} service(s), {} characteristic(s)",
                        id,
                        peripheral.services().len(),
                        peripheral.characteristics().len()
                    );
                    completion.finish(Ok(Outcome::Peripheral(peripheral.clone())))
                }
                None => completion.fail(BleError::PeripheralDisconnected),
            }
        };
        deferred();
    }

    fn on_enumeration_failed(&self, id: &PeripheralId, error: TransportError) {
        let key = OpKey::link(id, OpKind::Enumerate);
        let deferred = {
            let mut state = self.state();
            let Some(completion) = state.registry.resolve(&key) else {
                debug!("Discarding late enumeration failure for {}: {}", id, error);
                return;
            };
            state.unwind(&key);
            completion.fail(BleError::EnumerateTimeout)
        };
        warn!("Enumeration of {} failed: {}", id, error);
        deferred();
    }

    fn on_value(&self, id: &PeripheralId, characteristic: Uuid, value: Result<Vec<u8>, TransportError>) {
        let deferred: Deferred = {
            let mut state = self.state();
            let read_key = OpKey::attribute(id, OpKind::Read, characteristic);
            if let Some(completion) = state.registry.resolve(&read_key) {
                completion.finish(value.map(Outcome::Value).map_err(BleError::from))
            } else if let Some(handler) = state.subscriptions.get(&(id.clone(), characteristic)).cloned() {
                let event = value
                    .map(SubscriptionEvent::Value)
                    .map_err(BleError::from);
                Box::new(move || handler(event))
            } else {
                debug!("Unsolicited value for {} on {}", characteristic, id);
                return;
            }
        };
        deferred();
    }

    fn on_write_ack(&self, id: &PeripheralId, characteristic: Uuid, error: Option<TransportError>) {
        let deferred = {
            let mut state = self.state();
            let key = OpKey::attribute(id, OpKind::Write, characteristic);
            let Some(completion) = state.registry.resolve(&key) else {
                debug!("Discarding late write acknowledgement for {} on {}", characteristic, id);
                return;
            };
            completion.finish(match error {
                None => Ok(Outcome::Done),
                Some(e) => Err(e.into()),
            })
        };
        deferred();
    }

    fn on_notify_state(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        active: bool,
        error: Option<TransportError>,
    ) {
        let key = OpKey::attribute(id, OpKind::Subscribe, characteristic);
        let deferred = {
            let mut state = self.state();
            let Some(completion) = state.registry.resolve(&key) else {
                debug!(
                    "Notify state for {} on {} is now {} (unsolicited)",
                    characteristic, id, active
                );
                return;
            };
            match (active, error) {
                (true, None) => completion.finish(Ok(Outcome::Done)),
                (_, error) => {
                    state.unwind(&key);
                    let error = error.unwrap_or_else(|| TransportError::new("notifications were not enabled"));
                    warn!("Subscribe to {} on {} failed: {}", characteristic, id, error);
                    completion.fail(BleError::TransportRejected(error))
                }
            }
        };
        deferred();
    }
}
