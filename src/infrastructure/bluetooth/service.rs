//! Coordinator
//!
//! Public API for scanning, connecting and characteristic I/O. Every request
//! is validated and registered under one lock, handed to the transport after
//! the lock is released, and later resolved exactly once by either the event
//! demultiplexer or a deadline timer.

use crate::domain::error::{BleError, TransportError};
use crate::domain::models::{
    Characteristic, CoordinatorNotification, Peripheral, PeripheralId, PeripheralState,
    SubscriptionEvent,
};
use crate::domain::settings::CoordinatorSettings;
use crate::infrastructure::bluetooth::demux;
use crate::infrastructure::bluetooth::registry::{
    run_deferred, Completion, Deferred, OpKey, OpKind, PendingRegistry, SubscriptionHandler,
};
use crate::infrastructure::bluetooth::sweeper;
use crate::infrastructure::bluetooth::tables::PeripheralTables;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multi-fire scan callback; receives the whole discovery table each time.
pub type ScanHandler = Arc<dyn Fn(&HashMap<PeripheralId, Peripheral>) + Send + Sync>;

pub(crate) type SubscriptionKey = (PeripheralId, Uuid);

const ENABLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct ScanSession {
    pub(crate) handler: ScanHandler,
    auto_stop: Option<AbortHandle>,
    generation: u64,
}

/// How a caller names a characteristic.
#[derive(Clone, Copy)]
pub(crate) enum CharacteristicRef<'a> {
    Handle(&'a Characteristic),
    Uuid(Uuid),
}

/// Everything guarded by the coordinator lock.
#[derive(Default)]
pub(crate) struct CoordinatorState {
    pub(crate) enabled: bool,
    pub(crate) tables: PeripheralTables,
    pub(crate) registry: PendingRegistry,
    pub(crate) subscriptions: HashMap<SubscriptionKey, SubscriptionHandler>,
    pub(crate) scan: Option<ScanSession>,
    /// Links torn down by the coordinator itself; the next `Disconnected`
    /// for each answers that teardown and carries no news.
    pub(crate) abandoning: HashSet<PeripheralId>,
    scan_generation: u64,
}

impl CoordinatorState {
    /// The discovered characteristic, provided the peripheral is ready for I/O.
    fn usable_characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicRef<'_>,
    ) -> Result<Characteristic, BleError> {
        if !self.tables.is_connected(peripheral) {
            return Err(BleError::InvalidState("peripheral not connected"));
        }
        let record = self
            .tables
            .get(peripheral)
            .ok_or(BleError::InvalidState("peripheral not connected"))?;
        if record.state() != PeripheralState::Enumerated {
            return Err(BleError::InvalidState("peripheral not enumerated"));
        }
        let found = match characteristic {
            CharacteristicRef::Handle(handle) => record.discovered(handle),
            CharacteristicRef::Uuid(uuid) => record.characteristic(uuid),
        };
        found
            .copied()
            .ok_or(BleError::InvalidState("characteristic not discovered"))
    }

    /// Reverts the side effects of registering `key`.
    pub(crate) fn unwind(&mut self, key: &OpKey) {
        match key.kind {
            OpKind::Connect => {
                if let Some(p) = self.tables.get_mut(&key.peripheral) {
                    if p.state() == PeripheralState::Connecting {
                        p.set_state(PeripheralState::Unknown);
                    }
                }
            }
            OpKind::Enumerate => {
                if let Some(p) = self.tables.get_mut(&key.peripheral) {
                    if p.state() == PeripheralState::Enumerating {
                        p.set_state(PeripheralState::Connected);
                    }
                }
            }
            OpKind::Subscribe => {
                if let Some(uuid) = key.characteristic {
                    self.subscriptions.remove(&(key.peripheral.clone(), uuid));
                }
            }
            OpKind::Disconnect | OpKind::Read | OpKind::Write => {}
        }
    }

    /// Removes standing subscriptions, for one peripheral or all of them.
    pub(crate) fn take_subscriptions(
        &mut self,
        peripheral: Option<&PeripheralId>,
    ) -> Vec<(SubscriptionKey, SubscriptionHandler)> {
        let keys: Vec<SubscriptionKey> = self
            .subscriptions
            .keys()
            .filter(|(id, _)| peripheral.map_or(true, |p| p == id))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.subscriptions.remove(&key).map(|h| (key, h)))
            .collect()
    }

    /// Re-delivers the discovery table to an active scan.
    pub(crate) fn scan_refresh(&self) -> Option<Deferred> {
        let handler = self.scan.as_ref()?.handler.clone();
        let table = self.tables.discovered_snapshot();
        Some(Box::new(move || handler(&table)))
    }
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: CoordinatorSettings,
    pub(crate) notifications: broadcast::Sender<CoordinatorNotification>,
    state: Mutex<CoordinatorState>,
    runtime: Handle,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, notification: CoordinatorNotification) -> Deferred {
        let sender = self.notifications.clone();
        Box::new(move || {
            // No observers is fine
            let _ = sender.send(notification);
        })
    }

    pub(crate) fn schedule_expiry(self: &Arc<Self>, key: OpKey, token: u64, after: Duration) -> AbortHandle {
        let weak = Arc::downgrade(self);
        self.runtime
            .spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&key, token);
                }
            })
            .abort_handle()
    }

    /// Registers `completion` under `key` and arms its deadline, if any.
    pub(crate) fn register(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        key: OpKey,
        completion: Completion,
        deadline: Option<Duration>,
        busy: &'static str,
    ) -> Result<u64, BleError> {
        let token = state
            .registry
            .register(key.clone(), completion)
            .map_err(|_| BleError::InvalidState(busy))?;
        if let Some(after) = deadline {
            let timer = self.schedule_expiry(key.clone(), token, after);
            state.registry.arm(&key, token, timer);
        }
        Ok(token)
    }

    fn expire(self: &Arc<Self>, key: &OpKey, token: u64) {
        let error = match key.kind {
            OpKind::Connect => BleError::ConnectTimeout,
            OpKind::Enumerate => BleError::EnumerateTimeout,
            OpKind::Read => BleError::ReadTimeout,
            OpKind::Write => BleError::SendDataTimeout,
            OpKind::Subscribe => BleError::SubscribeTimeout,
            // Disconnect has no deadline of its own
            OpKind::Disconnect => BleError::Cancelled,
        };
        if !self.fail_pending(key, token, error) {
            debug!("Timer for {:?} fired after resolution", key);
            return;
        }
        warn!("{:?} on {} timed out", key.kind, key.peripheral);
        if key.kind == OpKind::Connect {
            // A late link must not linger
            self.abandon(std::slice::from_ref(&key.peripheral));
        }
    }

    /// Tears down `ids` at the transport without telling anyone. The
    /// disconnect each produces is swallowed by the demultiplexer.
    fn abandon(&self, ids: &[PeripheralId]) {
        self.state().abandoning.extend(ids.iter().cloned());
        for id in ids {
            if let Err(e) = self.transport.disconnect(id) {
                warn!("Failed to tear down {}: {}", id, e);
                self.state().abandoning.remove(id);
            }
        }
    }

    /// Consumes the mark left by [`Inner::abandon`], if any.
    pub(crate) fn take_abandoned(&self, id: &PeripheralId) -> bool {
        self.state().abandoning.remove(id)
    }

    /// Resolves an accepted operation with `error` if it is still the one
    /// registered under `token`. Returns whether this call won.
    pub(crate) fn fail_pending(&self, key: &OpKey, token: u64, error: BleError) -> bool {
        let deferred = {
            let mut state = self.state();
            let Some(completion) = state.registry.resolve_token(key, token) else {
                return false;
            };
            state.unwind(key);
            completion.fail(error)
        };
        deferred();
        true
    }

    /// Backs out a registration whose transport request was refused.
    /// The caller sees a rejection, so the completion is dropped unseen
    /// unless an event already resolved it.
    fn withdraw(&self, key: &OpKey, token: u64, error: TransportError) -> Result<(), BleError> {
        let mut state = self.state();
        if state.registry.resolve_token(key, token).is_none() {
            return Ok(());
        }
        state.unwind(key);
        warn!("Transport refused {:?} on {}: {}", key.kind, key.peripheral, error);
        Err(BleError::TransportRejected(error))
    }

    fn begin_scan(self: &Arc<Self>, services: &[Uuid], handler: ScanHandler) -> Result<(), BleError> {
        let generation = {
            let mut state = self.state();
            if !state.enabled {
                return Err(BleError::InvalidState("transport disabled"));
            }
            if state.scan.is_some() {
                return Err(BleError::InvalidState("scan already active"));
            }
            state.scan_generation += 1;
            let generation = state.scan_generation;
            let auto_stop = (!self.settings.continuous_scan).then(|| self.schedule_scan_stop(generation));
            state.scan = Some(ScanSession {
                handler,
                auto_stop,
                generation,
            });
            generation
        };

        if let Err(e) = self.transport.start_scan(services) {
            let mut state = self.state();
            if state.scan.as_ref().is_some_and(|s| s.generation == generation) {
                if let Some(timer) = state.scan.take().and_then(|s| s.auto_stop) {
                    timer.abort();
                }
            }
            return Err(e.into());
        }
        info!("Scan started (filter: {:?})", services);
        Ok(())
    }

    fn schedule_scan_stop(self: &Arc<Self>, generation: u64) -> AbortHandle {
        let weak = Arc::downgrade(self);
        let after = self.settings.scan_interval();
        self.runtime
            .spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(inner) = weak.upgrade() {
                    debug!("Scan interval elapsed");
                    inner.end_scan(Some(generation));
                }
            })
            .abort_handle()
    }

    /// Stops the active scan; with `generation`, only if it is still that scan.
    pub(crate) fn end_scan(&self, generation: Option<u64>) {
        let session = {
            let mut state = self.state();
            match &state.scan {
                Some(s) if generation.map_or(true, |g| g == s.generation) => state.scan.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        if let Some(timer) = session.auto_stop {
            timer.abort();
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Failed to stop transport scan: {}", e);
        }
        info!("Scan stopped");
        self.publish(CoordinatorNotification::ScanStopped)();
    }

    fn begin_connect(self: &Arc<Self>, id: &PeripheralId, completion: Completion) -> Result<(), BleError> {
        let key = OpKey::link(id, OpKind::Connect);
        let token = {
            let mut guard = self.state();
            let state = &mut *guard;
            if !state.enabled {
                return Err(BleError::InvalidState("transport disabled"));
            }
            if state.registry.contains(&key) {
                return Err(BleError::InvalidState("connect already pending"));
            }
            let peripheral = state.tables.get_or_insert(id, Instant::now());
            if peripheral.state() != PeripheralState::Unknown {
                return Err(BleError::InvalidState("peripheral already connecting or connected"));
            }
            peripheral.set_state(PeripheralState::Connecting);
            let deadline = Some(self.settings.connect_timeout());
            self.register(state, key.clone(), completion, deadline, "connect already pending")?
        };

        info!("Connecting to {}", id);
        match self.transport.connect(id) {
            Ok(()) => Ok(()),
            Err(e) => self.withdraw(&key, token, e),
        }
    }

    fn begin_enumerate(self: &Arc<Self>, id: &PeripheralId, completion: Completion) -> Result<(), BleError> {
        let key = OpKey::link(id, OpKind::Enumerate);
        let token = {
            let mut guard = self.state();
            let state = &mut *guard;
            if !state.tables.is_connected(id) {
                return Err(BleError::InvalidState("peripheral not connected"));
            }
            if state.registry.contains(&key) {
                return Err(BleError::InvalidState("enumeration already pending"));
            }
            let Some(peripheral) = state.tables.get_mut(id) else {
                return Err(BleError::InvalidState("peripheral not connected"));
            };
            if peripheral.state() != PeripheralState::Connected {
                return Err(BleError::InvalidState("peripheral already enumerated"));
            }
            peripheral.set_state(PeripheralState::Enumerating);
            let deadline = Some(self.settings.enumerate_timeout());
            self.register(state, key.clone(), completion, deadline, "enumeration already pending")?
        };

        info!("Enumerating {}", id);
        match self.transport.discover(id) {
            Ok(()) => Ok(()),
            Err(e) => self.withdraw(&key, token, e),
        }
    }

    fn begin_disconnect(self: &Arc<Self>, id: &PeripheralId, completion: Completion) -> Result<(), BleError> {
        let key = OpKey::link(id, OpKind::Disconnect);
        let token = {
            let mut state = self.state();
            if !state.tables.is_connected(id) {
                return Err(BleError::InvalidState("peripheral not connected"));
            }
            self.register(&mut state, key.clone(), completion, None, "disconnect already pending")?
        };

        info!("Disconnecting {}", id);
        match self.transport.disconnect(id) {
            Ok(()) => Ok(()),
            Err(e) => self.withdraw(&key, token, e),
        }
    }

    fn begin_subscribe(
        self: &Arc<Self>,
        id: &PeripheralId,
        characteristic: CharacteristicRef<'_>,
        handler: SubscriptionHandler,
    ) -> Result<(), BleError> {
        let (key, token, target) = {
            let mut state = self.state();
            let target = state.usable_characteristic(id, characteristic)?;
            if !target.properties.can_subscribe() {
                return Err(BleError::InvalidState("characteristic does not notify"));
            }
            let key = OpKey::attribute(id, OpKind::Subscribe, target.uuid);
            let sub_key = (id.clone(), target.uuid);
            if state.subscriptions.contains_key(&sub_key) || state.registry.contains(&key) {
                return Err(BleError::InvalidState("already subscribed"));
            }
            state.subscriptions.insert(sub_key, handler.clone());
            let deadline = self.settings.subscribe_timeout();
            let token = self
                .register(&mut state, key.clone(), Completion::Subscribe(handler), deadline, "already subscribed")
                .inspect_err(|_| state.unwind(&key))?;
            (key, token, target)
        };

        debug!("Subscribing to {} on {}", target.uuid, id);
        match self.transport.set_notify(id, &target, true) {
            Ok(()) => Ok(()),
            Err(e) => self.withdraw(&key, token, e),
        }
    }

    fn end_subscription(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<(), BleError> {
        let (target, had_handler, pending) = {
            let mut state = self.state();
            let target = state.usable_characteristic(id, CharacteristicRef::Handle(characteristic))?;
            let had_handler = state.subscriptions.remove(&(id.clone(), target.uuid)).is_some();
            let pending = state
                .registry
                .resolve(&OpKey::attribute(id, OpKind::Subscribe, target.uuid));
            (target, had_handler, pending)
        };

        if let Some(completion) = pending {
            completion.fail(BleError::Cancelled)();
        }
        if had_handler {
            debug!("Unsubscribing from {} on {}", target.uuid, id);
            if let Err(e) = self.transport.set_notify(id, &target, false) {
                warn!("Transport failed to stop notifications for {}: {}", target.uuid, e);
            }
        }
        Ok(())
    }

    fn begin_read(
        self: &Arc<Self>,
        id: &PeripheralId,
        characteristic: &Characteristic,
        completion: Completion,
    ) -> Result<(), BleError> {
        let (key, token, target) = {
            let mut state = self.state();
            let target = state.usable_characteristic(id, CharacteristicRef::Handle(characteristic))?;
            if !target.properties.read {
                return Err(BleError::InvalidState("characteristic is not readable"));
            }
            let key = OpKey::attribute(id, OpKind::Read, target.uuid);
            let deadline = self.settings.read_timeout();
            let token = self.register(&mut state, key.clone(), completion, deadline, "read already pending")?;
            (key, token, target)
        };

        match self.transport.read_value(id, &target) {
            Ok(()) => Ok(()),
            Err(e) => self.withdraw(&key, token, e),
        }
    }

    fn begin_write(
        self: &Arc<Self>,
        data: &[u8],
        id: &PeripheralId,
        characteristic: CharacteristicRef<'_>,
        on_result: Box<dyn FnOnce(Result<(), BleError>) + Send>,
    ) -> Result<(), BleError> {
        let mut state = self.state();
        let target = state.usable_characteristic(id, characteristic)?;

        if target.properties.write {
            let key = OpKey::attribute(id, OpKind::Write, target.uuid);
            let deadline = Some(self.settings.send_data_timeout());
            let token = self.register(
                &mut state,
                key.clone(),
                Completion::Write(on_result),
                deadline,
                "write already pending",
            )?;
            drop(state);

            debug!("Writing {} bytes to {} on {}", data.len(), target.uuid, id);
            return match self.transport.write_value(id, &target, data, true) {
                Ok(()) => Ok(()),
                Err(e) => self.withdraw(&key, token, e),
            };
        }

        if target.properties.write_without_response {
            drop(state);
            debug!("Writing {} bytes to {} on {} without response", data.len(), target.uuid, id);
            self.transport.write_value(id, &target, data, false)?;
            // No acknowledgement will ever arrive
            on_result(Ok(()));
            return Ok(());
        }

        Err(BleError::InvalidState("characteristic is not writable"))
    }

    fn reset(&self) {
        let (deferred, linked, was_scanning) = {
            let mut state = self.state();
            let linked = state.tables.linked_ids();
            let ops = state.registry.drain();
            let mut deferred: Vec<Deferred> = Vec::with_capacity(ops.len());
            let acknowledging: Vec<SubscriptionKey> = ops
                .iter()
                .filter(|(key, _)| key.kind == OpKind::Subscribe)
                .filter_map(|(key, _)| key.characteristic.map(|c| (key.peripheral.clone(), c)))
                .collect();
            for (_, completion) in ops {
                deferred.push(completion.fail(BleError::Cancelled));
            }
            for (key, handler) in state.take_subscriptions(None) {
                if !acknowledging.contains(&key) {
                    deferred.push(Box::new(move || handler(Err(BleError::Cancelled))));
                }
            }
            let was_scanning = match state.scan.take() {
                Some(session) => {
                    if let Some(timer) = session.auto_stop {
                        timer.abort();
                    }
                    true
                }
                None => false,
            };
            state.tables.clear();
            (deferred, linked, was_scanning)
        };

        info!(
            "Resetting coordinator: {} pending operation(s) cancelled",
            deferred.len()
        );
        if was_scanning {
            if let Err(e) = self.transport.stop_scan() {
                warn!("Failed to stop transport scan: {}", e);
            }
        }
        self.abandon(&linked);
        run_deferred(deferred);
        if was_scanning {
            self.publish(CoordinatorNotification::ScanStopped)();
        }
    }

    pub(crate) fn sweep(&self) -> Vec<PeripheralId> {
        let (removed, refresh) = {
            let mut state = self.state();
            let removed = state
                .tables
                .sweep(Instant::now(), self.settings.absence_interval());
            let refresh = if removed.is_empty() {
                None
            } else {
                state.scan_refresh()
            };
            (removed, refresh)
        };
        if !removed.is_empty() {
            debug!("Pruned {} absent peripheral(s): {:?}", removed.len(), removed);
        }
        if let Some(refresh) = refresh {
            refresh();
        }
        removed
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let ops = state.registry.drain();
        for (_, completion) in ops {
            completion.fail(BleError::Cancelled)();
        }
    }
}

/// Coordinates peripheral discovery, connection lifecycle and characteristic
/// I/O over a [`Transport`].
///
/// Cheap to clone; all clones share one coordinator. Every operation returns
/// `false` synchronously, without invoking its callback, when its
/// preconditions are not met. An accepted operation calls its callback
/// exactly once.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Creates a coordinator fed by `events`.
    ///
    /// Must be called from within a Tokio runtime; timers, the event pump
    /// and the absence sweeper run on it.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: CoordinatorSettings,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("Coordinator must be created inside a Tokio runtime")?;
        let (notifications, _) = broadcast::channel(settings.notification_capacity.max(1));
        let sweep_interval = settings.sweep_interval();

        let inner = Arc::new(Inner {
            transport,
            settings,
            notifications,
            state: Mutex::new(CoordinatorState::default()),
            runtime: runtime.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let pump = runtime
            .spawn(demux::pump_events(Arc::downgrade(&inner), events))
            .abort_handle();
        let sweeper = sweeper::spawn(Arc::downgrade(&inner), sweep_interval, &runtime);
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([pump, sweeper]);

        info!("Coordinator started");
        Ok(Self { inner })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Registers an observer for disconnect and scan-stopped notifications.
    pub fn notifications(&self) -> broadcast::Receiver<CoordinatorNotification> {
        self.inner.notifications.subscribe()
    }

    /// Feeds one transport event through the demultiplexer on the caller's
    /// thread, bypassing the event channel.
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.dispatch(event);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    /// Waits up to `within` for the adapter to report power-on. Returns
    /// whether it did.
    pub async fn wait_until_enabled(&self, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            while !self.is_enabled() {
                tokio::time::sleep(ENABLE_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state().scan.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state().tables.any_in_state(PeripheralState::Connecting)
    }

    pub fn is_enumerating(&self) -> bool {
        self.inner.state().tables.any_in_state(PeripheralState::Enumerating)
    }

    pub fn discovered_peripherals(&self) -> HashMap<PeripheralId, Peripheral> {
        self.inner.state().tables.discovered_snapshot()
    }

    pub fn connected_peripherals(&self) -> HashMap<PeripheralId, Peripheral> {
        self.inner.state().tables.connected_snapshot()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.inner.state().tables.get(id).cloned()
    }

    /// Number of operations awaiting an event or a timeout.
    pub fn pending_operations(&self) -> usize {
        self.inner.state().registry.len()
    }

    /// Starts scanning for peripherals advertising any of `services`
    /// (empty = all). `on_result` receives the full discovery table on every
    /// discovery.
    pub fn scan<F>(&self, services: &[Uuid], on_result: F) -> bool
    where
        F: Fn(&HashMap<PeripheralId, Peripheral>) + Send + Sync + 'static,
    {
        accepted("scan", self.inner.begin_scan(services, Arc::new(on_result)))
    }

    /// Stops the active scan. No-op when not scanning.
    pub fn stop_scan(&self) {
        self.inner.end_scan(None);
    }

    /// Connects and enumerates. `on_result` receives the enumerated
    /// peripheral.
    pub fn connect<F>(&self, peripheral: &PeripheralId, on_result: F) -> bool
    where
        F: FnOnce(Result<Peripheral, BleError>) + Send + 'static,
    {
        let completion = Completion::Peripheral(Box::new(on_result));
        accepted("connect", self.inner.begin_connect(peripheral, completion))
    }

    /// Re-runs service discovery on a peripheral left at `Connected`.
    pub fn enumerate<F>(&self, peripheral: &PeripheralId, on_result: F) -> bool
    where
        F: FnOnce(Result<Peripheral, BleError>) + Send + 'static,
    {
        let completion = Completion::Peripheral(Box::new(on_result));
        accepted("enumerate", self.inner.begin_enumerate(peripheral, completion))
    }

    pub fn disconnect<F>(&self, peripheral: &PeripheralId, on_result: F) -> bool
    where
        F: FnOnce(Result<Peripheral, BleError>) + Send + 'static,
    {
        let completion = Completion::Peripheral(Box::new(on_result));
        accepted("disconnect", self.inner.begin_disconnect(peripheral, completion))
    }

    /// Turns notifications on. `on_update` receives
    /// [`SubscriptionEvent::Active`] once the transport confirms, then every
    /// value until [`Coordinator::unsubscribe`] or a disconnect.
    pub fn subscribe<F>(&self, peripheral: &PeripheralId, characteristic: &Characteristic, on_update: F) -> bool
    where
        F: Fn(Result<SubscriptionEvent, BleError>) + Send + Sync + 'static,
    {
        let target = CharacteristicRef::Handle(characteristic);
        accepted(
            "subscribe",
            self.inner.begin_subscribe(peripheral, target, Arc::new(on_update)),
        )
    }

    pub fn subscribe_by_id<F>(&self, peripheral: &PeripheralId, characteristic: Uuid, on_update: F) -> bool
    where
        F: Fn(Result<SubscriptionEvent, BleError>) + Send + Sync + 'static,
    {
        let target = CharacteristicRef::Uuid(characteristic);
        accepted(
            "subscribe",
            self.inner.begin_subscribe(peripheral, target, Arc::new(on_update)),
        )
    }

    /// Idempotent; `false` only when the peripheral or characteristic is not
    /// usable.
    pub fn unsubscribe(&self, peripheral: &PeripheralId, characteristic: &Characteristic) -> bool {
        accepted(
            "unsubscribe",
            self.inner.end_subscription(peripheral, characteristic),
        )
    }

    pub fn read<F>(&self, peripheral: &PeripheralId, characteristic: &Characteristic, on_result: F) -> bool
    where
        F: FnOnce(Result<Vec<u8>, BleError>) + Send + 'static,
    {
        let completion = Completion::Read(Box::new(on_result));
        accepted("read", self.inner.begin_read(peripheral, characteristic, completion))
    }

    /// Writes with response when the characteristic supports it (resolved
    /// by the acknowledgement or `SendDataTimeout`), otherwise without
    /// response (resolved as soon as the transport takes the data).
    pub fn write<F>(&self, data: &[u8], peripheral: &PeripheralId, characteristic: &Characteristic, on_result: F) -> bool
    where
        F: FnOnce(Result<(), BleError>) + Send + 'static,
    {
        let target = CharacteristicRef::Handle(characteristic);
        accepted(
            "write",
            self.inner.begin_write(data, peripheral, target, Box::new(on_result)),
        )
    }

    pub fn write_by_id<F>(&self, data: &[u8], peripheral: &PeripheralId, characteristic: Uuid, on_result: F) -> bool
    where
        F: FnOnce(Result<(), BleError>) + Send + 'static,
    {
        let target = CharacteristicRef::Uuid(characteristic);
        accepted(
            "write",
            self.inner.begin_write(data, peripheral, target, Box::new(on_result)),
        )
    }

    /// Runs one absence sweep now. Returns the pruned identities.
    pub fn sweep_absent(&self) -> Vec<PeripheralId> {
        self.inner.sweep()
    }

    /// Clears both tables and resolves every outstanding operation with
    /// `Cancelled`. Live links are torn down at the transport.
    pub fn reset(&self) {
        self.inner.reset();
    }

    // Awaitable variants

    pub async fn connect_async(&self, peripheral: &PeripheralId) -> Result<Peripheral, BleError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .begin_connect(peripheral, Completion::Peripheral(Box::new(forward(tx))))?;
        settle(rx).await
    }

    pub async fn enumerate_async(&self, peripheral: &PeripheralId) -> Result<Peripheral, BleError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .begin_enumerate(peripheral, Completion::Peripheral(Box::new(forward(tx))))?;
        settle(rx).await
    }

    pub async fn disconnect_async(&self, peripheral: &PeripheralId) -> Result<Peripheral, BleError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .begin_disconnect(peripheral, Completion::Peripheral(Box::new(forward(tx))))?;
        settle(rx).await
    }

    pub async fn read_async(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, BleError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .begin_read(peripheral, characteristic, Completion::Read(Box::new(forward(tx))))?;
        settle(rx).await
    }

    pub async fn write_async(
        &self,
        data: &[u8],
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        self.inner.begin_write(
            data,
            peripheral,
            CharacteristicRef::Handle(characteristic),
            Box::new(forward(tx)),
        )?;
        settle(rx).await
    }
}

fn accepted(operation: &str, result: Result<(), BleError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{} rejected: {}", operation, e);
            false
        }
    }
}

fn forward<T: Send + 'static>(
    tx: oneshot::Sender<Result<T, BleError>>,
) -> impl FnOnce(Result<T, BleError>) + Send + 'static {
    move |result| {
        let _ = tx.send(result);
    }
}

async fn settle<T>(rx: oneshot::Receiver<Result<T, BleError>>) -> Result<T, BleError> {
    // A dropped completion means the coordinator went away
    rx.await.unwrap_or(Err(BleError::Cancelled))
}
