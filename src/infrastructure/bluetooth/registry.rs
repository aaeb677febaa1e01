//! Pending-Operation Registry
//!
//! One slot per (peripheral, kind, characteristic). A slot holds the caller's
//! single-use completion plus the abort handle of its deadline timer.
//! Resolution takes the slot out of the map, so whichever of the event path
//! and the timer path gets there first wins and the other finds nothing.

use crate::domain::error::BleError;
use crate::domain::models::{Peripheral, PeripheralId, SubscriptionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::error;
use uuid::Uuid;

/// Resolves connect, enumerate and disconnect.
pub type PeripheralCallback = Box<dyn FnOnce(Result<Peripheral, BleError>) + Send>;
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, BleError>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(Result<(), BleError>) + Send>;
/// Standing callback; fires for the acknowledgement and every value after it.
pub type SubscriptionHandler = Arc<dyn Fn(Result<SubscriptionEvent, BleError>) + Send + Sync>;

/// Work to run once the coordinator lock is released.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

pub(crate) fn run_deferred(deferred: Vec<Deferred>) {
    for work in deferred {
        work();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    Enumerate,
    Disconnect,
    Subscribe,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpKey {
    pub peripheral: PeripheralId,
    pub kind: OpKind,
    pub characteristic: Option<Uuid>,
}

impl OpKey {
    /// Key for a whole-peripheral operation.
    pub fn link(peripheral: &PeripheralId, kind: OpKind) -> Self {
        Self {
            peripheral: peripheral.clone(),
            kind,
            characteristic: None,
        }
    }

    pub fn attribute(peripheral: &PeripheralId, kind: OpKind, characteristic: Uuid) -> Self {
        Self {
            peripheral: peripheral.clone(),
            kind,
            characteristic: Some(characteristic),
        }
    }
}

/// What a successful event hands to the completion.
pub(crate) enum Outcome {
    Peripheral(Peripheral),
    Value(Vec<u8>),
    Done,
}

pub(crate) enum Completion {
    Peripheral(PeripheralCallback),
    Read(ReadCallback),
    Write(WriteCallback),
    Subscribe(SubscriptionHandler),
}

impl Completion {
    pub(crate) fn fail(self, error: BleError) -> Deferred {
        match self {
            Self::Peripheral(cb) => Box::new(move || cb(Err(error))),
            Self::Read(cb) => Box::new(move || cb(Err(error))),
            Self::Write(cb) => Box::new(move || cb(Err(error))),
            Self::Subscribe(handler) => Box::new(move || handler(Err(error))),
        }
    }

    pub(crate) fn finish(self, result: Result<Outcome, BleError>) -> Deferred {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(e),
        };
        match (self, outcome) {
            (Self::Peripheral(cb), Outcome::Peripheral(p)) => Box::new(move || cb(Ok(p))),
            (Self::Read(cb), Outcome::Value(v)) => Box::new(move || cb(Ok(v))),
            (Self::Write(cb), Outcome::Done) => Box::new(move || cb(Ok(()))),
            (Self::Subscribe(handler), Outcome::Done) => {
                Box::new(move || handler(Ok(SubscriptionEvent::Active)))
            }
            (completion, _) => {
                error!("Completion resolved with a mismatched outcome");
                completion.fail(BleError::InvalidState("mismatched completion"))
            }
        }
    }
}

struct PendingOp {
    token: u64,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingOp {
    fn into_completion(self) -> Completion {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.completion
    }
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    ops: HashMap<OpKey, PendingOp>,
    next_token: u64,
}

impl PendingRegistry {
    pub(crate) fn contains(&self, key: &OpKey) -> bool {
        self.ops.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Claims the slot. Hands the completion back when it is already taken.
    pub(crate) fn register(&mut self, key: OpKey, completion: Completion) -> Result<u64, Completion> {
        if self.ops.contains_key(&key) {
            return Err(completion);
        }
        let token = self.issue_token();
        self.ops.insert(
            key,
            PendingOp {
                token,
                completion,
                timer: None,
            },
        );
        Ok(token)
    }

    /// Attaches a deadline timer. A timer for a slot that has since been
    /// resolved or re-registered is aborted on the spot.
    pub(crate) fn arm(&mut self, key: &OpKey, token: u64, timer: AbortHandle) -> bool {
        match self.ops.get_mut(key) {
            Some(op) if op.token == token => {
                if let Some(previous) = op.timer.replace(timer) {
                    previous.abort();
                }
                true
            }
            _ => {
                timer.abort();
                false
            }
        }
    }

    /// Event path: takes whatever is pending under `key`.
    pub(crate) fn resolve(&mut self, key: &OpKey) -> Option<Completion> {
        self.ops.remove(key).map(PendingOp::into_completion)
    }

    /// Timer or rollback path: takes the slot only if it still belongs to
    /// `token`.
    pub(crate) fn resolve_token(&mut self, key: &OpKey, token: u64) -> Option<Completion> {
        match self.ops.get(key) {
            Some(op) if op.token == token => self.resolve(key),
            _ => None,
        }
    }

    /// Moves a pending completion to a new slot under a fresh token, dropping
    /// the old timer. Used when a connect turns into its enumeration phase.
    pub(crate) fn rekey(&mut self, from: &OpKey, to: OpKey) -> Option<u64> {
        if self.ops.contains_key(&to) {
            return None;
        }
        let completion = self.resolve(from)?;
        self.register(to, completion).ok()
    }

    pub(crate) fn drain_peripheral(&mut self, peripheral: &PeripheralId) -> Vec<(OpKey, Completion)> {
        let keys: Vec<OpKey> = self
            .ops
            .keys()
            .filter(|key| &key.peripheral == peripheral)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.resolve(&key).map(|c| (key, c)))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<(OpKey, Completion)> {
        self.ops
            .drain()
            .map(|(key, op)| (key, op.into_completion()))
            .collect()
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<Result<(), BleError>>>>;

    fn write_completion(log: &Log) -> Completion {
        let log = log.clone();
        Completion::Write(Box::new(move |r| log.lock().unwrap().push(r)))
    }

    fn key(id: &str, kind: OpKind) -> OpKey {
        OpKey::attribute(&PeripheralId::new(id), kind, Uuid::from_u128(1))
    }

    #[test]
    fn second_registration_is_refused() {
        let log: Log = Default::default();
        let mut registry = PendingRegistry::default();
        assert!(registry.register(key("a", OpKind::Write), write_completion(&log)).is_ok());
        assert!(registry.register(key("a", OpKind::Write), write_completion(&log)).is_err());
        // Different kind on the same characteristic is a different slot
        assert!(registry.register(key("a", OpKind::Read), write_completion(&log)).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn first_resolution_wins() {
        let log: Log = Default::default();
        let mut registry = PendingRegistry::default();
        let k = key("a", OpKind::Write);
        let token = registry.register(k.clone(), write_completion(&log)).ok().unwrap();

        let completion = registry.resolve(&k).unwrap();
        completion.finish(Ok(Outcome::Done))();

        assert!(registry.resolve_token(&k, token).is_none());
        assert!(registry.resolve(&k).is_none());
        assert_eq!(*log.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn stale_token_does_not_resolve_newer_operation() {
        let log: Log = Default::default();
        let mut registry = PendingRegistry::default();
        let k = key("a", OpKind::Write);
        let old = registry.register(k.clone(), write_completion(&log)).ok().unwrap();
        registry.resolve(&k).unwrap().fail(BleError::SendDataTimeout)();

        let new = registry.register(k.clone(), write_completion(&log)).ok().unwrap();
        assert_ne!(old, new);
        assert!(registry.resolve_token(&k, old).is_none());
        assert!(registry.resolve_token(&k, new).is_some());
    }

    #[test]
    fn rekey_moves_completion() {
        let log: Log = Default::default();
        let mut registry = PendingRegistry::default();
        let id = PeripheralId::new("a");
        let from = OpKey::link(&id, OpKind::Connect);
        let to = OpKey::link(&id, OpKind::Enumerate);
        let old = registry.register(from.clone(), write_completion(&log)).ok().unwrap();

        let new = registry.rekey(&from, to.clone()).unwrap();
        assert!(!registry.contains(&from));
        assert!(registry.resolve_token(&to, old).is_none());
        assert!(registry.resolve_token(&to, new).is_some());
    }

    #[test]
    fn drain_peripheral_leaves_others() {
        let log: Log = Default::default();
        let mut registry = PendingRegistry::default();
        let _ = registry.register(key("a", OpKind::Write), write_completion(&log));
        let _ = registry.register(key("a", OpKind::Read), write_completion(&log));
        let _ = registry.register(key("b", OpKind::Write), write_completion(&log));

        let drained = registry.drain_peripheral(&PeripheralId::new("a"));
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 1);
        for (_, completion) in drained {
            completion.fail(BleError::PeripheralDisconnected)();
        }
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn mismatched_outcome_still_resolves() {
        let log: Log = Default::default();
        write_completion(&log).finish(Ok(Outcome::Value(vec![1])))();
        assert_eq!(
            *log.lock().unwrap(),
            vec![Err(BleError::InvalidState("mismatched completion"))]
        );
    }
}
