//! Acknowledgement correlation
//!
//! The MQTT client assigns packet identifiers inside its event loop, after
//! the request has left the caller. Callers therefore register a waiter
//! before issuing a request (under the manager's request lock, so waiters
//! queue in the same order as requests) and the driver binds the front
//! waiter to the identifier reported by the matching outgoing event. The
//! acknowledgement for that identifier then resolves the waiter.
//!
//! A publish whose identifier is still in flight is parked by the client
//! (reported as "await ack") and written later under that identifier. Its
//! waiter is set aside at that point so requests issued in the meantime bind
//! to their own waiters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use mqt_core::BrokerError;
use tokio::sync::oneshot;

pub(crate) type AckSender = oneshot::Sender<Result<(), BrokerError>>;

/// Request kinds tracked separately; each has its own packet sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

struct Waiter {
    tx: AckSender,
    /// QoS 0 publishes complete when they are written, not on an ack
    resolve_on_send: bool,
}

#[derive(Default)]
struct AckQueue {
    queued: VecDeque<Waiter>,
    in_flight: HashMap<u16, AckSender>,
    /// Packets re-sent by the client after a reconnect
    abandoned: HashSet<u16>,
    /// Waiter of a request parked behind an in-flight identifier
    parked: Option<(u16, Waiter)>,
}

impl AckQueue {
    fn bind(&mut self, pkid: u16) {
        if self.abandoned.remove(&pkid) {
            tracing::debug!("Packet {} replayed after reconnect", pkid);
            return;
        }
        let waiter = match self.parked.take() {
            Some((parked, waiter)) if parked == pkid => Some(waiter),
            other => {
                self.parked = other;
                self.queued.pop_front()
            }
        };
        let Some(waiter) = waiter else {
            tracing::debug!("No waiter for outgoing packet {}", pkid);
            return;
        };
        if waiter.resolve_on_send {
            let _ = waiter.tx.send(Ok(()));
        } else {
            self.in_flight.insert(pkid, waiter.tx);
        }
    }

    fn park(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                if let Some((previous, waiter)) = self.parked.replace((pkid, waiter)) {
                    tracing::debug!("Packet {} parked again before it was sent", previous);
                    self.queued.push_front(waiter);
                }
            }
            None => tracing::debug!("No waiter for parked packet {}", pkid),
        }
    }

    fn resolve(&mut self, pkid: u16, result: Result<(), BrokerError>) {
        if let Some(tx) = self.in_flight.remove(&pkid) {
            let _ = tx.send(result);
        }
    }

    fn fail_in_flight(&mut self, error: &BrokerError, remember: bool) {
        for (pkid, tx) in self.in_flight.drain() {
            if remember {
                self.abandoned.insert(pkid);
            }
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn fail_all(&mut self, error: &BrokerError) {
        self.fail_in_flight(error, false);
        let parked = self.parked.take().map(|(_, waiter)| waiter);
        for waiter in parked.into_iter().chain(self.queued.drain(..)) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        self.abandoned.clear();
    }
}

#[derive(Default)]
struct AckState {
    subscribe: AckQueue,
    unsubscribe: AckQueue,
    publish: AckQueue,
}

impl AckState {
    fn queue(&mut self, kind: AckKind) -> &mut AckQueue {
        match kind {
            AckKind::Subscribe => &mut self.subscribe,
            AckKind::Unsubscribe => &mut self.unsubscribe,
            AckKind::Publish => &mut self.publish,
        }
    }
}

/// Waiters for in-flight broker requests
#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for the next request of `kind`
    pub fn enqueue(&self, kind: AckKind, tx: AckSender, resolve_on_send: bool) {
        self.lock()
            .queue(kind)
            .queued
            .push_back(Waiter { tx, resolve_on_send });
    }

    /// Drop the most recent waiter; its request never reached the client
    pub fn withdraw_last(&self, kind: AckKind) {
        self.lock().queue(kind).queued.pop_back();
    }

    /// The client wrote a packet of `kind` with identifier `pkid`
    pub fn on_outgoing(&self, kind: AckKind, pkid: u16) {
        self.lock().queue(kind).bind(pkid);
    }

    /// The client held back the next request of `kind` because `pkid` is
    /// still awaiting its acknowledgement
    pub fn on_await_ack(&self, kind: AckKind, pkid: u16) {
        self.lock().queue(kind).park(pkid);
    }

    /// The broker acknowledged packet `pkid`
    pub fn on_ack(&self, kind: AckKind, pkid: u16, result: Result<(), BrokerError>) {
        self.lock().queue(kind).resolve(pkid, result);
    }

    /// Fail everything already on the wire. Queued requests stay queued;
    /// the client sends them after reconnecting.
    pub fn connection_lost(&self, reason: &str) {
        let error = BrokerError::ConnectionLost(reason.to_string());
        let mut state = self.lock();
        state.subscribe.fail_in_flight(&error, false);
        state.unsubscribe.fail_in_flight(&error, false);
        state.publish.fail_in_flight(&error, true);
    }

    /// Fail every waiter
    pub fn close(&self) {
        let mut state = self.lock();
        state.subscribe.fail_all(&BrokerError::Closed);
        state.unsubscribe.fail_all(&BrokerError::Closed);
        state.publish.fail_all(&BrokerError::Closed);
    }
}
