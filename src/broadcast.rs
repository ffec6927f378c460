//! Multi-subscriber fan-out of framed viewer events.
//!
//! One producer calls `broadcast`; any number of viewers `register`, block on
//! their `Subscription`, and eventually `unregister`. Each subscriber owns an
//! unbounded inbox, so a stalled viewer never slows the producer or its peers.
//! The registry lock is held only to mutate or snapshot the set of inboxes,
//! never while delivering.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Opaque subscriber identifier, unique per broadcaster.
pub type SubscriberId = u64;

/// Framed event bytes, shared by every inbox it is delivered to.
pub type WireEvent = Arc<[u8]>;

#[derive(Default)]
struct Registry {
    inboxes: HashMap<SubscriberId, Sender<WireEvent>>,
    closed: bool,
}

/// Fan-out hub shared between the pipeline worker and the viewer server.
pub struct Broadcaster {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// Outcome of a bounded wait on a subscription.
#[derive(Debug)]
pub enum Receive {
    Event(WireEvent),
    /// Nothing arrived within the timeout.
    Idle,
    /// The subscriber was unregistered or the broadcaster closed.
    Closed,
}

/// A registered viewer's end of its inbox.
pub struct Subscription {
    id: SubscriberId,
    inbox: Receiver<WireEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Block until the next event. `None` once the inbox has been closed and drained.
    pub fn receive(&self) -> Option<WireEvent> {
        self.inbox.recv().ok()
    }

    /// Block for at most `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Receive {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => Receive::Event(event),
            Err(RecvTimeoutError::Timeout) => Receive::Idle,
            Err(RecvTimeoutError::Disconnected) => Receive::Closed,
        }
    }

    /// Events queued and not yet received.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber. It receives only events broadcast after this returns.
    pub fn register(&self) -> Result<Subscription> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.registry();
            if registry.closed {
                return Err(anyhow!("broadcaster is shutting down"));
            }
            registry.inboxes.insert(id, tx);
        }
        log::debug!("broadcast: subscriber {} registered", id);
        Ok(Subscription { id, inbox: rx })
    }

    /// Remove a subscriber. Its pending events are dropped once the
    /// subscription is dropped. Returns false for unknown ids.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.registry().inboxes.remove(&id).is_some();
        if removed {
            log::debug!("broadcast: subscriber {} unregistered", id);
        }
        removed
    }

    /// Deliver `event` to every registered inbox without waiting on any consumer.
    /// Returns the number of inboxes it was queued in.
    pub fn broadcast(&self, event: impl Into<WireEvent>) -> usize {
        let event = event.into();
        let targets: Vec<(SubscriberId, Sender<WireEvent>)> = {
            let registry = self.registry();
            registry
                .inboxes
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            // A dropped receiver is not an error here; unregister cleans it up.
            match tx.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => log::debug!("broadcast: subscriber {} is gone", id),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().inboxes.len()
    }

    /// Queue depth per subscriber, sorted by id.
    pub fn inbox_depths(&self) -> Vec<(SubscriberId, usize)> {
        let mut depths: Vec<_> = self
            .registry()
            .inboxes
            .iter()
            .map(|(id, tx)| (*id, tx.len()))
            .collect();
        depths.sort_unstable_by_key(|(id, _)| *id);
        depths
    }

    /// Drop every inbox so blocked receivers wake up, and refuse new subscribers.
    pub fn close(&self) {
        let drained = {
            let mut registry = self.registry();
            registry.closed = true;
            std::mem::take(&mut registry.inboxes)
        };
        log::info!("broadcast: closed, released {} subscribers", drained.len());
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn event(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    fn decode(event: &WireEvent) -> u32 {
        u32::from_be_bytes(event[..4].try_into().unwrap())
    }

    #[test]
    fn subscriber_receives_events_in_order() -> Result<()> {
        let hub = Broadcaster::new();
        let sub = hub.register()?;
        for n in 0..20 {
            assert_eq!(hub.broadcast(event(n)), 1);
        }
        assert_eq!(sub.pending(), 20);
        let got: Vec<u32> = (0..20).map(|_| decode(&sub.receive().unwrap())).collect();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn late_subscriber_sees_only_later_events() -> Result<()> {
        let hub = Broadcaster::new();
        let early = hub.register()?;
        for n in 0..5 {
            hub.broadcast(event(n));
        }
        let late = hub.register()?;
        assert_eq!(late.pending(), 0);
        hub.broadcast(event(5));

        assert_eq!(early.pending(), 6);
        assert_eq!(late.pending(), 1);
        assert_eq!(decode(&late.receive().unwrap()), 5);
        Ok(())
    }

    #[test]
    fn stalled_subscriber_does_not_delay_active_one() -> Result<()> {
        const EVENTS: u32 = 5_000;
        let hub = Arc::new(Broadcaster::new());
        let stalled = hub.register()?;
        let active = hub.register()?;

        let reader = thread::spawn(move || {
            let mut seen = 0u32;
            while seen < EVENTS {
                match active.receive_timeout(Duration::from_secs(5)) {
                    Receive::Event(ev) => {
                        assert_eq!(decode(&ev), seen);
                        seen += 1;
                    }
                    other => panic!("active subscriber starved: {:?}", other),
                }
            }
            seen
        });

        let started = Instant::now();
        for n in 0..EVENTS {
            hub.broadcast(event(n));
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(reader.join().unwrap(), EVENTS);
        assert_eq!(stalled.pending(), EVENTS as usize);
        Ok(())
    }

    #[test]
    fn unregister_stops_delivery_and_ends_stream() -> Result<()> {
        let hub = Broadcaster::new();
        let sub = hub.register()?;
        hub.broadcast(event(1));
        assert!(hub.unregister(sub.id()));
        assert!(!hub.unregister(sub.id()));
        assert_eq!(hub.broadcast(event(2)), 0);

        assert_eq!(decode(&sub.receive().unwrap()), 1);
        assert!(sub.receive().is_none());
        Ok(())
    }

    #[test]
    fn dropped_subscription_is_not_a_broadcast_error() -> Result<()> {
        let hub = Broadcaster::new();
        let sub = hub.register()?;
        let keep = hub.register()?;
        drop(sub);
        assert_eq!(hub.broadcast(event(7)), 1);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(decode(&keep.receive().unwrap()), 7);
        Ok(())
    }

    #[test]
    fn close_wakes_receivers_and_rejects_new_subscribers() -> Result<()> {
        let hub = Arc::new(Broadcaster::new());
        let sub = hub.register()?;
        let waiter = thread::spawn(move || sub.receive_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        hub.close();
        assert!(matches!(waiter.join().unwrap(), Receive::Closed));
        assert!(hub.is_closed());
        assert!(hub.register().is_err());
        assert_eq!(hub.subscriber_count(), 0);
        Ok(())
    }

    #[test]
    fn inbox_depths_reports_backlog() -> Result<()> {
        let hub = Broadcaster::new();
        let a = hub.register()?;
        hub.broadcast(event(1));
        let b = hub.register()?;
        hub.broadcast(event(2));
        assert_eq!(hub.inbox_depths(), vec![(a.id(), 2), (b.id(), 1)]);
        Ok(())
    }

    #[test]
    fn registration_races_with_broadcast() {
        let hub = Arc::new(Broadcaster::new());
        let producer = {
            let hub = hub.clone();
            thread::spawn(move || {
                for n in 0..2_000 {
                    hub.broadcast(event(n));
                }
            })
        };
        let churn: Vec<_> = (0..4)
            .map(|_| {
                let hub = hub.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let sub = hub.register().unwrap();
                        let mut last = None;
                        while let Receive::Event(ev) = sub.receive_timeout(Duration::ZERO) {
                            let n = decode(&ev);
                            if let Some(prev) = last {
                                assert!(n > prev);
                            }
                            last = Some(n);
                        }
                        assert!(hub.unregister(sub.id()));
                    }
                })
            })
            .collect();
        producer.join().unwrap();
        for handle in churn {
            handle.join().unwrap();
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}
