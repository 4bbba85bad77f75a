//! Backpressure-aware fan-out of inbound events.
//!
//! Every subscriber declares demand through its [`Subscription`]. An event
//! submitted to the hub reaches each subscriber holding credit and debits one
//! unit; subscribers without credit skip that event, nothing is buffered on
//! their behalf. Closing the hub completes (or fails) every registered
//! subscriber exactly once.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::{
    error::{SseError, SseResult, panic_message},
    types::InboundEvent,
};

type SubscribeFn = Box<dyn FnOnce(Subscription) + Send>;
type EventFn = Box<dyn Fn(&InboundEvent) + Send + Sync>;
type ErrorFn = Box<dyn FnOnce(Arc<SseError>) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// Credit value that is never debited.
pub const UNBOUNDED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Callback set for one subscriber.
///
/// All four callbacks are required; [`DistributionHub::subscribe`] rejects a
/// set with any of them missing.
#[derive(Default)]
#[must_use]
pub struct Subscriber {
    on_subscribe: Option<SubscribeFn>,
    on_event: Option<EventFn>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
}

impl Subscriber {
    /// Create an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once, before any other callback, with the flow-control handle.
    pub fn on_subscribe(mut self, f: impl FnOnce(Subscription) + Send + 'static) -> Self {
        self.on_subscribe = Some(Box::new(f));
        self
    }

    /// Called for every delivered event.
    pub fn on_event(mut self, f: impl Fn(&InboundEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }

    /// Called at most once if the stream terminates with an error.
    pub fn on_error(mut self, f: impl FnOnce(Arc<SseError>) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called at most once when the stream completes.
    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_event", &self.on_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-subscriber slot
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum TerminalSignal {
    Completed,
    Failed(Arc<SseError>),
}

struct TerminalCallbacks {
    on_error: ErrorFn,
    on_complete: CompleteFn,
}

#[derive(Default)]
struct Demand {
    credit: u64,
    cancelled: bool,
}

struct Slot {
    id: u64,
    on_event: EventFn,
    terminal: Mutex<Option<TerminalCallbacks>>,
    demand: Mutex<Demand>,
    /// Serialises every callback invocation for this subscriber. Reentrant so
    /// a callback may close the hub from the delivering thread.
    delivery: ReentrantMutex<()>,
}

/// Outcome of offering one event to one subscriber.
enum Delivery {
    Skipped,
    Delivered,
    Panicked(SseError),
}

impl Slot {
    fn deliver(&self, event: &InboundEvent) -> Delivery {
        let _delivery = self.delivery.lock();
        {
            let mut demand = self.demand.lock();
            if demand.cancelled || demand.credit == 0 {
                return Delivery::Skipped;
            }
            if demand.credit != UNBOUNDED {
                demand.credit -= 1;
            }
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (self.on_event)(event))) {
            Ok(()) => Delivery::Delivered,
            Err(payload) => Delivery::Panicked(SseError::subscriber_panicked(payload.as_ref())),
        }
    }

    fn terminate(&self, signal: &TerminalSignal) {
        let _delivery = self.delivery.lock();
        self.demand.lock().cancelled = true;
        let callbacks = self.terminal.lock().take();
        let Some(callbacks) = callbacks else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match signal {
            TerminalSignal::Completed => (callbacks.on_complete)(),
            TerminalSignal::Failed(err) => (callbacks.on_error)(Arc::clone(err)),
        }));
        if let Err(payload) = outcome {
            warn!(
                subscriber = self.id,
                panic = %panic_message(payload.as_ref()),
                "Subscriber terminal callback panicked"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Flow-control handle handed to a subscriber through `on_subscribe`.
#[derive(Clone)]
pub struct Subscription {
    slot: Arc<Slot>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Add `n` to this subscriber's credit. [`UNBOUNDED`] disables debiting.
    pub fn request(&self, n: u64) {
        let mut demand = self.slot.demand.lock();
        if !demand.cancelled {
            demand.credit = demand.credit.saturating_add(n);
        }
    }

    /// Stop delivery to this subscriber and drop the hub's reference to it.
    ///
    /// A cancelled subscriber receives no terminal callback.
    pub fn cancel(&self) {
        {
            let mut demand = self.slot.demand.lock();
            if demand.cancelled {
                return;
            }
            demand.cancelled = true;
            demand.credit = 0;
        }
        drop(self.slot.terminal.lock().take());
        if let Some(hub) = self.hub.upgrade() {
            hub.registry.lock().slots.retain(|s| s.id != self.slot.id);
        }
        debug!(subscriber = self.slot.id, "Subscription cancelled");
    }

    /// Returns `true` once cancelled or terminated.
    pub fn is_cancelled(&self) -> bool {
        self.slot.demand.lock().cancelled
    }

    /// Credit not yet consumed.
    pub fn credit(&self) -> u64 {
        self.slot.demand.lock().credit
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let demand = self.slot.demand.lock();
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("credit", &demand.credit)
            .field("cancelled", &demand.cancelled)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DistributionHub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    slots: Vec<Arc<Slot>>,
    terminal: Option<TerminalSignal>,
}

#[derive(Default)]
struct HubInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl HubInner {
    /// Drop a subscriber whose callback panicked and fail it alone.
    fn evict(&self, slot: &Slot, err: SseError) {
        self.registry.lock().slots.retain(|s| s.id != slot.id);
        warn!(subscriber = slot.id, error = %err, "Evicting panicking subscriber");
        slot.terminate(&TerminalSignal::Failed(Arc::new(err)));
    }
}

/// Fan-out of one event sequence to many subscribers under pull-based flow
/// control.
#[derive(Clone, Default)]
pub struct DistributionHub {
    inner: Arc<HubInner>,
}

impl DistributionHub {
    /// Create an empty, open hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    ///
    /// `on_subscribe` runs synchronously before this returns. On a hub that
    /// is already closed the subscriber is immediately handed the hub's
    /// terminal signal.
    ///
    /// # Errors
    ///
    /// [`SseError::InvalidArgument`] if any callback is missing. Nothing is
    /// registered in that case.
    pub fn subscribe(&self, subscriber: Subscriber) -> SseResult<()> {
        let Subscriber {
            on_subscribe,
            on_event,
            on_error,
            on_complete,
        } = subscriber;
        let on_subscribe = on_subscribe
            .ok_or_else(|| SseError::invalid_argument("on_subscribe callback is required"))?;
        let on_event =
            on_event.ok_or_else(|| SseError::invalid_argument("on_event callback is required"))?;
        let on_error =
            on_error.ok_or_else(|| SseError::invalid_argument("on_error callback is required"))?;
        let on_complete = on_complete
            .ok_or_else(|| SseError::invalid_argument("on_complete callback is required"))?;

        let slot = Arc::new(Slot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            on_event,
            terminal: Mutex::new(Some(TerminalCallbacks {
                on_error,
                on_complete,
            })),
            demand: Mutex::new(Demand::default()),
            delivery: ReentrantMutex::new(()),
        });

        // Hold the slot's delivery lock until `on_subscribe` returns so no
        // other callback can overtake it.
        let _delivery = slot.delivery.lock();
        let already_terminated = {
            let mut registry = self.inner.registry.lock();
            match &registry.terminal {
                Some(signal) => Some(signal.clone()),
                None => {
                    registry.slots.push(Arc::clone(&slot));
                    None
                }
            }
        };
        debug!(subscriber = slot.id, "Subscriber registered");

        let subscription = Subscription {
            slot: Arc::clone(&slot),
            hub: Arc::downgrade(&self.inner),
        };
        let subscribed = panic::catch_unwind(AssertUnwindSafe(|| on_subscribe(subscription)));
        if let Err(payload) = subscribed {
            self.inner
                .evict(&slot, SseError::subscriber_panicked(payload.as_ref()));
        }

        if let Some(signal) = already_terminated {
            slot.terminate(&signal);
        }
        Ok(())
    }

    /// Deliver `event` to every subscriber with credit. Returns the number of
    /// deliveries made.
    ///
    /// A subscriber whose `on_event` panics is removed and failed with
    /// [`SseError::SubscriberPanicked`]; the others still receive the event.
    pub fn submit(&self, event: &InboundEvent) -> usize {
        let slots = {
            let registry = self.inner.registry.lock();
            if registry.terminal.is_some() {
                return 0;
            }
            registry.slots.clone()
        };

        let mut delivered = 0;
        for slot in &slots {
            match slot.deliver(event) {
                Delivery::Skipped => {}
                Delivery::Delivered => delivered += 1,
                Delivery::Panicked(err) => self.inner.evict(slot, err),
            }
        }
        delivered
    }

    /// Complete every registered subscriber. Idempotent.
    pub fn close(&self) -> bool {
        self.terminate(TerminalSignal::Completed)
    }

    /// Fail every registered subscriber with `err`. Idempotent with
    /// [`close`](Self::close): only the first terminal call has an effect.
    pub fn close_with_error(&self, err: SseError) -> bool {
        self.terminate(TerminalSignal::Failed(Arc::new(err)))
    }

    fn terminate(&self, signal: TerminalSignal) -> bool {
        let slots = {
            let mut registry = self.inner.registry.lock();
            if registry.terminal.is_some() {
                return false;
            }
            registry.terminal = Some(signal.clone());
            std::mem::take(&mut registry.slots)
        };
        debug!(subscribers = slots.len(), "Closing distribution hub");
        for slot in slots {
            slot.terminate(&signal);
        }
        true
    }

    /// Returns `true` once closed or failed.
    pub fn is_closed(&self) -> bool {
        self.inner.registry.lock().terminal.is_some()
    }

    /// Number of registered, non-cancelled subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().slots.len()
    }
}

impl fmt::Debug for DistributionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("DistributionHub")
            .field("subscribers", &registry.slots.len())
            .field("closed", &registry.terminal.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every callback in order and keeps the subscription handle.
    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        subscription: Arc<Mutex<Option<Subscription>>>,
    }

    impl Recorder {
        fn subscriber(&self, initial: u64) -> Subscriber {
            let (a, b, c, d) = (self.clone(), self.clone(), self.clone(), self.clone());
            Subscriber::new()
                .on_subscribe(move |sub| {
                    a.log.lock().push("subscribe".to_string());
                    sub.request(initial);
                    *a.subscription.lock() = Some(sub);
                })
                .on_event(move |ev| b.log.lock().push(format!("event:{}", ev.data)))
                .on_error(move |err| c.log.lock().push(format!("error:{err}")))
                .on_complete(move || d.log.lock().push("complete".to_string()))
        }

        fn events(&self) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter_map(|l| l.strip_prefix("event:").map(str::to_string))
                .collect()
        }

        fn terminals(&self) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter(|l| *l == "complete" || l.starts_with("error:"))
                .cloned()
                .collect()
        }

        fn subscription(&self) -> Subscription {
            self.subscription.lock().clone().expect("subscribed")
        }
    }

    fn event(data: &str) -> InboundEvent {
        InboundEvent::new(data)
    }

    #[test]
    fn test_zero_credit_receives_nothing() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(0)).expect("subscribe");

        for i in 0..100 {
            assert_eq!(hub.submit(&event(&i.to_string())), 0);
        }
        assert!(rec.events().is_empty());
    }

    #[test]
    fn test_request_yields_min_of_credit_and_submitted() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(0)).expect("subscribe");
        hub.submit(&event("dropped"));

        rec.subscription().request(3);
        for data in ["a", "b", "c", "d", "e"] {
            hub.submit(&event(data));
        }
        assert_eq!(rec.events(), vec!["a", "b", "c"]);
        assert_eq!(rec.subscription().credit(), 0);

        rec.subscription().request(10);
        hub.submit(&event("f"));
        hub.submit(&event("g"));
        assert_eq!(rec.events(), vec!["a", "b", "c", "f", "g"]);
        assert_eq!(rec.subscription().credit(), 8);
    }

    #[test]
    fn test_unbounded_credit_is_not_debited() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(UNBOUNDED)).expect("subscribe");
        for i in 0..10 {
            hub.submit(&event(&i.to_string()));
        }
        assert_eq!(rec.events().len(), 10);
        assert_eq!(rec.subscription().credit(), UNBOUNDED);
    }

    #[test]
    fn test_independent_pacing() {
        let hub = DistributionHub::new();
        let fast = Recorder::default();
        let slow = Recorder::default();
        hub.subscribe(fast.subscriber(UNBOUNDED)).expect("subscribe");
        hub.subscribe(slow.subscriber(1)).expect("subscribe");

        assert_eq!(hub.submit(&event("1")), 2);
        assert_eq!(hub.submit(&event("2")), 1);
        assert_eq!(fast.events(), vec!["1", "2"]);
        assert_eq!(slow.events(), vec!["1"]);
    }

    #[test]
    fn test_request_from_inside_on_event() {
        let hub = DistributionHub::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let handle: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let (h1, h2, r) = (Arc::clone(&handle), Arc::clone(&handle), Arc::clone(&received));
        hub.subscribe(
            Subscriber::new()
                .on_subscribe(move |sub| {
                    sub.request(1);
                    *h1.lock() = Some(sub);
                })
                .on_event(move |ev| {
                    r.lock().push(ev.data.clone());
                    if let Some(sub) = h2.lock().as_ref() {
                        sub.request(1);
                    }
                })
                .on_error(|_| {})
                .on_complete(|| {}),
        )
        .expect("subscribe");

        for data in ["x", "y", "z"] {
            hub.submit(&event(data));
        }
        assert_eq!(*received.lock(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cancel_stops_delivery_and_releases_slot() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(UNBOUNDED)).expect("subscribe");
        assert_eq!(hub.subscriber_count(), 1);

        hub.submit(&event("before"));
        rec.subscription().cancel();
        assert!(rec.subscription().is_cancelled());
        assert_eq!(hub.subscriber_count(), 0);

        hub.submit(&event("after"));
        hub.close();
        assert_eq!(rec.events(), vec!["before"]);
        assert!(rec.terminals().is_empty());

        // Requests after cancel are ignored.
        rec.subscription().request(5);
        assert_eq!(rec.subscription().credit(), 0);
    }

    #[test]
    fn test_close_completes_each_subscriber_once() {
        let hub = DistributionHub::new();
        let first = Recorder::default();
        let second = Recorder::default();
        hub.subscribe(first.subscriber(0)).expect("subscribe");
        hub.subscribe(second.subscriber(UNBOUNDED)).expect("subscribe");

        assert!(hub.close());
        assert!(!hub.close());
        assert!(!hub.close_with_error(SseError::stream("late")));

        assert_eq!(first.terminals(), vec!["complete"]);
        assert_eq!(second.terminals(), vec!["complete"]);
        assert!(hub.is_closed());
        assert_eq!(hub.submit(&event("ignored")), 0);
    }

    #[test]
    fn test_close_with_error_fails_instead_of_completing() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(UNBOUNDED)).expect("subscribe");

        assert!(hub.close_with_error(SseError::invalid_status(
            http::StatusCode::NOT_FOUND
        )));
        hub.close();

        assert_eq!(
            rec.terminals(),
            vec!["error:Unexpected HTTP status: 404 Not Found"]
        );
    }

    #[test]
    fn test_subscribe_after_close_terminates_immediately() {
        let hub = DistributionHub::new();
        hub.close();

        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(UNBOUNDED)).expect("subscribe");
        assert_eq!(*rec.log.lock(), vec!["subscribe", "complete"]);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_missing_callback_is_rejected_without_registration() {
        let hub = DistributionHub::new();
        let err = hub
            .subscribe(
                Subscriber::new()
                    .on_subscribe(|sub| sub.request(1))
                    .on_event(|_| {})
                    .on_complete(|| {}),
            )
            .expect_err("missing on_error");
        assert!(matches!(err, SseError::InvalidArgument { .. }));
        assert_eq!(err.to_string(), "Invalid argument: on_error callback is required");
        assert_eq!(hub.subscriber_count(), 0);

        assert!(hub.subscribe(Subscriber::new()).is_err());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_close_from_inside_on_event() {
        let hub = DistributionHub::new();
        let completed = Arc::new(AtomicU64::new(0));
        let inner_hub = hub.clone();
        let c = Arc::clone(&completed);
        hub.subscribe(
            Subscriber::new()
                .on_subscribe(|sub| sub.request(UNBOUNDED))
                .on_event(move |_| {
                    inner_hub.close();
                })
                .on_error(|_| {})
                .on_complete(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .expect("subscribe");

        hub.submit(&event("trigger"));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_close_single_terminal() {
        let hub = DistributionHub::new();
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(UNBOUNDED)).expect("subscribe");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        hub.close();
                    } else {
                        hub.close_with_error(SseError::stream("boom"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(rec.terminals().len(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_evicted_alone() {
        let hub = DistributionHub::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        hub.subscribe(
            Subscriber::new()
                .on_subscribe(|s| s.request(UNBOUNDED))
                .on_event(|ev| {
                    if ev.data == "boom" {
                        panic!("cannot handle {}", ev.data);
                    }
                })
                .on_error(move |err| e.lock().push(err.to_string()))
                .on_complete(|| {}),
        )
        .expect("subscribe");
        let healthy = Recorder::default();
        hub.subscribe(healthy.subscriber(UNBOUNDED))
            .expect("subscribe");

        assert_eq!(hub.submit(&event("boom")), 1);
        assert_eq!(hub.submit(&event("after")), 1);
        assert_eq!(healthy.events(), vec!["boom", "after"]);
        assert_eq!(
            *errors.lock(),
            vec!["Subscriber callback panicked: cannot handle boom"]
        );
        assert_eq!(hub.subscriber_count(), 1);

        assert!(hub.close());
        assert_eq!(healthy.terminals(), vec!["complete"]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_panicking_on_subscribe_fails_that_subscriber() {
        let hub = DistributionHub::new();
        let (tx, rx) = std::sync::mpsc::channel();
        hub.subscribe(
            Subscriber::new()
                .on_subscribe(|_| panic!("refusing demand"))
                .on_event(|_| {})
                .on_error(move |err| {
                    let _ = tx.send(err.to_string());
                })
                .on_complete(|| {}),
        )
        .expect("subscribe");

        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx.try_recv().expect("failed").contains("refusing demand"));
        assert!(!hub.is_closed());
    }

    #[test]
    fn test_panicking_terminal_callback_does_not_skip_others() {
        let hub = DistributionHub::new();
        hub.subscribe(
            Subscriber::new()
                .on_subscribe(|_| {})
                .on_event(|_| {})
                .on_error(|_| {})
                .on_complete(|| panic!("complete failed")),
        )
        .expect("subscribe");
        let rec = Recorder::default();
        hub.subscribe(rec.subscriber(0)).expect("subscribe");

        assert!(hub.close());
        assert_eq!(rec.terminals(), vec!["complete"]);
    }
}
