//! Per-run shared state
//!
//! One simulation run owns exactly one context: counters, clock, token cell,
//! resolver and transports. Nothing here is shared across runs, which is what
//! keeps interpolator caches and counters scoped to a single `start()`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;

use interpolation::Resolver;
use protocol_emitter::{DeviceRoute, EntityRoute, UpdateGateway};

use crate::clock::SimClock;
use crate::events::{EventFeed, SimulationEvent};

/// Default delay for backpressure re-enqueues, in milliseconds
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Options of one `start()` call
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Install a virtual clock starting at this instant
    pub from_date: Option<DateTime<Utc>>,
    /// End a fast-forward run when the virtual clock reaches this instant
    pub to_date: Option<DateTime<Utc>>,
    /// Emit `progress-info` on this interval; `None` disables it
    pub progress_interval_ms: Option<u64>,
    /// Backpressure margin: maximum outstanding not-yet-responded updates.
    /// Negative disables admission control.
    pub maximum_not_responded: i64,
    /// Re-enqueue delay for admission-delayed updates
    pub delay_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            from_date: None,
            to_date: None,
            progress_interval_ms: None,
            maximum_not_responded: -1,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

/// Update counters, process-wide for the lifetime of one run
#[derive(Debug, Default)]
pub struct Counters {
    pub updates_processed: AtomicI64,
    pub updates_requested: AtomicI64,
    pub updates_responded: AtomicI64,
    pub delayed_update_requests: AtomicI64,
    pub error_update_requests: AtomicI64,
}

impl Counters {
    pub fn processed(&self) -> i64 {
        self.updates_processed.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> i64 {
        self.updates_requested.load(Ordering::SeqCst)
    }

    pub fn responded(&self) -> i64 {
        self.updates_responded.load(Ordering::SeqCst)
    }

    pub fn delayed(&self) -> i64 {
        self.delayed_update_requests.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> i64 {
        self.error_update_requests.load(Ordering::SeqCst)
    }
}

/// Shared state of one simulation run
pub struct RunContext {
    pub options: RunOptions,
    pub clock: SimClock,
    pub counters: Counters,
    pub feed: EventFeed,
    /// Current authentication token, shared with the lookup client
    pub token: Arc<RwLock<Option<String>>>,
    pub resolver: Resolver,
    pub gateway: Arc<dyn UpdateGateway>,
    pub entity_route: Option<EntityRoute>,
    pub ultralight_route: Option<DeviceRoute>,
    pub json_route: Option<DeviceRoute>,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    in_flight_tx: watch::Sender<i64>,
    in_flight_rx: watch::Receiver<i64>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: RunOptions,
        clock: SimClock,
        feed: EventFeed,
        token: Arc<RwLock<Option<String>>>,
        resolver: Resolver,
        gateway: Arc<dyn UpdateGateway>,
        entity_route: Option<EntityRoute>,
        ultralight_route: Option<DeviceRoute>,
        json_route: Option<DeviceRoute>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (in_flight_tx, in_flight_rx) = watch::channel(0);
        Self {
            options,
            clock,
            counters: Counters::default(),
            feed,
            token,
            resolver,
            gateway,
            entity_route,
            ultralight_route,
            json_route,
            stop_tx,
            stop_rx,
            in_flight_tx,
            in_flight_rx,
        }
    }

    /// Emit an event unless the run is shutting down.
    ///
    /// After a stop only the final `stop`/`end` pair may reach the feed; those
    /// are emitted by the controller directly.
    pub fn emit(&self, event: SimulationEvent) {
        if !self.is_stopping() {
            self.feed.emit(event);
        }
    }

    /// Ask the run to shut down
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// True once a stop was requested
    pub fn is_stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves when a stop is requested
    pub async fn stopped(&self) {
        let mut rx = self.stop_rx.clone();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Track one in-flight dispatch
    pub fn dispatch_started(&self) {
        self.in_flight_tx.send_modify(|count| *count += 1);
    }

    /// Finish one in-flight dispatch
    pub fn dispatch_finished(&self) {
        self.in_flight_tx.send_modify(|count| *count -= 1);
    }

    /// Currently in-flight dispatches
    pub fn in_flight(&self) -> i64 {
        *self.in_flight_rx.borrow()
    }

    /// Resolves once no dispatches are in flight
    pub async fn idle(&self) {
        let mut rx = self.in_flight_rx.clone();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFeed;
    use interpolation::script::NoLookup;

    fn context() -> RunContext {
        RunContext::new(
            RunOptions::default(),
            SimClock::real(),
            EventFeed::new(),
            Arc::new(RwLock::new(None)),
            Resolver::new(Arc::new(NoLookup)),
            Arc::new(crate::dispatch::tests::NullGateway),
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_mutes_events() {
        let ctx = context();
        let mut receiver = ctx.feed.subscribe();
        ctx.request_stop();
        ctx.request_stop();
        assert!(ctx.is_stopping());
        ctx.emit(SimulationEvent::TokenRequest);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_in_flight_tracking() {
        let ctx = context();
        assert_eq!(ctx.in_flight(), 0);
        ctx.dispatch_started();
        assert_eq!(ctx.in_flight(), 1);
        ctx.dispatch_finished();
        ctx.idle().await;
    }
}
