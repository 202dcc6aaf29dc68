//! Scan state machine (spec §4.11, component C12): a single-threaded,
//! cooperative walk over a queue of tuning candidates, pausing at each for
//! front-end lock and table completeness before moving on.
//!
//! Decoupled from the PSI/dispatch wiring the same way [`crate::tuner::Tuner`]
//! is decoupled from [`crate::servicefilter::ServiceFilter`]: the caller
//! supplies `tables_ready`/`nit_candidates` closures rather than this module
//! reaching into a concrete `Dispatcher`.

use crate::error::Result;
use crate::events::EventBus;
use crate::model::{DeliverySystem, TuningParams};
use crate::tuner::Tuner;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One phase of the scan state machine. `Canceling` is not a state here —
/// spec §4.11 calls it an orthogonal transition, observed at every step via
/// [`Scan::cancel`] and folded directly into `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Init,
    NextMux,
    WaitingForTables,
    WaitingForNit,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub delivery_system: DeliverySystem,
    pub params: TuningParams,
}

pub struct ScanConfig {
    pub lock_timeout: Duration,
    pub tables_timeout: Duration,
    /// Whether to wait for and follow the NIT's transponder list.
    pub scan_from_network: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            tables_timeout: Duration::from_secs(5),
            scan_from_network: false,
        }
    }
}

/// Runs one scan at a time; `run` is not reentrant (spec §7's `Busy` error
/// kind covers a caller attempting to start a second scan, left to the
/// engine layer that owns a single [`Scan`] instance per adapter).
pub struct Scan {
    frontend: Arc<dyn crate::frontend::Frontend>,
    events: Arc<EventBus>,
    tuner: Arc<Tuner>,
    tables_ready: Arc<dyn Fn() -> bool + Send + Sync>,
    nit_candidates: Arc<dyn Fn() -> Option<Vec<ScanCandidate>> + Send + Sync>,
    config: ScanConfig,
    canceled: AtomicBool,
    state: Mutex<ScanState>,
}

impl Scan {
    pub fn new(
        frontend: Arc<dyn crate::frontend::Frontend>,
        events: Arc<EventBus>,
        tuner: Arc<Tuner>,
        tables_ready: Arc<dyn Fn() -> bool + Send + Sync>,
        nit_candidates: Arc<dyn Fn() -> Option<Vec<ScanCandidate>> + Send + Sync>,
        config: ScanConfig,
    ) -> Self {
        Self {
            frontend,
            events,
            tuner,
            tables_ready,
            nit_candidates,
            config,
            canceled: AtomicBool::new(false),
            state: Mutex::new(ScanState::Stopped),
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    /// Requests cancellation; observed at the next state transition.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    fn set_state(&self, state: ScanState) {
        *self.state.lock() = state;
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Walks `candidates` (and any transponders the NIT adds along the way),
    /// tuning to each in turn. Returns the candidates that completed table
    /// acquisition, in the order found. Restores the pre-scan service (if
    /// any was current) and unlocks it on completion or cancellation.
    pub async fn run(&self, candidates: Vec<ScanCandidate>) -> Result<Vec<ScanCandidate>> {
        self.canceled.store(false, Ordering::Relaxed);
        let pre_scan_mux = self.tuner.current_multiplex();
        self.tuner.lock_service();

        self.set_state(ScanState::Init);
        self.events.fire("scan", "started", Arc::new(candidates.len()));

        let mut queue: VecDeque<ScanCandidate> = candidates.into();
        let mut found = Vec::new();
        let mut canceled_mid_scan = false;

        while let Some(candidate) = queue.pop_front() {
            if self.is_canceled() {
                canceled_mid_scan = true;
                break;
            }

            self.set_state(ScanState::NextMux);
            self.events.fire("scan", "trying", Arc::new(candidate.params.to_string()));
            self.frontend.tune(candidate.delivery_system, &candidate.params).await?;

            if !self.wait_until(self.config.lock_timeout, || self.frontend.is_locked()).await {
                continue;
            }

            self.set_state(ScanState::WaitingForTables);
            if !self.wait_until(self.config.tables_timeout, || (self.tables_ready)()).await {
                continue;
            }

            if self.config.scan_from_network {
                self.set_state(ScanState::WaitingForNit);
                self.wait_until(self.config.tables_timeout, || (self.nit_candidates)().is_some())
                    .await;
                if let Some(extra) = (self.nit_candidates)() {
                    queue.extend(extra);
                }
            }

            self.events.fire("scan", "found", Arc::new(candidate.params.to_string()));
            found.push(candidate);

            if self.is_canceled() {
                canceled_mid_scan = true;
                break;
            }
        }

        self.set_state(ScanState::Stopping);
        if canceled_mid_scan {
            self.events.fire("scan", "cancel", Arc::new(()));
        }

        if let Some(mux) = pre_scan_mux {
            if let Err(err) = self.tuner.set_current_multiplex(mux).await {
                log::warn!("scan: failed to restore pre-scan multiplex {mux}: {err}");
            }
        }
        self.tuner.unlock_service();

        self.set_state(ScanState::Stopped);
        self.events.fire("scan", "finished", Arc::new(found.len()));
        Ok(found)
    }

    async fn wait_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if self.is_canceled() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::dispatch::Dispatcher;
    use crate::frontend::SimulatedFrontend;
    use crate::reader;
    use crate::store::InMemoryStore;
    use crate::tuner::TunerConfig;
    use std::sync::atomic::AtomicUsize;

    fn candidate(frequency: &str) -> ScanCandidate {
        let mut params = TuningParams::new();
        params.set("frequency", frequency);
        ScanCandidate { delivery_system: DeliverySystem::DvbT, params }
    }

    async fn build_scan(frontend: SimulatedFrontend, config: ScanConfig) -> (Scan, Arc<EventBus>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let events = Arc::new(EventBus::new());
        let (tx, source) = crate::dvr::ChannelDvrSource::new();
        let handle = reader::spawn(source, Dispatcher::new(), 20);
        let control = handle.control();
        std::mem::forget(tx);
        std::mem::forget(handle);

        let frontend: Arc<dyn crate::frontend::Frontend> = Arc::new(frontend);
        let tuner = Arc::new(Tuner::new(
            store,
            cache,
            frontend.clone(),
            events.clone(),
            control,
            Arc::new(|_service_id| {}),
            TunerConfig::default(),
        ));

        let scan = Scan::new(
            frontend,
            events.clone(),
            tuner,
            Arc::new(|| true), // tables always "ready" immediately in these tests
            Arc::new(|| None),
            config,
        );
        (scan, events)
    }

    #[tokio::test]
    async fn scan_finds_every_locking_candidate() {
        let config = ScanConfig {
            lock_timeout: Duration::from_millis(200),
            tables_timeout: Duration::from_millis(200),
            scan_from_network: false,
        };
        let (scan, _events) = build_scan(SimulatedFrontend::new(4), config).await;

        let found = scan
            .run(vec![candidate("100"), candidate("200"), candidate("300")])
            .await
            .unwrap();

        assert_eq!(found.len(), 3);
        assert_eq!(scan.state(), ScanState::Stopped);
    }

    #[tokio::test]
    async fn scan_skips_candidates_that_never_lock() {
        let frontend = SimulatedFrontend::new(4).with_failing_frequency("bad");
        let config = ScanConfig {
            lock_timeout: Duration::from_millis(80),
            tables_timeout: Duration::from_millis(80),
            scan_from_network: false,
        };
        let (scan, _events) = build_scan(frontend, config).await;

        let found = scan.run(vec![candidate("bad"), candidate("good")]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn canceling_mid_scan_fires_cancel_and_stops_early() {
        let config = ScanConfig {
            lock_timeout: Duration::from_millis(500),
            tables_timeout: Duration::from_millis(500),
            scan_from_network: false,
        };
        let (scan, events) = build_scan(SimulatedFrontend::new(4), config).await;
        let scan = Arc::new(scan);

        let cancel_fired = Arc::new(AtomicUsize::new(0));
        let c = cancel_fired.clone();
        events.subscribe("scan", "cancel", move |_, _, _| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        let scan_for_cancel = scan.clone();
        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scan_for_cancel.cancel();
        });

        let found = scan
            .run(vec![candidate("1"), candidate("2"), candidate("3"), candidate("4")])
            .await
            .unwrap();

        cancel_task.await.unwrap();
        assert!(found.len() <= 4);
        assert_eq!(scan.state(), ScanState::Stopped);
        assert_eq!(cancel_fired.load(Ordering::Relaxed), 1);
    }
}
