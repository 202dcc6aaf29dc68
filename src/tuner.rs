//! Tuner controller (spec §4.9, component C10): front-end tune → cache
//! reload → reader re-enable sequencing, and current-service/current-multiplex
//! authority.

use crate::cache::Cache;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::frontend::Frontend;
use crate::model::parse_fqid;
use crate::reader::ReaderControl;
use crate::store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// How often the retune sequence polls the front-end for lock while waiting.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct TunerConfig {
    pub tune_timeout: Duration,
    pub remove_failed_frequencies: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            tune_timeout: Duration::from_secs(30),
            remove_failed_frequencies: false,
        }
    }
}

#[derive(Default)]
struct TunerState {
    current_multiplex: Option<u32>,
    current_service: Option<u16>,
    locked: bool,
}

/// Coordinates retunes. Holds `current_service`/`current_multiplex`; the only
/// component authorized to command the front-end or quiesce the reader for a
/// channel change. `on_service_retarget` is invoked with the new service id
/// once the front-end has locked, so the caller can point its primary
/// [`crate::servicefilter::ServiceFilter`] there without this module needing
/// to know about service filters directly.
pub struct Tuner {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    frontend: Arc<dyn Frontend>,
    events: Arc<EventBus>,
    reader: ReaderControl,
    on_service_retarget: Arc<dyn Fn(u16) + Send + Sync>,
    state: Mutex<TunerState>,
    config: TunerConfig,
}

impl Tuner {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        frontend: Arc<dyn Frontend>,
        events: Arc<EventBus>,
        reader: ReaderControl,
        on_service_retarget: Arc<dyn Fn(u16) + Send + Sync>,
        config: TunerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            frontend,
            events,
            reader,
            on_service_retarget,
            state: Mutex::new(TunerState::default()),
            config,
        }
    }

    pub fn current_service(&self) -> Option<u16> {
        self.state.lock().current_service
    }

    pub fn current_multiplex(&self) -> Option<u32> {
        self.state.lock().current_multiplex
    }

    /// Pins the current selection, used by the scan state machine (C12) to
    /// prevent a scan from disturbing live viewing.
    pub fn lock_service(&self) {
        self.state.lock().locked = true;
    }

    pub fn unlock_service(&self) {
        self.state.lock().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Resolves `locator` (a bare service name or `net.ts.svc` fqid) and
    /// switches to it. If it is already on the current multiplex, only the
    /// primary filter's target changes — no retune. Otherwise runs the full
    /// quiesce → writeback → load → tune → resume sequence.
    pub async fn set_current_service(&self, locator: &str) -> Result<()> {
        let service = self.resolve(locator).await?;

        let same_mux = self.state.lock().current_multiplex == Some(service.mux_uid);
        if same_mux {
            self.state.lock().current_service = Some(service.service_id);
            (self.on_service_retarget)(service.service_id);
            self.events.fire("tuning", "service_changed", Arc::new(service.service_id));
            return Ok(());
        }

        self.retune(service.mux_uid, service.service_id).await
    }

    async fn resolve(&self, locator: &str) -> Result<crate::model::Service> {
        let found = if let Some((net, ts, svc)) = parse_fqid(locator) {
            self.store.find_service_by_fqid(net, ts, svc).await?
        } else {
            self.store.find_service_by_name(locator).await?
        };
        found.ok_or_else(|| EngineError::NotFound(format!("service {locator}")))
    }

    /// Retunes to `mux_uid`'s first service if not already current, per the
    /// same sequence [`Tuner::set_current_service`] uses for a cross-mux move.
    pub async fn set_current_multiplex(&self, mux_uid: u32) -> Result<()> {
        if self.state.lock().current_multiplex == Some(mux_uid) {
            return Ok(());
        }
        let services = self.store.services_for_multiplex(mux_uid).await?;
        let service_id = services.first().map(|s| s.service_id).unwrap_or(0);
        self.retune(mux_uid, service_id).await
    }

    async fn retune(&self, mux_uid: u32, service_id: u16) -> Result<()> {
        self.reader.enable(false);
        self.cache.writeback().await?;
        self.cache.load(mux_uid).await?;

        let mux = self
            .store
            .find_multiplex_by_uid(mux_uid)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("multiplex {mux_uid}")))?;

        self.events.fire("dvb_adapter", "unlocked", Arc::new(mux_uid));
        self.frontend.tune(mux.delivery_system, &mux.tuning_params).await?;

        if !self.wait_for_lock().await {
            if self.config.remove_failed_frequencies {
                if let Err(err) = self.store.delete_multiplex(mux_uid).await {
                    log::warn!("tuner: failed to remove dead multiplex {mux_uid}: {err}");
                }
            }
            self.reader.enable(true);
            self.events.fire("dvb_adapter", "tune_failed", Arc::new(mux_uid));
            return Err(EngineError::Timeout { scope: "front-end lock".into() });
        }
        self.events.fire("dvb_adapter", "locked", Arc::new(mux_uid));

        {
            let mut state = self.state.lock();
            state.current_multiplex = Some(mux_uid);
            state.current_service = Some(service_id);
        }
        self.reader.reset_stats();
        (self.on_service_retarget)(service_id);

        self.reader.enable(true);

        self.events.fire("tuning", "multiplex_changed", Arc::new(mux_uid));
        self.events.fire("tuning", "service_changed", Arc::new(service_id));
        Ok(())
    }

    async fn wait_for_lock(&self) -> bool {
        let deadline = std::time::Instant::now() + self.config.tune_timeout;
        loop {
            if self.frontend.is_locked() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}
