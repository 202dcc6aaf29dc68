//! Front-end abstraction (spec §6): the tuner hardware driver interface and
//! its PID hardware filter bank.

use crate::error::{EngineError, Result};
use crate::model::{DeliverySystem, TuningParams};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Instantaneous signal state reported by a front-end.
#[derive(Debug, Clone, Default)]
pub struct SignalStatus {
    pub locked: bool,
    /// Relative signal strength, front-end-defined scale.
    pub signal_strength: u16,
    /// Relative signal quality, front-end-defined scale.
    pub signal_quality: u16,
    pub bit_error_rate: u32,
}

/// A tunable hardware (or simulated) front-end. One front-end serves one
/// multiplex at a time; the tuner controller (C10) owns it exclusively.
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Starts tuning to `params` on `delivery_system`. Returns once the
    /// request has been submitted to hardware, not once locked — call
    /// [`Frontend::status`] to poll for lock, matching spec §4.9's
    /// "tune failures surface asynchronously, not as a tune() error".
    async fn tune(&self, delivery_system: DeliverySystem, params: &TuningParams) -> Result<()>;

    async fn status(&self) -> Result<SignalStatus>;

    /// The parameters currently applied, possibly refined by hardware (e.g.
    /// an auto-detected symbol rate) beyond what [`Frontend::tune`] was given.
    fn parameters(&self) -> TuningParams;

    fn is_locked(&self) -> bool;

    /// Allocates a hardware PID filter slot for `pid`. Adapters that can
    /// demux their own PID subset in hardware expose a small, fixed number
    /// of these; exceeding it is a caller error, not a retryable one.
    fn allocate_pid_filter(&self, pid: u16) -> Result<u32>;

    fn release_pid_filter(&self, handle: u32) -> Result<()>;
}

struct SimulatedState {
    delivery_system: Option<DeliverySystem>,
    params: TuningParams,
    locked: bool,
    filters: HashSet<u32>,
    next_filter: u32,
}

/// An in-memory front-end for tests and for running the engine without DVB
/// hardware attached. Locks immediately unless the tuned frequency is in its
/// `failing_frequencies` set, matching how the tuner's
/// `remove_failed_frequencies` path is exercised in tests.
pub struct SimulatedFrontend {
    state: Mutex<SimulatedState>,
    max_pid_filters: u32,
    failing_frequencies: HashSet<String>,
}

impl SimulatedFrontend {
    pub fn new(max_pid_filters: u32) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                delivery_system: None,
                params: TuningParams::new(),
                locked: false,
                filters: HashSet::new(),
                next_filter: 0,
            }),
            max_pid_filters,
            failing_frequencies: HashSet::new(),
        }
    }

    /// Marks a `frequency` tuning-parameter value as one that will never lock.
    pub fn with_failing_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.failing_frequencies.insert(frequency.into());
        self
    }
}

#[async_trait]
impl Frontend for SimulatedFrontend {
    async fn tune(&self, delivery_system: DeliverySystem, params: &TuningParams) -> Result<()> {
        let should_fail = params
            .get("frequency")
            .map(|f| self.failing_frequencies.contains(f))
            .unwrap_or(false);

        let mut state = self.state.lock();
        state.delivery_system = Some(delivery_system);
        state.params = params.clone();
        state.locked = !should_fail;
        Ok(())
    }

    async fn status(&self) -> Result<SignalStatus> {
        let state = self.state.lock();
        Ok(SignalStatus {
            locked: state.locked,
            signal_strength: if state.locked { 100 } else { 0 },
            signal_quality: if state.locked { 100 } else { 0 },
            bit_error_rate: 0,
        })
    }

    fn parameters(&self) -> TuningParams {
        self.state.lock().params.clone()
    }

    fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    fn allocate_pid_filter(&self, _pid: u16) -> Result<u32> {
        let mut state = self.state.lock();
        if state.filters.len() as u32 >= self.max_pid_filters {
            return Err(EngineError::Busy(format!(
                "no free PID filter slots (cap {})",
                self.max_pid_filters
            )));
        }
        let handle = state.next_filter;
        state.next_filter += 1;
        state.filters.insert(handle);
        Ok(handle)
    }

    fn release_pid_filter(&self, handle: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.filters.remove(&handle) {
            return Err(EngineError::NotFound(format!("pid filter handle {handle}")));
        }
        Ok(())
    }
}
