//! Controller: owns every OutputManager, drives the per-tick algorithm,
//! persists state, and runs the graceful-shutdown sequence. Grounded on the
//! teacher's `worker::run()` orchestration shape (compute inputs, call out
//! to sub-components in sequence, log, persist) generalised to an
//! every-`PollingInterval`-seconds loop instead of a single run.

use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local, Utc};
use crossbeam_channel::Receiver;
use log::{error, info, warn};

use crate::config::{Config, OutputConfig, OutputSequence};
use crate::device_worker::{DeviceWorker, DeviceWorkerHandle, SequenceOutcome, Step, StepSpec};
use crate::device_worker::SequenceRequest;
use crate::errors::ControllerError;
use crate::interfaces::AdminCommand;
use crate::manager_pricing::PricingManager;
use crate::models::{DeviceSnapshot, OutputActionType};
use crate::notify::Notifier;
use crate::output::{OutputManager, ResolvedIds};
use crate::scheduler::Scheduler;
use crate::state::{self, SavedOutputState, SavedState};

const REFRESH_WAIT_TIMEOUT_S: u64 = 90;
const SHUTDOWN_WAIT_PER_OUTPUT_S: u64 = 3;
const RESTART_BACKOFF_S: u64 = 5;

/// Shared wake-event: the condvar the controller's idle wait blocks on, and
/// the flag admin commands or external signals set to cut that wait short.
pub struct WakeEvent {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl WakeEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(WakeEvent { flag: Mutex::new(false), cv: Condvar::new() })
    }

    pub fn wake(&self) {
        *self.flag.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let flag = self.flag.lock().unwrap();
        let (mut flag, _) = self.cv.wait_timeout_while(flag, timeout, |set| !*set).unwrap();
        *flag = false;
    }
}

pub struct Controller {
    outputs: Vec<OutputManager>,
    sequences: HashMap<String, OutputSequence>,
    pricing: PricingManager,
    scheduler: Scheduler,
    worker: DeviceWorkerHandle,
    worker_snapshot: Arc<std::sync::RwLock<DeviceSnapshot>>,
    notifier: Notifier,
    admin_rx: Receiver<AdminCommand>,
    wake: Arc<WakeEvent>,
    stop: Arc<AtomicBool>,
    polling_interval_s: u32,
    config_path: String,
    config_mtime: Option<SystemTime>,
    state_dir: String,
    state_backup_max_hours: i64,
    device_name: String,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        config_path: String,
        outputs: Vec<OutputManager>,
        pricing: PricingManager,
        scheduler: Scheduler,
        worker: DeviceWorkerHandle,
        worker_snapshot: Arc<std::sync::RwLock<DeviceSnapshot>>,
        notifier: Notifier,
        admin_rx: Receiver<AdminCommand>,
        wake: Arc<WakeEvent>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let sequences = config.output_sequences.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let config_mtime = fs::metadata(&config_path).and_then(|m| m.modified()).ok();

        Controller {
            outputs,
            sequences,
            pricing,
            scheduler,
            worker,
            worker_snapshot,
            notifier,
            admin_rx,
            wake,
            stop,
            polling_interval_s: config.general.polling_interval,
            config_path,
            config_mtime,
            state_dir: config.general.state_dir.clone(),
            state_backup_max_hours: config.general.state_backup_max_hours,
            device_name: "power-controller".to_string(),
        }
    }

    /// Runs ticks until the stop flag is set, then performs shutdown.
    pub fn run_forever(&mut self) -> Result<(), ControllerError> {
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.tick() {
                error!("tick failed: {}", e);
            }
            self.wake.wait_timeout(Duration::from_secs(self.polling_interval_s as u64));
        }
        self.shutdown();
        Ok(())
    }

    fn tick(&mut self) -> Result<(), ControllerError> {
        let now = Local::now();
        self.drain_admin_commands(now);

        if self.pricing.is_refresh_due(Utc::now()) {
            if let Err(e) = self.pricing.refresh(Utc::now()) {
                warn!("tariff refresh failed: {}", e);
            }
        }

        let snapshot = self.refresh_snapshot();

        let config_changed = self.config_changed();

        let pricing = &self.pricing;
        let scheduler = &self.scheduler;
        for output in self.outputs.iter_mut() {
            let current_price = output.current_price(pricing, scheduler, now);
            output.calculate_running_totals(&snapshot, current_price, now);
            if let Err(e) = output.review_run_plan(pricing, scheduler, &snapshot, now, config_changed) {
                error!("output '{}' failed to review run plan: {}", output.name(), e);
            }
        }

        self.evaluate_and_dispatch(&snapshot, now);

        if config_changed {
            info!("config file changed, persisting state and re-initialising");
            self.persist_state(now)?;
            self.config_mtime = fs::metadata(&self.config_path).and_then(|m| m.modified()).ok();
        }

        self.persist_state(now)?;

        if let Err(e) = self.notifier.heartbeat(now) {
            warn!("heartbeat failed: {}", e);
        }

        Ok(())
    }

    fn refresh_snapshot(&self) -> DeviceSnapshot {
        let id = 0;
        let request = SequenceRequest {
            id,
            label: "refresh".into(),
            steps: vec![StepSpec { step: Step::RefreshStatus, retries: 0, retry_backoff_s: 0 }],
            timeout_s: REFRESH_WAIT_TIMEOUT_S,
        };
        self.worker.submit(request);
        if self.worker.wait_for_result(id, Duration::from_secs(REFRESH_WAIT_TIMEOUT_S)).is_none() {
            warn!("device status refresh timed out after {}s, using last snapshot", REFRESH_WAIT_TIMEOUT_S);
        }
        self.worker_snapshot.read().unwrap().clone()
    }

    /// Parents evaluated and dispatched before their children, so a parent's
    /// just-computed on/off state is visible to `evaluate_conditions`.
    fn evaluate_and_dispatch(&mut self, snapshot: &DeviceSnapshot, now: DateTime<Local>) {
        let order = self.parents_first_order();
        let mut snapshot = snapshot.clone();

        for idx in order {
            if let Some(request_id) = self.outputs[idx].pending_request_id() {
                match self.worker.wait_for_result(request_id, Duration::from_millis(0)) {
                    Some(result) => {
                        match result.outcome {
                            SequenceOutcome::Success => {}
                            SequenceOutcome::Failure(e) => warn!("output '{}' action failed: {}", self.outputs[idx].name(), e),
                            SequenceOutcome::Timeout => warn!("output '{}' action timed out", self.outputs[idx].name()),
                        }
                        self.outputs[idx].clear_pending();
                        snapshot = self.worker_snapshot.read().unwrap().clone();
                    }
                    None => continue,
                }
            }

            let parent_name = self.outputs[idx].parent_output().map(|s| s.to_string());
            let parent_on = parent_name.as_deref().and_then(|name| self.outputs.iter().find(|o| o.name() == name)).map(|o| o.is_on());

            let (state, system_state, reason) = self.outputs[idx].evaluate_conditions(&snapshot, now, parent_on);
            let action = self.outputs[idx].build_action(state, system_state, reason, &snapshot, &self.sequences);

            match action.action_type {
                OutputActionType::TurnOn | OutputActionType::TurnOff => {
                    if let Some(request) = action.request {
                        let id = request.id;
                        self.worker.submit(request);
                        self.outputs[idx].set_pending_request_id(id);
                    }
                }
                OutputActionType::UpdateOnState | OutputActionType::UpdateOffState => {}
            }
        }
    }

    fn parents_first_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.outputs.len());
        let mut placed = vec![false; self.outputs.len()];

        fn place(i: usize, outputs: &[OutputManager], placed: &mut [bool], order: &mut Vec<usize>) {
            if placed[i] {
                return;
            }
            if let Some(parent_name) = outputs[i].parent_output() {
                if let Some(parent_idx) = outputs.iter().position(|o| o.name() == parent_name) {
                    place(parent_idx, outputs, placed, order);
                }
            }
            placed[i] = true;
            order.push(i);
        }

        for i in 0..self.outputs.len() {
            place(i, &self.outputs, &mut placed, &mut order);
        }
        order
    }

    fn config_changed(&self) -> bool {
        match fs::metadata(&self.config_path).and_then(|m| m.modified()) {
            Ok(mtime) => Some(mtime) != self.config_mtime,
            Err(_) => false,
        }
    }

    fn persist_state(&self, now: DateTime<Local>) -> Result<(), ControllerError> {
        let outputs = self
            .outputs
            .iter()
            .map(|o| SavedOutputState {
                name: o.name().to_string(),
                system_state: o.system_state(),
                is_on: o.is_on(),
                last_changed: o.last_changed(),
                reason: o.reason(),
                app_mode: o.app_mode(),
                app_mode_revert_time: o.app_mode_revert_at(),
                history: o.history().history().clone(),
            })
            .collect();

        let saved = SavedState::new(self.device_name.clone(), outputs, now);
        state::save_state(&self.state_dir, &saved, self.state_backup_max_hours)?;
        Ok(())
    }

    fn drain_admin_commands(&mut self, now: DateTime<Local>) {
        while let Ok(cmd) = self.admin_rx.try_recv() {
            self.apply_admin_command(cmd, now);
        }
    }

    fn apply_admin_command(&mut self, cmd: AdminCommand, now: DateTime<Local>) {
        match cmd {
            AdminCommand::SetMode { output_id, mode, revert_minutes } => {
                let revert_at = revert_minutes.map(|m| now + chrono::Duration::minutes(m as i64));
                match self.outputs.iter_mut().find(|o| o.output_id() == output_id) {
                    Some(output) => output.set_app_mode(mode, revert_at),
                    None => warn!("admin SetMode for unknown output id {}", output_id),
                }
            }
            AdminCommand::SequenceCompleted { sequence_id, label, ok, error } => {
                if ok {
                    info!("admin-reported sequence {} ({}) completed", sequence_id, label);
                } else {
                    warn!("admin-reported sequence {} ({}) failed: {:?}", sequence_id, label, error);
                }
            }
        }
    }

    /// Turns off every `StopOnExit` output that is currently on, waiting up
    /// to `SHUTDOWN_WAIT_PER_OUTPUT_S` seconds for each to confirm.
    fn shutdown(&mut self) {
        info!("shutting down, turning off StopOnExit outputs");
        for output in self.outputs.iter_mut() {
            if !output.stop_on_exit() || !output.is_on() {
                continue;
            }
            let snapshot = self.worker_snapshot.read().unwrap().clone();
            let action = output.build_action(
                crate::models::OutputState::Off,
                crate::models::SystemState::AppOverride,
                crate::models::StateReason::Off(crate::models::StateReasonOff::AppOverride),
                &snapshot,
                &self.sequences,
            );
            if let Some(request) = action.request {
                let id = request.id;
                self.worker.submit(request);
                self.worker.wait_for_result(id, Duration::from_secs(SHUTDOWN_WAIT_PER_OUTPUT_S));
            }
        }
    }
}

/// Runs `worker.run()` under supervision: a panic inside a tick restarts
/// the worker loop up to `max_restarts` times with linear backoff; the
/// controller itself has no restart policy (a fatal crash there is
/// process-terminal).
pub fn supervise_worker(worker: DeviceWorker, stop: Arc<AtomicBool>, max_restarts: u32) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let worker = Mutex::new(worker);
        let mut attempt = 0u32;
        while !stop.load(Ordering::Relaxed) && attempt <= max_restarts {
            let run_stop = stop.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                worker.lock().unwrap().run(run_stop);
            }));
            if outcome.is_err() {
                attempt += 1;
                error!("device worker panicked, restart {}/{}", attempt, max_restarts);
                std::thread::sleep(Duration::from_secs(attempt as u64 * RESTART_BACKOFF_S));
            } else {
                break;
            }
        }
    })
}

/// Resolves the name-keyed references an `OutputConfig` carries (device
/// output/input/meter labels, temp probe names) into the integer ids the
/// snapshot is indexed by. Grounded on `ShellyDevice{Name, Label}` staying
/// human-readable in config while the live snapshot is id-keyed.
pub fn resolve_ids(config: &OutputConfig, label_to_id: &HashMap<String, u32>) -> ResolvedIds {
    let output_id = label_to_id.get(&config.device_output).copied().unwrap_or(0);
    let device_id = output_id;
    let meter_id = config.device_meter.as_ref().and_then(|n| label_to_id.get(n)).copied();
    let input_id = config.device_input.as_ref().and_then(|n| label_to_id.get(n)).copied();
    let temp_probe_ids = config
        .temp_probe_constraints
        .iter()
        .filter_map(|c| label_to_id.get(&c.temp_probe).map(|id| (c.temp_probe.clone(), *id)))
        .collect();

    ResolvedIds { output_id, device_id, meter_id, input_id, temp_probe_ids }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_event_short_circuits_the_idle_wait() {
        let wake = WakeEvent::new();
        let wake_for_thread = wake.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            wake_for_thread.wake();
        });
        wake.wait_timeout(Duration::from_secs(30));
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
