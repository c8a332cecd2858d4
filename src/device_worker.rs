//! DeviceWorker: a single cooperative worker that serializes multi-step
//! device command sequences with retries and timeouts, and periodically
//! refreshes the published device snapshot.

pub mod errors;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::interfaces::Device;
use crate::models::{DeviceSnapshot, OutputState};

use errors::WorkerError;

/// Granularity at which blocking waits (sleeps, retry backoff) re-check the
/// sequence's overall timeout budget, so a single long wait can't blow past it.
const BUDGET_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Step {
    ChangeOutput { output_id: u32, device_id: u32, state: OutputState },
    Sleep { seconds: u64 },
    RefreshStatus,
    GetLocation { device_id: u32 },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StepSpec {
    pub step: Step,
    pub retries: u32,
    pub retry_backoff_s: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceRequest {
    pub id: u64,
    pub label: String,
    pub steps: Vec<StepSpec>,
    pub timeout_s: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SequenceOutcome {
    Success,
    Failure(String),
    Timeout,
}

#[derive(Clone, Debug)]
pub struct SequenceResult {
    pub id: u64,
    pub outcome: SequenceOutcome,
}

struct Shared {
    pending: Mutex<HashSet<u64>>,
    results: Mutex<HashMap<u64, SequenceResult>>,
    cv: Condvar,
}

#[derive(Clone)]
pub struct DeviceWorkerHandle {
    sender: Sender<SequenceRequest>,
    shared: Arc<Shared>,
}

impl DeviceWorkerHandle {
    /// Submits a sequence for FIFO processing; returns immediately.
    pub fn submit(&self, request: SequenceRequest) {
        self.shared.pending.lock().unwrap().insert(request.id);
        if self.sender.send(request).is_err() {
            error!("device worker channel closed, request dropped");
        }
    }

    /// Blocks until the named request completes (or `timeout` elapses); an
    /// unknown (never-submitted, or already-reaped) id is treated as
    /// already complete.
    pub fn wait_for_result(&self, id: u64, timeout: Duration) -> Option<SequenceResult> {
        let mut pending = self.shared.pending.lock().unwrap();
        if !pending.contains(&id) {
            let results = self.shared.results.lock().unwrap();
            return results.get(&id).cloned().or(Some(SequenceResult { id, outcome: SequenceOutcome::Success }));
        }
        drop(pending);

        let results = self.shared.results.lock().unwrap();
        let (mut results, timed_out) = self
            .shared
            .cv
            .wait_timeout_while(results, timeout, |r| !r.contains_key(&id))
            .unwrap();
        if timed_out.timed_out() {
            return None;
        }
        results.remove(&id)
    }
}

pub struct DeviceWorker {
    device: Arc<dyn Device>,
    device_ids: Vec<u32>,
    max_concurrent_errors: u32,
    report_delay_s: u64,
    concurrent_errors: u32,
    last_failure_first_seen: Option<Instant>,
    was_any_offline: bool,
    reinitialise_needed: bool,
    snapshot: Arc<RwLock<DeviceSnapshot>>,
    receiver: Receiver<SequenceRequest>,
    shared: Arc<Shared>,
}

impl DeviceWorker {
    /// Builds a DeviceWorker and the handle used by other threads to submit
    /// sequences and wait on their results.
    ///
    /// # Arguments
    ///
    /// * 'device' - the collaborator that talks to the physical relay hardware
    /// * 'device_ids' - identities of all devices this worker polls on `RefreshStatus`
    /// * 'max_concurrent_errors' - consecutive sequence failures before a notifiable issue is raised
    /// * 'report_delay_s' - how long a run of failures must persist before it's actually reported
    pub fn new(device: Arc<dyn Device>, device_ids: Vec<u32>, max_concurrent_errors: u32, report_delay_s: u64) -> (Self, DeviceWorkerHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        });

        let worker = DeviceWorker {
            device,
            device_ids,
            max_concurrent_errors,
            report_delay_s,
            concurrent_errors: 0,
            last_failure_first_seen: None,
            was_any_offline: false,
            reinitialise_needed: false,
            snapshot: Arc::new(RwLock::new(DeviceSnapshot::default())),
            receiver: rx,
            shared: shared.clone(),
        };

        let handle = DeviceWorkerHandle { sender: tx, shared };

        (worker, handle)
    }

    pub fn snapshot(&self) -> Arc<RwLock<DeviceSnapshot>> {
        self.snapshot.clone()
    }

    pub fn take_reinitialise_needed(&mut self) -> bool {
        std::mem::take(&mut self.reinitialise_needed)
    }

    /// Main loop: blocks on the request queue (bounded get), processes one
    /// sequence to completion (or timeout) before pulling the next.
    pub fn run(&mut self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            match self.receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(request) => self.process(request),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(&mut self, request: SequenceRequest) {
        let start = Instant::now();
        let budget = Duration::from_secs(request.timeout_s);
        let mut outcome = SequenceOutcome::Success;

        for spec in &request.steps {
            if start.elapsed() >= budget {
                outcome = SequenceOutcome::Timeout;
                break;
            }

            match self.run_step_with_retries(spec, start, budget) {
                Ok(()) => {}
                Err(WorkerError::Timeout) => {
                    outcome = SequenceOutcome::Timeout;
                    break;
                }
                Err(e) => {
                    outcome = SequenceOutcome::Failure(e.to_string());
                    break;
                }
            }
        }

        self.record_sequence_outcome(&outcome);
        self.publish_result(request.id, outcome);
    }

    fn run_step_with_retries(&mut self, spec: &StepSpec, seq_start: Instant, seq_budget: Duration) -> Result<(), WorkerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute_step(spec.step, seq_start, seq_budget) {
                Ok(()) => return Ok(()),
                Err(WorkerError::Timeout) => return Err(WorkerError::Timeout),
                Err(e) => {
                    if attempt > spec.retries {
                        return Err(e);
                    }
                    if seq_start.elapsed() >= seq_budget {
                        return Err(WorkerError::Timeout);
                    }
                    let backoff = Duration::from_secs(attempt as u64 * spec.retry_backoff_s);
                    warn!("step {:?} failed (attempt {}), retrying in {:?}: {}", spec.step, attempt, backoff, e);
                    sleep_within_budget(backoff, seq_start, seq_budget)?;
                }
            }
        }
    }

    fn execute_step(&mut self, step: Step, seq_start: Instant, seq_budget: Duration) -> Result<(), WorkerError> {
        match step {
            Step::Sleep { seconds } => sleep_within_budget(Duration::from_secs(seconds), seq_start, seq_budget),
            Step::ChangeOutput { output_id, state, .. } => {
                let (ok, _changed) = self.device.change_output(output_id, state)?;
                if ok {
                    Ok(())
                } else {
                    Err(WorkerError::Step(format!("change_output({}) rejected", output_id)))
                }
            }
            Step::RefreshStatus => self.refresh_status(),
            Step::GetLocation { device_id } => {
                self.device.get_location(device_id)?;
                Ok(())
            }
        }
    }

    /// Iterates all known devices; per-device errors are logged and
    /// tolerated for devices expected offline. After the sweep, a deep copy
    /// of device state becomes the published snapshot atomically.
    fn refresh_status(&mut self) -> Result<(), WorkerError> {
        let mut snapshot = DeviceSnapshot::default();
        let mut any_offline = false;

        for &device_id in &self.device_ids {
            match self.device.refresh(device_id) {
                Ok(info) => {
                    if !info.online && !info.expect_offline {
                        any_offline = true;
                        warn!("device {} unexpectedly offline", device_id);
                    } else if !info.online {
                        any_offline = true;
                    }
                    snapshot.devices.insert(device_id, info);
                }
                Err(e) => {
                    any_offline = true;
                    error!("failed to refresh device {}: {}", device_id, e);
                }
            }
        }

        if self.was_any_offline && !any_offline {
            self.reinitialise_needed = true;
            debug!("all devices back online, flagging reinitialise");
        }
        self.was_any_offline = any_offline;

        *self.snapshot.write().unwrap() = snapshot;
        Ok(())
    }

    fn record_sequence_outcome(&mut self, outcome: &SequenceOutcome) {
        match outcome {
            SequenceOutcome::Success => {
                self.concurrent_errors = 0;
                self.last_failure_first_seen = None;
            }
            SequenceOutcome::Failure(_) | SequenceOutcome::Timeout => {
                self.concurrent_errors += 1;
                let first_seen = *self.last_failure_first_seen.get_or_insert_with(Instant::now);
                if self.concurrent_errors > self.max_concurrent_errors && first_seen.elapsed().as_secs() >= self.report_delay_s {
                    error!(
                        "device worker exceeded MaxConcurrentErrors ({}), a notifiable issue should be raised",
                        self.max_concurrent_errors
                    );
                }
            }
        }
    }

    fn publish_result(&self, id: u64, outcome: SequenceOutcome) {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.remove(&id);
        drop(pending);

        let mut results = self.shared.results.lock().unwrap();
        results.insert(id, SequenceResult { id, outcome });
        self.shared.cv.notify_all();
    }
}

/// Sleeps for `duration`, but in small increments so the sequence's overall
/// timeout budget is re-checked throughout rather than only before/after —
/// a single `Sleep` step (or retry backoff) can't blow past `seq_budget`.
fn sleep_within_budget(duration: Duration, seq_start: Instant, seq_budget: Duration) -> Result<(), WorkerError> {
    let deadline = Instant::now() + duration;
    loop {
        if seq_start.elapsed() >= seq_budget {
            return Err(WorkerError::Timeout);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(BUDGET_POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceInfo;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;

    struct FlakyDevice {
        fail_times: AtomicU32,
    }

    impl Device for FlakyDevice {
        fn refresh(&self, device_id: u32) -> anyhow::Result<DeviceInfo> {
            Ok(DeviceInfo { id: device_id, online: true, expect_offline: false, name: "d".into(), temp_c: None })
        }

        fn change_output(&self, _output_id: u32, _state: OutputState) -> anyhow::Result<(bool, bool)> {
            let n = self.fail_times.fetch_sub(1, Ordering::SeqCst);
            if n > 0 {
                Err(anyhow!("simulated failure"))
            } else {
                Ok((true, true))
            }
        }

        fn get_location(&self, _device_id: u32) -> anyhow::Result<crate::interfaces::DeviceLocation> {
            Ok(crate::interfaces::DeviceLocation { tz: "UTC".into(), lat: 0.0, lon: 0.0 })
        }
    }

    #[test]
    fn retries_succeed_within_budget() {
        let device = Arc::new(FlakyDevice { fail_times: AtomicU32::new(2) });
        let (mut worker, handle) = DeviceWorker::new(device, vec![1], 3, 0);

        let request = SequenceRequest {
            id: 1,
            label: "turn-on".into(),
            steps: vec![StepSpec {
                step: Step::ChangeOutput { output_id: 1, device_id: 1, state: OutputState::On },
                retries: 3,
                retry_backoff_s: 0,
            }],
            timeout_s: 5,
        };
        handle.submit(request);

        worker.process(worker.receiver.recv_timeout(Duration::from_secs(1)).unwrap());
        let result = handle.wait_for_result(1, Duration::from_secs(1)).unwrap();
        assert_eq!(result.outcome, SequenceOutcome::Success);
    }

    #[test]
    fn unknown_id_is_treated_as_completed() {
        let device = Arc::new(FlakyDevice { fail_times: AtomicU32::new(0) });
        let (_worker, handle) = DeviceWorker::new(device, vec![1], 3, 0);
        let result = handle.wait_for_result(999, Duration::from_millis(10)).unwrap();
        assert_eq!(result.outcome, SequenceOutcome::Success);
    }

    #[test]
    fn refresh_status_publishes_snapshot() {
        let device = Arc::new(FlakyDevice { fail_times: AtomicU32::new(0) });
        let (mut worker, _handle) = DeviceWorker::new(device, vec![1, 2], 3, 0);
        worker.refresh_status().unwrap();
        assert_eq!(worker.snapshot().read().unwrap().devices.len(), 2);
    }

    #[test]
    fn overall_timeout_aborts_a_blocking_sleep_step() {
        let device = Arc::new(FlakyDevice { fail_times: AtomicU32::new(0) });
        let (mut worker, handle) = DeviceWorker::new(device, vec![1], 3, 0);

        let request = SequenceRequest {
            id: 1,
            label: "long-sleep".into(),
            steps: vec![StepSpec { step: Step::Sleep { seconds: 5 }, retries: 0, retry_backoff_s: 0 }],
            timeout_s: 1,
        };
        handle.submit(request);

        let start = Instant::now();
        worker.process(worker.receiver.recv_timeout(Duration::from_secs(1)).unwrap());
        let elapsed = start.elapsed();

        let result = handle.wait_for_result(1, Duration::from_secs(1)).unwrap();
        assert_eq!(result.outcome, SequenceOutcome::Timeout);
        assert!(elapsed < Duration::from_secs(2), "timeout should abort the sleep, not run it to completion: {:?}", elapsed);
    }

    struct AlwaysFailDevice {
        attempts: AtomicU32,
    }

    impl Device for AlwaysFailDevice {
        fn refresh(&self, device_id: u32) -> anyhow::Result<DeviceInfo> {
            Ok(DeviceInfo { id: device_id, online: true, expect_offline: false, name: "d".into(), temp_c: None })
        }

        fn change_output(&self, _output_id: u32, _state: OutputState) -> anyhow::Result<(bool, bool)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("always fails"))
        }

        fn get_location(&self, _device_id: u32) -> anyhow::Result<crate::interfaces::DeviceLocation> {
            Ok(crate::interfaces::DeviceLocation { tz: "UTC".into(), lat: 0.0, lon: 0.0 })
        }
    }

    #[test]
    fn a_step_that_never_succeeds_fails_after_retries_are_exhausted() {
        let device = Arc::new(AlwaysFailDevice { attempts: AtomicU32::new(0) });
        let (mut worker, handle) = DeviceWorker::new(device.clone(), vec![1], 3, 0);

        let request = SequenceRequest {
            id: 1,
            label: "never-succeeds".into(),
            steps: vec![StepSpec {
                step: Step::ChangeOutput { output_id: 1, device_id: 1, state: OutputState::On },
                retries: 1,
                retry_backoff_s: 0,
            }],
            timeout_s: 5,
        };
        handle.submit(request);

        worker.process(worker.receiver.recv_timeout(Duration::from_secs(1)).unwrap());
        let result = handle.wait_for_result(1, Duration::from_secs(1)).unwrap();

        assert!(matches!(result.outcome, SequenceOutcome::Failure(_)));
        assert_eq!(device.attempts.load(Ordering::SeqCst), 2);
    }

    struct TimestampDevice {
        intervals: Mutex<Vec<(Instant, Instant)>>,
    }

    impl Device for TimestampDevice {
        fn refresh(&self, device_id: u32) -> anyhow::Result<DeviceInfo> {
            Ok(DeviceInfo { id: device_id, online: true, expect_offline: false, name: "d".into(), temp_c: None })
        }

        fn change_output(&self, _output_id: u32, _state: OutputState) -> anyhow::Result<(bool, bool)> {
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(50));
            self.intervals.lock().unwrap().push((start, Instant::now()));
            Ok((true, true))
        }

        fn get_location(&self, _device_id: u32) -> anyhow::Result<crate::interfaces::DeviceLocation> {
            Ok(crate::interfaces::DeviceLocation { tz: "UTC".into(), lat: 0.0, lon: 0.0 })
        }
    }

    #[test]
    fn sequences_are_processed_strictly_serially() {
        let device = Arc::new(TimestampDevice { intervals: Mutex::new(Vec::new()) });
        let (mut worker, handle) = DeviceWorker::new(device.clone(), vec![1], 3, 0);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_run = stop.clone();
        let run_thread = std::thread::spawn(move || worker.run(stop_for_run));

        for id in 1..=3u64 {
            handle.submit(SequenceRequest {
                id,
                label: format!("seq-{}", id),
                steps: vec![StepSpec {
                    step: Step::ChangeOutput { output_id: 1, device_id: 1, state: OutputState::On },
                    retries: 0,
                    retry_backoff_s: 0,
                }],
                timeout_s: 5,
            });
        }

        for id in 1..=3u64 {
            let result = handle.wait_for_result(id, Duration::from_secs(2)).unwrap();
            assert_eq!(result.outcome, SequenceOutcome::Success);
        }

        stop.store(true, Ordering::Relaxed);
        run_thread.join().unwrap();

        let intervals = device.intervals.lock().unwrap();
        assert_eq!(intervals.len(), 3);
        let mut sorted = intervals.clone();
        sorted.sort_by_key(|(start, _)| *start);
        for pair in sorted.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start >= prev_end, "overlapping device calls: {:?}", pair);
        }
    }
}
