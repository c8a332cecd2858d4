use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single network device as seen by the `DeviceWorker`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub online: bool,
    pub expect_offline: bool,
    pub name: String,
    pub temp_c: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    On,
    Off,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputInfo {
    pub id: u32,
    pub device_id: u32,
    pub state: OutputState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputState {
    On,
    Off,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputInfo {
    pub id: u32,
    pub state: InputState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeterInfo {
    pub id: u32,
    pub energy_wh: f64,
    pub power_w: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TempProbeInfo {
    pub id: u32,
    pub temp_c: f64,
    pub last_reading_ts: DateTime<Local>,
}

/// Immutable value built each tick from the worker's deep copy of device state.
/// Readers never mutate it; a new one replaces the old one atomically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub devices: HashMap<u32, DeviceInfo>,
    pub outputs: HashMap<u32, OutputInfo>,
    pub inputs: HashMap<u32, InputInfo>,
    pub meters: HashMap<u32, MeterInfo>,
    pub temp_probes: HashMap<u32, TempProbeInfo>,
}

/// A contiguous time interval with a single price.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceSlot {
    pub date: NaiveDate,
    pub start_dt: DateTime<Local>,
    pub end_dt: DateTime<Local>,
    pub minutes: i64,
    pub price_per_kwh: f64,
}

impl PriceSlot {
    pub fn new(start_dt: DateTime<Local>, end_dt: DateTime<Local>, price_per_kwh: f64) -> Self {
        let minutes = (end_dt - start_dt).num_minutes();
        PriceSlot {
            date: start_dt.date_naive(),
            start_dt,
            end_dt,
            minutes,
            price_per_kwh,
        }
    }
}

/// A slot that has survived selection/consolidation and carries the derived
/// per-slot fields the RunPlanner accumulates along the way.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSlot {
    pub slot: PriceSlot,
    pub forecast_energy_wh: f64,
    pub estimated_cost: f64,
    pub weighted_price_minutes: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPlanSource {
    BestPrice,
    Schedule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPlanStatus {
    Nothing,
    Failed,
    Partial,
    Ready,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunPlan {
    pub source: RunPlanSource,
    pub channel: Option<String>,
    pub status: RunPlanStatus,
    pub required_hours: f64,
    pub priority_hours: f64,
    pub planned_hours: f64,
    pub remaining_hours: f64,
    pub next_start_dt: Option<DateTime<Local>>,
    pub next_stop_dt: Option<DateTime<Local>>,
    pub forecast_avg_price: f64,
    pub forecast_energy_wh: f64,
    pub estimated_cost: f64,
    pub slots: Vec<PlanSlot>,
}

impl RunPlan {
    /// Returns the slot containing `now` and whether it makes the output
    /// eligible to run right now.
    pub fn get_current_slot(&self, now: DateTime<Local>) -> (Option<&PlanSlot>, bool) {
        match self.slots.iter().find(|s| s.slot.start_dt <= now && now < s.slot.end_dt) {
            Some(s) => (Some(s), true),
            None => (None, false),
        }
    }
}

/// A named set of daily time windows with optional prices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_time: String,
    pub end_time: String,
    pub price: Option<f64>,
    pub days_of_week: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleDef {
    pub name: String,
    pub windows: Vec<ScheduleWindow>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    Auto,
    AppOverride,
    InputOverride,
    DateOff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReasonOn {
    ActiveRunPlan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReasonOff {
    DeviceOffline,
    NoRunPlan,
    RunPlanComplete,
    InactiveRunPlan,
    ParentOff,
    TempProbeConstraint,
    MinOnTime,
    MinOffTime,
    DateOff,
    AppOverride,
    InputOverride,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReason {
    On(StateReasonOn),
    Off(StateReasonOff),
}

/// Why a run closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonStopped {
    DayEnd,
    StatusChange,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonStarted {
    DayStart,
    StatusChange,
    Manual,
}

/// One continuous ON interval of an output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub system_state: SystemState,
    pub reason_started: ReasonStarted,
    pub reason_stopped: Option<ReasonStopped>,
    pub start_dt: DateTime<Local>,
    pub end_dt: Option<DateTime<Local>>,
    pub actual_hours: f64,
    pub meter_at_start: f64,
    pub prior_meter_read: f64,
    pub energy_wh: f64,
    pub total_cost: f64,
    pub average_price: f64,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.end_dt.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub target_hours: f64,
    pub prior_shortfall: f64,
    pub actual_hours: f64,
    pub energy_wh: f64,
    pub total_cost: f64,
    pub average_price: f64,
    pub device_runs: Vec<Run>,
}

impl DayRecord {
    pub fn open_run_mut(&mut self) -> Option<&mut Run> {
        self.device_runs.last_mut().filter(|r| r.is_open())
    }

    pub fn open_run(&self) -> Option<&Run> {
        self.device_runs.last().filter(|r| r.is_open())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Totals {
    pub actual_hours: f64,
    pub energy_wh: f64,
    pub total_cost: f64,
    pub average_price: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct History {
    pub days: Vec<DayRecord>,
    pub current: Totals,
    pub earlier: Totals,
    pub alltime: Totals,
}

impl Default for History {
    fn default() -> Self {
        History {
            days: Vec::new(),
            current: Totals::default(),
            earlier: Totals::default(),
            alltime: Totals::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputActionType {
    TurnOn,
    TurnOff,
    UpdateOnState,
    UpdateOffState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputAction {
    pub action_type: OutputActionType,
    pub system_state: SystemState,
    pub reason: StateReason,
    pub request: Option<crate::device_worker::SequenceRequest>,
    pub worker_request_id: Option<u64>,
}

/// A notifiable issue raised by shortfall, concurrent-error thresholds, etc.
/// The core only tracks whether one is open; delivery is ambient (`notify.rs`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifiableIssue {
    pub kind: String,
    pub message: String,
    pub raised_at: DateTime<Local>,
    pub cleared_at: Option<DateTime<Local>>,
}

impl NotifiableIssue {
    pub fn open(kind: &str, message: String) -> Self {
        NotifiableIssue {
            kind: kind.to_string(),
            message,
            raised_at: Local::now(),
            cleared_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.cleared_at.is_none()
    }

    pub fn clear(&mut self) {
        self.cleared_at = Some(Local::now());
    }
}
