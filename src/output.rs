//! OutputManager: per-output decision function plus the glue that turns a
//! RunPlan and live snapshot into on/off actions.

pub mod errors;

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Local, NaiveDate};
use log::debug;

use crate::config::{AmberChannel, InputMode, OutputConfig, OutputMode, OutputSequence, StepConfig, StepType, TempCondition};
use crate::device_worker::{SequenceRequest, Step, StepSpec};
use crate::history::RunHistory;
use crate::interfaces::{AdminOutputMode, ChannelType};
use crate::manager_pricing::PricingManager;
use crate::models::{
    DeviceSnapshot, History, OutputAction, OutputActionType, OutputState, RunPlan, RunPlanStatus, StateReason, StateReasonOff,
    StateReasonOn, SystemState,
};
use crate::scheduler::Scheduler;

use errors::OutputError;

const RUNPLAN_CHECK_INTERVAL_MINUTES: i64 = 15;
const FAILED_RUNPLAN_CHECK_INTERVAL_MINUTES: i64 = 5;
const PRICE_RISE_INVALIDATION_RATIO: f64 = 1.10;

pub struct ResolvedIds {
    pub output_id: u32,
    pub device_id: u32,
    pub meter_id: Option<u32>,
    pub input_id: Option<u32>,
    pub temp_probe_ids: HashMap<String, u32>,
}

pub struct OutputManager {
    config: OutputConfig,
    ids: ResolvedIds,
    history: RunHistory,
    run_plan: Option<RunPlan>,
    app_mode: AdminOutputMode,
    app_mode_revert_at: Option<DateTime<Local>>,
    last_known_on: bool,
    last_transition_at: Option<DateTime<Local>>,
    last_system_state: SystemState,
    last_reason: StateReason,
    last_device_online: bool,
    next_runplan_check: DateTime<Local>,
    active_slot_entry_price: Option<f64>,
    pending_request_id: Option<u64>,
    next_sequence_id: u64,
}

impl OutputManager {
    pub fn new(config: OutputConfig, ids: ResolvedIds, saved_history: Option<History>, history_days: usize, now: DateTime<Local>) -> Self {
        let target_hours = config.target_hours;
        // Requests are submitted onto a DeviceWorker shared by every output on
        // the same physical device, so ids are namespaced per output to avoid
        // two outputs' sequences colliding in the worker's pending/result maps.
        let next_sequence_id = (ids.output_id as u64 + 1) * 1_000_000;
        OutputManager {
            config,
            ids,
            history: RunHistory::new(saved_history, target_hours, history_days, now),
            run_plan: None,
            app_mode: AdminOutputMode::Auto,
            app_mode_revert_at: None,
            last_known_on: false,
            last_transition_at: None,
            last_system_state: SystemState::Auto,
            last_reason: StateReason::Off(StateReasonOff::NoRunPlan),
            last_device_online: true,
            next_runplan_check: now,
            active_slot_entry_price: None,
            pending_request_id: None,
            next_sequence_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn parent_output(&self) -> Option<&str> {
        self.config.parent_output.as_deref()
    }

    pub fn stop_on_exit(&self) -> bool {
        self.config.stop_on_exit
    }

    pub fn is_on(&self) -> bool {
        self.last_known_on
    }

    pub fn system_state(&self) -> SystemState {
        self.last_system_state
    }

    pub fn reason(&self) -> StateReason {
        self.last_reason
    }

    pub fn last_changed(&self) -> Option<DateTime<Local>> {
        self.last_transition_at
    }

    pub fn app_mode(&self) -> AdminOutputMode {
        self.app_mode
    }

    pub fn app_mode_revert_at(&self) -> Option<DateTime<Local>> {
        self.app_mode_revert_at
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn output_id(&self) -> u32 {
        self.ids.output_id
    }

    pub fn pending_request_id(&self) -> Option<u64> {
        self.pending_request_id
    }

    pub fn set_pending_request_id(&mut self, id: u64) {
        self.pending_request_id = Some(id);
    }

    pub fn clear_pending(&mut self) {
        self.pending_request_id = None;
    }

    /// The price this output is currently being billed at, resolved per its
    /// configured mode (Amber channel spot price, or the schedule's window
    /// price for the current time).
    pub fn current_price(&self, pricing: &PricingManager, scheduler: &Scheduler, now: DateTime<Local>) -> f64 {
        match self.config.mode {
            OutputMode::BestPrice => {
                let channel = match self.config.amber_channel {
                    Some(AmberChannel::General) => ChannelType::General,
                    Some(AmberChannel::ControlledLoad) => ChannelType::ControlledLoad,
                    None => ChannelType::General,
                };
                pricing.get_current_price(channel)
            }
            OutputMode::Schedule => {
                let schedule_name = self.config.schedule.as_deref().unwrap_or_default();
                scheduler.get_current_price(schedule_name, now)
            }
        }
    }

    pub fn set_app_mode(&mut self, mode: AdminOutputMode, revert_at: Option<DateTime<Local>>) {
        self.app_mode = mode;
        self.app_mode_revert_at = revert_at;
    }

    /// Restores the last-known on/off state, reason and admin override from a
    /// previously persisted save, so a restarted process doesn't momentarily
    /// forget it was e.g. under an AppOverride before its first tick runs.
    pub fn restore(&mut self, saved: &crate::state::SavedOutputState) {
        self.last_known_on = saved.is_on;
        self.last_transition_at = saved.last_changed;
        self.last_system_state = saved.system_state;
        self.last_reason = saved.reason;
        self.app_mode = saved.app_mode;
        self.app_mode_revert_at = saved.app_mode_revert_time;
    }

    /// Updates today's run totals from the current meter reading.
    pub fn calculate_running_totals(&mut self, snapshot: &DeviceSnapshot, current_price: f64, now: DateTime<Local>) {
        let meter_reading = self
            .ids
            .meter_id
            .and_then(|id| snapshot.meters.get(&id))
            .map(|m| m.energy_wh)
            .unwrap_or(0.0);
        self.history.tick(meter_reading, current_price, now);
    }

    /// Regenerates the run plan when any invalidation trigger fires.
    pub fn review_run_plan(
        &mut self,
        pricing: &PricingManager,
        scheduler: &Scheduler,
        snapshot: &DeviceSnapshot,
        now: DateTime<Local>,
        config_changed: bool,
    ) -> Result<(), OutputError> {
        let online = snapshot.devices.get(&self.ids.device_id).map(|d| d.online).unwrap_or(false);
        let device_came_online = online && !self.last_device_online;
        self.last_device_online = online;

        if !self.needs_refresh(now, config_changed, device_came_online) {
            return Ok(());
        }

        let actual_hours = self.history.actual_hours_today();
        let prior_shortfall = self.history.prior_shortfall_today();
        let (required_hours, priority_hours) = self.resolve_required_and_priority_hours(actual_hours, prior_shortfall, now);
        let hourly_energy_usage = self.ids.meter_id.and_then(|id| snapshot.meters.get(&id)).map(|m| m.power_w).unwrap_or(0.0);

        let plan = match self.config.mode {
            OutputMode::BestPrice => {
                let channel = match self.config.amber_channel {
                    Some(AmberChannel::General) => ChannelType::General,
                    Some(AmberChannel::ControlledLoad) => ChannelType::ControlledLoad,
                    None => ChannelType::General,
                };
                let channel_name = self.config.amber_channel.map(|c| format!("{:?}", c)).unwrap_or_default();
                pricing
                    .get_run_plan(
                        channel,
                        &channel_name,
                        now,
                        required_hours,
                        priority_hours,
                        self.config.max_best_price,
                        self.config.max_priority_price,
                        hourly_energy_usage,
                    )
                    .map_err(|e| OutputError::Planning(e.to_string()))?
            }
            OutputMode::Schedule => {
                let schedule_name = self.config.schedule.as_deref().unwrap_or_default();
                scheduler
                    .get_run_plan(
                        schedule_name,
                        now,
                        required_hours,
                        priority_hours,
                        self.config.max_best_price,
                        self.config.max_priority_price,
                        hourly_energy_usage,
                        0,
                        0,
                    )
                    .map_err(|e| OutputError::Planning(e.to_string()))?
                    .ok_or_else(|| OutputError::Planning(format!("unknown schedule '{}'", schedule_name)))?
            }
        };

        let interval = if plan.status == RunPlanStatus::Failed || plan.status == RunPlanStatus::Partial {
            FAILED_RUNPLAN_CHECK_INTERVAL_MINUTES
        } else {
            RUNPLAN_CHECK_INTERVAL_MINUTES
        };
        self.next_runplan_check = now + chrono::Duration::minutes(interval);
        self.active_slot_entry_price = plan.get_current_slot(now).0.map(|s| s.slot.price_per_kwh);
        self.run_plan = Some(plan);

        Ok(())
    }

    fn needs_refresh(&self, now: DateTime<Local>, config_changed: bool, device_came_online: bool) -> bool {
        if config_changed || device_came_online {
            return true;
        }
        let plan = match &self.run_plan {
            None => return true,
            Some(p) => p,
        };
        if plan.slots.first().map(|s| s.slot.date) != Some(now.date_naive()) && !plan.slots.is_empty() {
            return true;
        }
        if now >= self.next_runplan_check {
            return true;
        }
        let (slot, run_now) = plan.get_current_slot(now);
        if run_now {
            if let (Some(slot), Some(entry_price)) = (slot, self.active_slot_entry_price) {
                if slot.slot.price_per_kwh > entry_price * PRICE_RISE_INVALIDATION_RATIO {
                    return true;
                }
            }
        } else if self.last_known_on {
            // we were running but the active slot under which we started has disappeared
            return true;
        }
        false
    }

    fn month_name(date: NaiveDate) -> &'static str {
        const NAMES: [&str; 12] = [
            "January", "February", "March", "April", "May", "June", "July", "August", "September", "October", "November", "December",
        ];
        NAMES[date.month0() as usize]
    }

    fn target_hours(&self, now: DateTime<Local>) -> f64 {
        let month = Self::month_name(now.date_naive());
        let target = self
            .config
            .monthly_target_hours
            .as_ref()
            .and_then(|m| m.get(month))
            .copied()
            .unwrap_or(self.config.target_hours);
        if target < 0.0 {
            target
        } else {
            target.min(self.config.max_hours)
        }
    }

    fn resolve_required_and_priority_hours(&self, actual_hours: f64, prior_shortfall: f64, now: DateTime<Local>) -> (f64, f64) {
        let target = self.target_hours(now);
        if target < 0.0 {
            let priority = (self.config.min_hours - actual_hours).max(0.0);
            (-1.0, priority)
        } else {
            let required = (target - actual_hours + prior_shortfall).clamp(0.0, self.config.max_hours);
            let priority = (self.config.min_hours - actual_hours).max(0.0).min(required);
            (required, priority)
        }
    }

    fn is_date_off(&self, now: DateTime<Local>) -> bool {
        let today = now.date_naive();
        self.config.dates_off.iter().any(|range| {
            let start = range.start_date.parse::<NaiveDate>();
            let end = range.end_date.parse::<NaiveDate>();
            match (start, end) {
                (Ok(s), Ok(e)) => today >= s && today <= e,
                _ => false,
            }
        })
    }

    /// The precedence-ordered decision function. Returns the proposed state,
    /// the systemState it was reached under, and the reason.
    pub fn evaluate_conditions(&mut self, snapshot: &DeviceSnapshot, now: DateTime<Local>, parent_on: Option<bool>) -> (OutputState, SystemState, StateReason) {
        let online = snapshot.devices.get(&self.ids.device_id).map(|d| d.online).unwrap_or(false);
        if !online {
            return self.settle(OutputState::Off, SystemState::Auto, StateReason::Off(StateReasonOff::DeviceOffline), now);
        }

        if self.app_mode_revert_at.map(|t| now >= t).unwrap_or(false) {
            self.app_mode = AdminOutputMode::Auto;
            self.app_mode_revert_at = None;
        }
        match self.app_mode {
            AdminOutputMode::On => {
                return self.settle(OutputState::On, SystemState::AppOverride, StateReason::On(StateReasonOn::ActiveRunPlan), now);
            }
            AdminOutputMode::Off => {
                return self.settle(OutputState::Off, SystemState::AppOverride, StateReason::Off(StateReasonOff::AppOverride), now);
            }
            AdminOutputMode::Auto => {}
        }

        if let (Some(input_id), Some(mode)) = (self.ids.input_id, self.config.device_input_mode) {
            if let Some(input) = snapshot.inputs.get(&input_id) {
                let input_on = input.state == crate::models::InputState::On;
                match mode {
                    InputMode::TurnOn if input_on => {
                        return self.settle(OutputState::On, SystemState::InputOverride, StateReason::On(StateReasonOn::ActiveRunPlan), now);
                    }
                    InputMode::TurnOff if input_on => {
                        return self.settle(OutputState::Off, SystemState::InputOverride, StateReason::Off(StateReasonOff::InputOverride), now);
                    }
                    _ => {}
                }
            }
        }

        if self.is_date_off(now) {
            return self.settle(OutputState::Off, SystemState::DateOff, StateReason::Off(StateReasonOff::DateOff), now);
        }

        let (mut state, system_state, mut reason) = self.auto_decision(now);

        if state == OutputState::On {
            if parent_on == Some(false) {
                state = OutputState::Off;
                reason = StateReason::Off(StateReasonOff::ParentOff);
            } else if self.violates_temp_constraints(snapshot) {
                state = OutputState::Off;
                reason = StateReason::Off(StateReasonOff::TempProbeConstraint);
            }
        }

        (state, system_state, reason) = self.apply_dwell_guard(state, system_state, reason, now);

        self.settle(state, system_state, reason, now)
    }

    fn auto_decision(&self, now: DateTime<Local>) -> (OutputState, SystemState, StateReason) {
        match &self.run_plan {
            None => (OutputState::Off, SystemState::Auto, StateReason::Off(StateReasonOff::NoRunPlan)),
            Some(plan) => match plan.status {
                RunPlanStatus::Failed => (OutputState::Off, SystemState::Auto, StateReason::Off(StateReasonOff::NoRunPlan)),
                RunPlanStatus::Nothing => (OutputState::Off, SystemState::Auto, StateReason::Off(StateReasonOff::RunPlanComplete)),
                RunPlanStatus::Partial | RunPlanStatus::Ready => {
                    let (_, run_now) = plan.get_current_slot(now);
                    if run_now {
                        (OutputState::On, SystemState::Auto, StateReason::On(StateReasonOn::ActiveRunPlan))
                    } else {
                        (OutputState::Off, SystemState::Auto, StateReason::Off(StateReasonOff::InactiveRunPlan))
                    }
                }
            },
        }
    }

    fn violates_temp_constraints(&self, snapshot: &DeviceSnapshot) -> bool {
        for constraint in &self.config.temp_probe_constraints {
            let probe_id = match self.ids.temp_probe_ids.get(&constraint.temp_probe) {
                Some(id) => *id,
                None => continue,
            };
            let reading = snapshot.temp_probes.get(&probe_id).map(|p| p.temp_c);
            let blocked = match constraint.condition {
                TempCondition::GreaterThan => reading.map(|t| t < constraint.temperature).unwrap_or(true),
                TempCondition::LessThan => reading.map(|t| t > constraint.temperature).unwrap_or(false),
            };
            if blocked {
                return true;
            }
        }
        false
    }

    fn apply_dwell_guard(&self, state: OutputState, system_state: SystemState, reason: StateReason, now: DateTime<Local>) -> (OutputState, SystemState, StateReason) {
        let desired_on = state == OutputState::On;
        if desired_on == self.last_known_on {
            return (state, system_state, reason);
        }
        let elapsed = self
            .last_transition_at
            .map(|t| (now - t).num_seconds())
            .unwrap_or(i64::MAX);

        if desired_on && elapsed < self.config.min_off_time as i64 {
            debug!("output '{}' holding off, {}s remaining of MinOffTime", self.config.name, self.config.min_off_time as i64 - elapsed);
            return (OutputState::Off, system_state, StateReason::Off(StateReasonOff::MinOffTime));
        }
        if !desired_on && elapsed < self.config.min_on_time as i64 {
            debug!("output '{}' holding on, {}s remaining of MinOnTime", self.config.name, self.config.min_on_time as i64 - elapsed);
            return (OutputState::On, system_state, StateReason::On(StateReasonOn::ActiveRunPlan));
        }
        (state, system_state, reason)
    }

    fn settle(&mut self, state: OutputState, system_state: SystemState, reason: StateReason, now: DateTime<Local>) -> (OutputState, SystemState, StateReason) {
        let is_on = state == OutputState::On;
        if is_on != self.last_known_on {
            self.last_transition_at = Some(now);
            if is_on {
                self.history.start_run(system_state, StateReasonOn::ActiveRunPlan, 0.0, now);
            } else if let StateReason::Off(reason_off) = reason {
                self.history.stop_run(reason_off, 0.0, 0.0, now);
            }
        }
        self.last_known_on = is_on;
        self.last_system_state = system_state;
        self.last_reason = reason;
        (state, system_state, reason)
    }

    /// Builds the OutputAction for a decision, collapsing to an
    /// `Update*State` when the physical output already matches.
    pub fn build_action(
        &mut self,
        state: OutputState,
        system_state: SystemState,
        reason: StateReason,
        snapshot: &DeviceSnapshot,
        sequences: &HashMap<String, OutputSequence>,
    ) -> OutputAction {
        let physical_on = snapshot.outputs.get(&self.ids.output_id).map(|o| o.state == OutputState::On);

        if physical_on == Some(state == OutputState::On) {
            let action_type = if state == OutputState::On { OutputActionType::UpdateOnState } else { OutputActionType::UpdateOffState };
            return OutputAction { action_type, system_state, reason, request: None, worker_request_id: None };
        }

        let action_type = if state == OutputState::On { OutputActionType::TurnOn } else { OutputActionType::TurnOff };
        let sequence_name = if state == OutputState::On { &self.config.turn_on_sequence } else { &self.config.turn_off_sequence };

        let request = match sequence_name.as_ref().and_then(|name| sequences.get(name)) {
            Some(seq) => self.build_request_from_sequence(seq),
            None => self.synthetic_request(state),
        };

        OutputAction { action_type, system_state, reason, request: Some(request), worker_request_id: None }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }

    fn synthetic_request(&mut self, state: OutputState) -> SequenceRequest {
        let id = self.next_id();
        SequenceRequest {
            id,
            label: format!("{}-{}", self.config.name, if state == OutputState::On { "on" } else { "off" }),
            steps: vec![StepSpec {
                step: Step::ChangeOutput { output_id: self.ids.output_id, device_id: self.ids.device_id, state },
                retries: 0,
                retry_backoff_s: 0,
            }],
            timeout_s: 30,
        }
    }

    fn build_request_from_sequence(&mut self, seq: &OutputSequence) -> SequenceRequest {
        let id = self.next_id();
        let steps = seq.steps.iter().map(|s| self.step_spec_from_config(s)).collect();
        SequenceRequest { id, label: seq.name.clone(), steps, timeout_s: seq.timeout }
    }

    fn step_spec_from_config(&self, cfg: &StepConfig) -> StepSpec {
        let step = match cfg.step_type {
            StepType::Sleep | StepType::Delay => Step::Sleep { seconds: cfg.seconds.unwrap_or(0) },
            StepType::ChangeOutput => Step::ChangeOutput {
                output_id: self.ids.output_id,
                device_id: self.ids.device_id,
                state: if cfg.state.unwrap_or(false) { OutputState::On } else { OutputState::Off },
            },
            StepType::RefreshStatus => Step::RefreshStatus,
            StepType::GetLocation => Step::GetLocation { device_id: self.ids.device_id },
        };
        StepSpec { step, retries: cfg.retries.unwrap_or(0), retry_backoff_s: cfg.retry_backoff.unwrap_or(0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceInfo, OutputInfo};
    use chrono::TimeZone;

    fn base_config() -> OutputConfig {
        OutputConfig {
            name: "hot_water".into(),
            device_output: "relay1".into(),
            mode: OutputMode::BestPrice,
            schedule: None,
            constraint_schedule: None,
            amber_channel: Some(AmberChannel::General),
            target_hours: 2.0,
            monthly_target_hours: None,
            min_hours: 1.0,
            max_hours: 4.0,
            max_shortfall_hours: 2.0,
            max_best_price: 30.0,
            max_priority_price: 40.0,
            dates_off: vec![],
            device_meter: None,
            device_input: None,
            device_input_mode: None,
            parent_output: None,
            stop_on_exit: true,
            min_on_time: 0,
            min_off_time: 0,
            max_app_on_time: None,
            max_app_off_time: None,
            turn_on_sequence: None,
            turn_off_sequence: None,
            temp_probe_constraints: vec![],
        }
    }

    fn ids() -> ResolvedIds {
        ResolvedIds { output_id: 1, device_id: 1, meter_id: None, input_id: None, temp_probe_ids: HashMap::new() }
    }

    fn online_snapshot() -> DeviceSnapshot {
        let mut snap = DeviceSnapshot::default();
        snap.devices.insert(1, DeviceInfo { id: 1, online: true, expect_offline: false, name: "d".into(), temp_c: None });
        snap.outputs.insert(1, OutputInfo { id: 1, device_id: 1, state: OutputState::Off });
        snap
    }

    #[test]
    fn device_offline_blocks_app_override() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut mgr = OutputManager::new(base_config(), ids(), None, 30, now);
        mgr.set_app_mode(AdminOutputMode::On, None);

        let mut snap = online_snapshot();
        snap.devices.get_mut(&1).unwrap().online = false;

        let (state, _sys, reason) = mgr.evaluate_conditions(&snap, now, None);
        assert_eq!(state, OutputState::Off);
        assert_eq!(reason, StateReason::Off(StateReasonOff::DeviceOffline));
    }

    #[test]
    fn app_override_reverts_after_deadline() {
        let t0 = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut mgr = OutputManager::new(base_config(), ids(), None, 30, t0);
        mgr.set_app_mode(AdminOutputMode::On, Some(t0 + chrono::Duration::minutes(10)));
        let snap = online_snapshot();

        let (state, system_state, _) = mgr.evaluate_conditions(&snap, t0, None);
        assert_eq!(state, OutputState::On);
        assert_eq!(system_state, SystemState::AppOverride);

        let t1 = t0 + chrono::Duration::minutes(11);
        let (_, system_state, _) = mgr.evaluate_conditions(&snap, t1, None);
        assert_eq!(system_state, SystemState::Auto);
    }

    #[test]
    fn dates_off_wins_over_active_run_plan() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut config = base_config();
        config.dates_off = vec![crate::config::DateRange { start_date: "2026-01-01".into(), end_date: "2026-01-31".into() }];
        let mut mgr = OutputManager::new(config, ids(), None, 30, now);
        let snap = online_snapshot();

        let (state, system_state, reason) = mgr.evaluate_conditions(&snap, now, None);
        assert_eq!(state, OutputState::Off);
        assert_eq!(system_state, SystemState::DateOff);
        assert_eq!(reason, StateReason::Off(StateReasonOff::DateOff));
    }

    #[test]
    fn parent_off_forces_child_off() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut config = base_config();
        config.parent_output = Some("pump".into());
        let mut mgr = OutputManager::new(config, ids(), None, 30, now);
        mgr.run_plan = Some(ready_plan(now));
        let snap = online_snapshot();

        let (state, _, reason) = mgr.evaluate_conditions(&snap, now, Some(false));
        assert_eq!(state, OutputState::Off);
        assert_eq!(reason, StateReason::Off(StateReasonOff::ParentOff));
    }

    #[test]
    fn min_off_time_holds_output_off() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut config = base_config();
        config.min_off_time = 300;
        let mut mgr = OutputManager::new(config, ids(), None, 30, now);
        mgr.last_known_on = false;
        mgr.last_transition_at = Some(now - chrono::Duration::minutes(2));
        mgr.run_plan = Some(ready_plan(now));
        let snap = online_snapshot();

        let (state, _, reason) = mgr.evaluate_conditions(&snap, now, None);
        assert_eq!(state, OutputState::Off);
        assert_eq!(reason, StateReason::Off(StateReasonOff::MinOffTime));
    }

    #[test]
    fn temp_probe_constraint_blocks_then_clears() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let mut config = base_config();
        config.temp_probe_constraints = vec![crate::config::TempProbeConstraint {
            temp_probe: "tank".into(),
            condition: TempCondition::GreaterThan,
            temperature: 30.0,
        }];
        let mut ids = ids();
        ids.temp_probe_ids.insert("tank".into(), 5);
        let mut mgr = OutputManager::new(config, ids, None, 30, now);
        mgr.run_plan = Some(ready_plan(now));

        let mut snap = online_snapshot();
        snap.temp_probes.insert(5, crate::models::TempProbeInfo { id: 5, temp_c: 25.0, last_reading_ts: now });
        let (state, _, reason) = mgr.evaluate_conditions(&snap, now, None);
        assert_eq!(state, OutputState::Off);
        assert_eq!(reason, StateReason::Off(StateReasonOff::TempProbeConstraint));

        snap.temp_probes.insert(5, crate::models::TempProbeInfo { id: 5, temp_c: 35.0, last_reading_ts: now });
        let (state, _, _) = mgr.evaluate_conditions(&snap, now, None);
        assert_eq!(state, OutputState::On);
    }

    fn ready_plan(now: DateTime<Local>) -> RunPlan {
        use crate::models::{PlanSlot, PriceSlot, RunPlanSource};
        let start = now - chrono::Duration::minutes(5);
        let end = now + chrono::Duration::minutes(25);
        let slot = PriceSlot::new(start, end, 20.0);
        RunPlan {
            source: RunPlanSource::BestPrice,
            channel: None,
            status: RunPlanStatus::Ready,
            required_hours: 0.5,
            priority_hours: 0.0,
            planned_hours: 0.5,
            remaining_hours: 0.4,
            next_start_dt: Some(start),
            next_stop_dt: Some(end),
            forecast_avg_price: 20.0,
            forecast_energy_wh: 1000.0,
            estimated_cost: 0.2,
            slots: vec![PlanSlot { slot, forecast_energy_wh: 1000.0, estimated_cost: 0.2, weighted_price_minutes: 600.0 }],
        }
    }
}
