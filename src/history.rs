//! RunHistory: tracks actual run time, energy and cost per output, rolling
//! a fixed window of days and carrying shortfall hours forward.

use chrono::{DateTime, Duration, Local, NaiveTime};
use log::debug;

use crate::models::{DayRecord, History, ReasonStarted, ReasonStopped, Run, StateReasonOff, StateReasonOn, SystemState, Totals};

pub struct RunHistory {
    history: History,
    last_tick: DateTime<Local>,
    last_meter_read: f64,
    target_hours: f64,
    history_days: usize,
}

impl RunHistory {
    /// Builds a RunHistory, seeded from a previously persisted `History` or
    /// an empty one if this is the first run.
    ///
    /// # Arguments
    ///
    /// * 'saved' - a previously persisted history, if any
    /// * 'target_hours' - the output's configured TargetHours (-1 means "all hours")
    /// * 'history_days' - number of days of DailyData to retain before rolling off into EarlierTotals
    /// * 'now' - the instant construction happens at
    pub fn new(saved: Option<History>, target_hours: f64, history_days: usize, now: DateTime<Local>) -> Self {
        RunHistory {
            history: saved.unwrap_or_default(),
            last_tick: now,
            last_meter_read: 0.0,
            target_hours,
            history_days,
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn current_totals(&self) -> &Totals {
        &self.history.current
    }

    pub fn actual_hours_today(&self) -> f64 {
        self.history.days.last().map(|d| d.actual_hours).unwrap_or(0.0)
    }

    pub fn prior_shortfall_today(&self) -> f64 {
        self.history.days.last().map(|d| d.prior_shortfall).unwrap_or(0.0)
    }

    fn get_current_run_mut(&mut self) -> Option<&mut Run> {
        self.history.days.last_mut().and_then(|d| d.open_run_mut())
    }

    fn get_current_run(&self) -> Option<&Run> {
        self.history.days.last().and_then(|d| d.open_run())
    }

    fn ensure_today(&mut self, now: DateTime<Local>) {
        let today = now.date_naive();
        if self.history.days.last().map(|d| d.date) != Some(today) {
            self.history.days.push(DayRecord {
                date: today,
                target_hours: self.target_hours,
                prior_shortfall: 0.0,
                actual_hours: 0.0,
                energy_wh: 0.0,
                total_cost: 0.0,
                average_price: 0.0,
                device_runs: Vec::new(),
            });
        }
    }

    /// Starts a new run, closing any dissimilar open run first. A no-op if a
    /// run with the same system state and reason is already open.
    pub fn start_run(&mut self, system_state: SystemState, reason: StateReasonOn, meter_reading: f64, now: DateTime<Local>) {
        if let Some(current) = self.get_current_run() {
            if current.system_state == system_state && current.reason_started == reason_started_for(reason) {
                return;
            }
            self.stop_run(StateReasonOff::InputOverride, meter_reading, 0.0, now);
        }

        self.ensure_today(now);
        let run = Run {
            system_state,
            reason_started: reason_started_for(reason),
            reason_stopped: None,
            start_dt: now,
            end_dt: None,
            actual_hours: 0.0,
            meter_at_start: meter_reading,
            prior_meter_read: meter_reading,
            energy_wh: 0.0,
            total_cost: 0.0,
            average_price: 0.0,
        };
        self.history.days.last_mut().unwrap().device_runs.push(run);

        self.update_totals(meter_reading, 0.0, now);
    }

    /// Closes the current open run, if any.
    pub fn stop_run(&mut self, reason_off: StateReasonOff, meter_reading: f64, current_price: f64, now: DateTime<Local>) {
        self.accrue_open_run(meter_reading, current_price, now);

        if let Some(run) = self.get_current_run_mut() {
            run.end_dt = Some(now);
            run.reason_stopped = Some(reason_stopped_for(reason_off));
        }

        self.update_totals(meter_reading, current_price, now);
    }

    /// Periodic tick: rolls history over at midnight (closing and prorating
    /// any open run across the boundary) and recomputes totals. Returns
    /// whether a day rollover happened.
    pub fn tick(&mut self, meter_reading: f64, current_price: f64, now: DateTime<Local>) -> bool {
        let rolled = if self.crossed_midnight(now) {
            self.roll_over_midnight(meter_reading, now);
            true
        } else {
            false
        };

        self.update_totals(meter_reading, current_price, now);
        self.last_tick = now;
        self.last_meter_read = meter_reading;
        rolled
    }

    fn crossed_midnight(&self, now: DateTime<Local>) -> bool {
        match self.history.days.last() {
            Some(day) => now.date_naive() > day.date,
            None => false,
        }
    }

    fn roll_over_midnight(&mut self, meter_reading: f64, now: DateTime<Local>) {
        let last_tick = self.last_tick;
        let last_meter_read = self.last_meter_read;

        let boundary = (last_tick.date_naive() + Duration::days(1))
            .and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
            .and_local_timezone(Local)
            .single()
            .unwrap_or(now);

        let total_span = (now - last_tick).num_milliseconds().max(1) as f64;
        let pre_midnight_span = (boundary - last_tick).num_milliseconds().max(0) as f64;
        let ratio = (pre_midnight_span / total_span).clamp(0.0, 1.0);
        let delta = meter_reading - last_meter_read;
        let boundary_meter_read = last_meter_read + delta * ratio;

        if let Some(run) = self.get_current_run_mut() {
            let additional_hours = (boundary - run.start_dt).num_milliseconds() as f64 / 3_600_000.0;
            run.actual_hours = additional_hours.max(0.0);

            if boundary_meter_read > run.prior_meter_read && run.prior_meter_read > 0.0 {
                let energy = boundary_meter_read - run.prior_meter_read;
                run.energy_wh += energy;
            }
            run.prior_meter_read = boundary_meter_read;
            run.end_dt = Some(boundary);
            run.reason_stopped = Some(ReasonStopped::DayEnd);

            let system_state = run.system_state;
            debug!("closing run at day end for {:?}", system_state);

            self.ensure_today(boundary);
            let new_run = Run {
                system_state,
                reason_started: ReasonStarted::DayStart,
                reason_stopped: None,
                start_dt: boundary,
                end_dt: None,
                actual_hours: 0.0,
                meter_at_start: boundary_meter_read,
                prior_meter_read: boundary_meter_read,
                energy_wh: 0.0,
                total_cost: 0.0,
                average_price: 0.0,
            };
            self.history.days.last_mut().unwrap().device_runs.push(new_run);
        }

        if self.history.days.len() > self.history_days {
            let oldest = self.history.days.remove(0);
            self.history.earlier.energy_wh += oldest.energy_wh;
            self.history.earlier.total_cost += oldest.total_cost;
            self.history.earlier.actual_hours += oldest.actual_hours;
            self.history.earlier.average_price = average_price(self.history.earlier.total_cost, self.history.earlier.energy_wh);
        }

        self.last_tick = boundary;
        self.last_meter_read = boundary_meter_read;
    }

    fn accrue_open_run(&mut self, meter_reading: f64, current_price: f64, now: DateTime<Local>) {
        let Some(run) = self.get_current_run_mut() else { return };

        run.actual_hours = (now - run.start_dt).num_milliseconds() as f64 / 3_600_000.0;

        if meter_reading > 0.0 && run.prior_meter_read > 0.0 && meter_reading > run.prior_meter_read {
            let energy_used = meter_reading - run.prior_meter_read;
            run.energy_wh += energy_used;
            run.total_cost += energy_used / 1000.0 * current_price;
            run.average_price = average_price(run.total_cost, run.energy_wh);
            run.prior_meter_read = meter_reading;
        }
    }

    /// Recomputes every derived total (day totals, current/earlier/alltime,
    /// prior shortfall chain) from the persisted run data.
    fn update_totals(&mut self, meter_reading: f64, current_price: f64, now: DateTime<Local>) {
        self.ensure_today(now);
        self.accrue_open_run(meter_reading, current_price, now);

        self.history.current = Totals::default();

        let target_hours = self.target_hours;
        let all_hours_mode = target_hours == -1.0;

        let mut running_shortfall = if all_hours_mode {
            0.0
        } else {
            self.history.days.first().map(|d| d.prior_shortfall).unwrap_or(0.0)
        };

        for day in &mut self.history.days {
            day.prior_shortfall = running_shortfall;
            day.actual_hours = 0.0;
            day.energy_wh = 0.0;
            day.total_cost = 0.0;

            for run in &day.device_runs {
                day.actual_hours += run.actual_hours;
                day.energy_wh += run.energy_wh;
                day.total_cost += run.total_cost;
            }
            day.average_price = average_price(day.total_cost, day.energy_wh);

            self.history.current.energy_wh += day.energy_wh;
            self.history.current.total_cost += day.total_cost;
            self.history.current.actual_hours += day.actual_hours;

            if !all_hours_mode {
                running_shortfall += target_hours - day.actual_hours;
            }
        }

        self.history.current.average_price = average_price(self.history.current.total_cost, self.history.current.energy_wh);

        self.history.alltime.energy_wh = self.history.current.energy_wh + self.history.earlier.energy_wh;
        self.history.alltime.total_cost = self.history.current.total_cost + self.history.earlier.total_cost;
        self.history.alltime.actual_hours = self.history.current.actual_hours + self.history.earlier.actual_hours;
        self.history.alltime.average_price = average_price(self.history.alltime.total_cost, self.history.alltime.energy_wh);
    }
}

/// Unit-correct average price in c/kWh: `totalCost * 1000 / energyWh`.
fn average_price(total_cost: f64, energy_wh: f64) -> f64 {
    if energy_wh > 0.0 {
        total_cost * 1000.0 / energy_wh
    } else {
        0.0
    }
}

fn reason_started_for(reason: StateReasonOn) -> ReasonStarted {
    match reason {
        StateReasonOn::ActiveRunPlan => ReasonStarted::StatusChange,
    }
}

/// Collapses the fine-grained off-reasons onto the three ReasonStopped
/// buckets a run can end in: a user override ends it manually, everything
/// else is the system reacting to a status change.
fn reason_stopped_for(reason: StateReasonOff) -> ReasonStopped {
    match reason {
        StateReasonOff::AppOverride | StateReasonOff::InputOverride => ReasonStopped::Manual,
        StateReasonOff::DeviceOffline
        | StateReasonOff::NoRunPlan
        | StateReasonOff::RunPlanComplete
        | StateReasonOff::InactiveRunPlan
        | StateReasonOff::ParentOff
        | StateReasonOff::TempProbeConstraint
        | StateReasonOff::MinOnTime
        | StateReasonOff::MinOffTime
        | StateReasonOff::DateOff => ReasonStopped::StatusChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn meter_run_is_split_across_midnight() {
        let init = at(2026, 1, 19, 23, 50, 0);
        let mut rh = RunHistory::new(None, 1.0, 7, init);

        let start = at(2026, 1, 19, 23, 0, 0);
        rh.ensure_today(start);
        rh.history.days.last_mut().unwrap().device_runs.push(Run {
            system_state: SystemState::Auto,
            reason_started: ReasonStarted::StatusChange,
            reason_stopped: None,
            start_dt: start,
            end_dt: None,
            actual_hours: 0.0,
            meter_at_start: 1000.0,
            prior_meter_read: 1000.0,
            energy_wh: 0.0,
            total_cost: 0.0,
            average_price: 0.0,
        });

        rh.last_tick = at(2026, 1, 19, 23, 59, 0);
        rh.last_meter_read = 1000.0;

        let tick_time = at(2026, 1, 20, 0, 1, 0);
        let rolled = rh.tick(1010.0, 20.0, tick_time);
        assert!(rolled);

        assert!(rh.history.days.len() >= 2);
        let yesterday = &rh.history.days[rh.history.days.len() - 2];
        let today = rh.history.days.last().unwrap();

        assert_eq!(yesterday.date, chrono::NaiveDate::from_ymd_opt(2026, 1, 19).unwrap());
        assert_eq!(today.date, chrono::NaiveDate::from_ymd_opt(2026, 1, 20).unwrap());

        let yesterday_run = yesterday.device_runs.last().unwrap();
        assert_eq!(yesterday_run.reason_stopped, Some(ReasonStopped::DayEnd));
        assert!((yesterday_run.prior_meter_read - 1005.0).abs() < 1e-6);
        assert!((yesterday_run.energy_wh - 5.0).abs() < 1e-6);

        let today_run = today.device_runs.first().unwrap();
        assert_eq!(today_run.reason_started, ReasonStarted::DayStart);
        assert!((today_run.meter_at_start - 1005.0).abs() < 1e-6);
        assert!(today_run.end_dt.is_none());
    }

    #[test]
    fn average_price_is_unit_correct() {
        assert!((average_price(0.60, 3000.0) - 0.20).abs() < 1e-9);
    }

    #[test]
    fn start_run_is_idempotent_for_same_state_and_reason() {
        let now = at(2026, 1, 10, 8, 0, 0);
        let mut rh = RunHistory::new(None, 1.0, 7, now);
        rh.start_run(SystemState::Auto, StateReasonOn::ActiveRunPlan, 100.0, now);
        let run_count_before = rh.history.days.last().unwrap().device_runs.len();
        rh.start_run(SystemState::Auto, StateReasonOn::ActiveRunPlan, 100.0, now + Duration::minutes(5));
        let run_count_after = rh.history.days.last().unwrap().device_runs.len();
        assert_eq!(run_count_before, run_count_after);
    }

    #[test]
    fn shortfall_carries_forward_when_target_not_met() {
        let now = at(2026, 1, 10, 0, 0, 0);
        let mut rh = RunHistory::new(None, 2.0, 7, now);
        rh.start_run(SystemState::Auto, StateReasonOn::ActiveRunPlan, 0.0, now);
        rh.stop_run(StateReasonOff::RunPlanComplete, 0.0, 20.0, now + Duration::hours(1));
        assert!(rh.history.days.last().unwrap().actual_hours > 0.0);
    }
}
