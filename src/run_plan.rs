//! The run-plan planner: a pure function that selects and consolidates price
//! slots (or schedule windows standing in for price slots) into a `RunPlan`.
//!
//! Selection is greedy cheapest-first over a price-ascending input list, not
//! an exhaustive search over combinations — the input ordering does the
//! optimizing work, this just walks it once.

use chrono::{DateTime, Local, Timelike};
use log::debug;

use crate::errors::SchedulingError;
use crate::models::{PlanSlot, PriceSlot, RunPlan, RunPlanSource, RunPlanStatus};

pub struct RunPlanner {
    source: RunPlanSource,
    channel: Option<String>,
}

impl RunPlanner {
    /// Returns a new RunPlanner for the given mode.
    ///
    /// # Arguments
    ///
    /// * 'source' - BestPrice or Schedule
    /// * 'channel' - the Amber channel the plan applies to, if any
    pub fn new(source: RunPlanSource, channel: Option<String>) -> Self {
        RunPlanner { source, channel }
    }

    /// Determines when to run based on the best pricing (or schedule)
    /// strategy, honouring `slot_min_minutes` (minimum final slot length) and
    /// `slot_gap_minutes` (gaps smaller than this are merged away).
    ///
    /// # Arguments
    ///
    /// * 'now' - the instant the plan is calculated for
    /// * 'sorted_slots' - candidate slots, ascending by price
    /// * 'required_hours' - hours required; -1 fills all remaining minutes of today
    /// * 'priority_hours' - hours that may be covered at the priority price ceiling
    /// * 'max_price' - price ceiling for normal hours (c/kWh)
    /// * 'max_priority_price' - price ceiling for priority hours (c/kWh)
    /// * 'hourly_energy_usage' - expected load while running, in W
    /// * 'slot_min_minutes' - minimum length of a final slot (0 = no minimum)
    /// * 'slot_gap_minutes' - gaps smaller than this between final slots are merged (0 = no merging)
    /// * 'constraint_slots' - optional allow-list; a candidate must overlap one of these
    pub fn calculate_run_plan(
        &self,
        now: DateTime<Local>,
        sorted_slots: &[PriceSlot],
        required_hours: f64,
        priority_hours: f64,
        max_price: f64,
        max_priority_price: f64,
        hourly_energy_usage: f64,
        slot_min_minutes: i64,
        slot_gap_minutes: i64,
        constraint_slots: Option<&[PriceSlot]>,
    ) -> Result<RunPlan, SchedulingError> {
        let mut plan = self.empty_plan(now);

        let required_mins = Self::calculate_required_minutes(required_hours, now);
        if required_mins == 0 {
            plan.required_hours = 0.0;
            plan.priority_hours = 0.0;
            plan.planned_hours = 0.0;
            plan.remaining_hours = 0.0;
            plan.status = RunPlanStatus::Nothing;
            return Ok(plan);
        }

        let priority_hours = if required_hours != -1.0 {
            priority_hours.min(required_hours)
        } else {
            priority_hours
        };

        plan.required_hours = required_hours;
        plan.priority_hours = priority_hours;

        if sorted_slots.is_empty() {
            plan.status = if self.source == RunPlanSource::Schedule && required_hours == -1.0 && priority_hours == 0.0 {
                RunPlanStatus::Nothing
            } else {
                RunPlanStatus::Failed
            };
            plan.planned_hours = 0.0;
            plan.remaining_hours = 0.0;
            return Ok(plan);
        }

        if max_price <= 0.0 || max_priority_price <= 0.0 {
            return Err(SchedulingError("invalid price parameters for run plan".into()));
        }

        let required_priority_mins = ((priority_hours * 60.0) as i64).min(required_mins);

        let selected = select_qualifying_slots(
            sorted_slots,
            required_mins,
            required_priority_mins,
            max_price,
            max_priority_price,
            hourly_energy_usage,
            constraint_slots,
        );

        if selected.is_empty() {
            plan.status = RunPlanStatus::Failed;
            plan.planned_hours = 0.0;
            plan.remaining_hours = 0.0;
            return Ok(plan);
        }

        let consolidated = consolidate_slots(selected, slot_min_minutes, slot_gap_minutes);
        let trimmed = trim_to_required_hours(consolidated, required_mins);

        finalize_run_plan(plan, trimmed, now, required_mins, required_priority_mins)
    }

    fn empty_plan(&self, _now: DateTime<Local>) -> RunPlan {
        RunPlan {
            source: self.source,
            channel: self.channel.clone(),
            status: RunPlanStatus::Nothing,
            required_hours: 0.0,
            priority_hours: 0.0,
            planned_hours: 0.0,
            remaining_hours: 0.0,
            next_start_dt: None,
            next_stop_dt: None,
            forecast_avg_price: 0.0,
            forecast_energy_wh: 0.0,
            estimated_cost: 0.0,
            slots: Vec::new(),
        }
    }

    /// Hours required -> minutes, with the "-1 means fill today" rule: the
    /// remaining minutes of today, floored down to a multiple of 5.
    fn calculate_required_minutes(required_hours: f64, now: DateTime<Local>) -> i64 {
        let mins = if required_hours == -1.0 {
            let elapsed = (now.hour() * 60 + now.minute()) as i64;
            let mut remaining = 24 * 60 - elapsed;
            let rem = remaining % 5;
            if rem != 0 {
                remaining -= rem;
            }
            remaining
        } else {
            (required_hours * 60.0) as i64
        };

        mins.max(0)
    }
}

/// A slot that has passed selection and carries the mutable accumulators used
/// through consolidation/trimming; converted to `PlanSlot` at finalize time.
#[derive(Clone, Debug)]
struct WorkingSlot {
    start_dt: DateTime<Local>,
    end_dt: DateTime<Local>,
    minutes: i64,
    forecast_energy_wh: f64,
    estimated_cost: f64,
    weighted_price_minutes: f64,
}

impl WorkingSlot {
    fn from_price_slot(slot: &PriceSlot, hourly_energy_usage: f64) -> Self {
        let (forecast_energy_wh, estimated_cost) = if hourly_energy_usage > 0.0 {
            let wh = (hourly_energy_usage / 60.0) * slot.minutes as f64;
            let cost = (hourly_energy_usage / (60.0 * 1000.0)) * slot.minutes as f64 * (slot.price_per_kwh / 100.0);
            (wh, cost)
        } else {
            (0.0, 0.0)
        };

        WorkingSlot {
            start_dt: slot.start_dt,
            end_dt: slot.end_dt,
            minutes: slot.minutes,
            forecast_energy_wh,
            estimated_cost,
            weighted_price_minutes: slot.price_per_kwh * slot.minutes as f64,
        }
    }
}

fn select_qualifying_slots(
    sorted_slots: &[PriceSlot],
    remaining_required_mins: i64,
    required_priority_mins: i64,
    max_price: f64,
    max_priority_price: f64,
    hourly_energy_usage: f64,
    constraint_slots: Option<&[PriceSlot]>,
) -> Vec<WorkingSlot> {
    let mut selected = Vec::new();
    let mut remaining_mins = remaining_required_mins;
    let mut filled_mins = 0i64;
    let constraints = constraint_slots.unwrap_or(&[]);

    for slot in sorted_slots {
        let price = slot.price_per_kwh;
        if price > max_priority_price {
            continue;
        }

        if !constraints.is_empty() {
            let overlaps = constraints
                .iter()
                .any(|c| slot.start_dt < c.end_dt && slot.end_dt > c.start_dt);
            if !overlaps {
                continue;
            }
        }

        let qualifies_normal = price <= max_price && slot.minutes <= remaining_mins;
        let qualifies_priority = price <= max_priority_price && filled_mins < required_priority_mins;
        if !qualifies_normal && !qualifies_priority {
            continue;
        }

        selected.push(WorkingSlot::from_price_slot(slot, hourly_energy_usage));
        filled_mins += slot.minutes;
        remaining_mins -= slot.minutes;

        if remaining_mins <= 0 {
            break;
        }
    }

    selected
}

fn consolidate_slots(mut slots: Vec<WorkingSlot>, slot_min_minutes: i64, slot_gap_minutes: i64) -> Vec<WorkingSlot> {
    if slots.is_empty() {
        return slots;
    }
    slots.sort_by_key(|s| s.start_dt);

    let merged = merge_by_gap(slots, slot_gap_minutes);
    enforce_minimum_slot_length(merged, slot_min_minutes)
}

fn merge_by_gap(slots: Vec<WorkingSlot>, slot_gap_minutes: i64) -> Vec<WorkingSlot> {
    let mut merged: Vec<WorkingSlot> = Vec::new();

    for slot in slots {
        let Some(last) = merged.last_mut() else {
            merged.push(slot);
            continue;
        };

        let gap_minutes = (slot.start_dt - last.end_dt).num_minutes();
        let should_merge = gap_minutes == 0 || (slot_gap_minutes > 0 && gap_minutes > 0 && gap_minutes < slot_gap_minutes);

        if should_merge {
            last.end_dt = slot.end_dt;
            last.minutes = (last.end_dt - last.start_dt).num_minutes();
            last.weighted_price_minutes += slot.weighted_price_minutes;
            last.forecast_energy_wh += slot.forecast_energy_wh;
            last.estimated_cost += slot.estimated_cost;
        } else {
            merged.push(slot);
        }
    }

    merged
}

fn enforce_minimum_slot_length(slots: Vec<WorkingSlot>, slot_min_minutes: i64) -> Vec<WorkingSlot> {
    if slots.is_empty() || slot_min_minutes <= 0 {
        return slots;
    }

    let mut result: Vec<WorkingSlot> = Vec::new();
    let mut i = 0;
    while i < slots.len() {
        let slot = &slots[i];

        if slot.minutes >= slot_min_minutes {
            result.push(slot.clone());
            i += 1;
            continue;
        }

        if i + 1 < slots.len() {
            let next = &slots[i + 1];
            result.push(WorkingSlot {
                start_dt: slot.start_dt,
                end_dt: next.end_dt,
                minutes: (next.end_dt - slot.start_dt).num_minutes(),
                weighted_price_minutes: slot.weighted_price_minutes + next.weighted_price_minutes,
                forecast_energy_wh: slot.forecast_energy_wh + next.forecast_energy_wh,
                estimated_cost: slot.estimated_cost + next.estimated_cost,
            });
            i += 2;
        } else if let Some(prev) = result.last_mut() {
            prev.end_dt = slot.end_dt;
            prev.minutes = (prev.end_dt - prev.start_dt).num_minutes();
            prev.weighted_price_minutes += slot.weighted_price_minutes;
            prev.forecast_energy_wh += slot.forecast_energy_wh;
            prev.estimated_cost += slot.estimated_cost;
            i += 1;
        } else {
            debug!("removing short slot ({} min) that cannot be merged", slot.minutes);
            i += 1;
        }
    }

    result
}

fn trim_to_required_hours(mut slots: Vec<WorkingSlot>, required_minutes: i64) -> Vec<WorkingSlot> {
    if slots.is_empty() {
        return slots;
    }

    let total_minutes: i64 = slots.iter().map(|s| s.minutes).sum();
    if total_minutes <= required_minutes {
        return slots;
    }

    let mut excess = total_minutes - required_minutes;
    let mut i = slots.len();
    while i > 0 && excess > 0 {
        i -= 1;
        let slot = &mut slots[i];

        if slot.minutes <= excess {
            excess -= slot.minutes;
            slots.remove(i);
            continue;
        }

        let original_price = if slot.minutes > 0 {
            slot.weighted_price_minutes / slot.minutes as f64
        } else {
            0.0
        };

        let new_minutes = slot.minutes - excess;
        let ratio = new_minutes as f64 / (new_minutes + excess) as f64;

        slot.end_dt = slot.start_dt + chrono::Duration::minutes(new_minutes);
        slot.minutes = new_minutes;
        slot.forecast_energy_wh *= ratio;
        slot.estimated_cost *= ratio;
        slot.weighted_price_minutes = original_price * slot.minutes as f64;

        excess = 0;
    }

    slots
}

fn finalize_run_plan(
    mut plan: RunPlan,
    slots: Vec<WorkingSlot>,
    now: DateTime<Local>,
    required_mins: i64,
    required_priority_mins: i64,
) -> Result<RunPlan, SchedulingError> {
    if slots.is_empty() {
        plan.status = RunPlanStatus::Failed;
        plan.planned_hours = 0.0;
        plan.remaining_hours = 0.0;
        return Ok(plan);
    }

    let mut total_minutes = 0i64;
    let mut future_minutes = 0i64;
    let mut total_weighted_price = 0.0;
    let mut total_energy = 0.0;
    let mut total_cost = 0.0;
    let mut plan_slots = Vec::with_capacity(slots.len());

    for slot in slots {
        total_minutes += slot.minutes;

        if slot.end_dt > now {
            if slot.start_dt >= now {
                future_minutes += slot.minutes;
            } else {
                future_minutes += (slot.end_dt - now).num_minutes();
            }
        }

        total_energy += slot.forecast_energy_wh;
        total_cost += slot.estimated_cost;
        total_weighted_price += slot.weighted_price_minutes;

        let price = if slot.minutes > 0 {
            round2(slot.weighted_price_minutes / slot.minutes as f64)
        } else {
            0.0
        };

        plan_slots.push(PlanSlot {
            slot: PriceSlot {
                date: slot.start_dt.date_naive(),
                start_dt: slot.start_dt,
                end_dt: slot.end_dt,
                minutes: slot.minutes,
                price_per_kwh: price,
            },
            forecast_energy_wh: slot.forecast_energy_wh,
            estimated_cost: slot.estimated_cost,
            weighted_price_minutes: slot.weighted_price_minutes,
        });
    }

    plan.next_start_dt = plan_slots.first().map(|s| s.slot.start_dt);
    plan.next_stop_dt = plan_slots.first().map(|s| s.slot.end_dt);
    plan.planned_hours = total_minutes as f64 / 60.0;
    plan.remaining_hours = future_minutes as f64 / 60.0;
    plan.forecast_avg_price = if total_minutes > 0 {
        round2(total_weighted_price / total_minutes as f64)
    } else {
        0.0
    };
    plan.forecast_energy_wh = total_energy;
    plan.estimated_cost = total_cost;
    plan.slots = plan_slots;

    plan.status = if total_minutes < required_priority_mins {
        RunPlanStatus::Failed
    } else if total_minutes >= required_mins {
        RunPlanStatus::Ready
    } else {
        RunPlanStatus::Partial
    };

    Ok(plan)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Recomputes `remainingHours` against "now"; idempotent and pure w.r.t. the
/// clock otherwise.
///
/// # Arguments
///
/// * 'plan' - the run plan to refresh
/// * 'now' - the instant to recompute against
pub fn tick(plan: &mut RunPlan, now: DateTime<Local>) {
    let mut future_minutes = 0i64;

    for slot in &plan.slots {
        if slot.slot.end_dt > now {
            if slot.slot.start_dt >= now {
                future_minutes += slot.slot.minutes;
            } else {
                future_minutes += (slot.slot.end_dt - now).num_minutes();
            }
        }
    }

    plan.remaining_hours = future_minutes as f64 / 60.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn slot(date: chrono::NaiveDate, h: u32, m: u32, minutes: i64, price: f64) -> PriceSlot {
        let start = Local.from_local_datetime(&date.and_hms_opt(h, m, 0).unwrap()).unwrap();
        let end = start + chrono::Duration::minutes(minutes);
        PriceSlot::new(start, end, price)
    }

    #[test]
    fn pricing_and_planning_end_to_end_scenario() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(14, 0, 0).unwrap()).unwrap();

        let raw = vec![
            slot(date, 14, 0, 30, 35.0),
            slot(date, 14, 30, 30, 30.0),
            slot(date, 15, 0, 30, 20.0),
            slot(date, 15, 30, 30, 18.0),
            slot(date, 16, 0, 30, 22.0),
            slot(date, 16, 30, 30, 45.0),
            slot(date, 17, 0, 30, 40.0),
            slot(date, 17, 30, 30, 25.0),
        ];
        let mut sorted = raw;
        sorted.sort_by(|a, b| a.price_per_kwh.partial_cmp(&b.price_per_kwh).unwrap());

        let planner = RunPlanner::new(RunPlanSource::BestPrice, Some("general".into()));
        let plan = planner
            .calculate_run_plan(now, &sorted, 1.5, 0.5, 30.0, 40.0, 2000.0, 0, 0, None)
            .unwrap();

        assert_eq!(plan.status, RunPlanStatus::Ready);
        assert!((plan.planned_hours - 1.5).abs() < 1e-9);
        assert!((plan.forecast_avg_price - 20.00).abs() < 0.01);
        assert!((plan.forecast_energy_wh - 3000.0).abs() < 1e-9);
        assert!((plan.estimated_cost - 0.60).abs() < 1e-9);
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.next_start_dt.unwrap().format("%H:%M").to_string(), "15:00");
        assert_eq!(plan.next_stop_dt.unwrap().format("%H:%M").to_string(), "16:30");
    }

    #[test]
    fn required_zero_gives_nothing() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(14, 0, 0).unwrap()).unwrap();
        let planner = RunPlanner::new(RunPlanSource::BestPrice, None);
        let plan = planner.calculate_run_plan(now, &[], 0.0, 0.0, 30.0, 40.0, 0.0, 0, 0, None).unwrap();
        assert_eq!(plan.status, RunPlanStatus::Nothing);
        assert_eq!(plan.slots.len(), 0);
    }

    #[test]
    fn empty_slots_with_required_hours_fails() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(14, 0, 0).unwrap()).unwrap();
        let planner = RunPlanner::new(RunPlanSource::BestPrice, None);
        let plan = planner.calculate_run_plan(now, &[], 1.0, 0.0, 30.0, 40.0, 0.0, 0, 0, None).unwrap();
        assert_eq!(plan.status, RunPlanStatus::Failed);
    }

    #[test]
    fn schedule_mode_all_hours_zero_priority_with_no_slots_is_nothing() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(23, 50, 0).unwrap()).unwrap();
        let planner = RunPlanner::new(RunPlanSource::Schedule, None);
        let plan = planner.calculate_run_plan(now, &[], -1.0, 0.0, 30.0, 40.0, 0.0, 0, 0, None).unwrap();
        assert_eq!(plan.status, RunPlanStatus::Nothing);
    }

    #[test]
    fn invalid_price_parameters_error() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(14, 0, 0).unwrap()).unwrap();
        let slots = vec![slot(date, 14, 0, 30, 35.0)];
        let planner = RunPlanner::new(RunPlanSource::BestPrice, None);
        let err = planner.calculate_run_plan(now, &slots, 1.0, 0.0, 0.0, 40.0, 0.0, 0, 0, None);
        assert!(err.is_err());
    }

    #[test]
    fn tick_is_idempotent() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(14, 0, 0).unwrap()).unwrap();
        let sorted = vec![slot(date, 15, 0, 30, 20.0)];
        let planner = RunPlanner::new(RunPlanSource::BestPrice, None);
        let mut plan = planner.calculate_run_plan(now, &sorted, 0.5, 0.0, 30.0, 40.0, 0.0, 0, 0, None).unwrap();

        tick(&mut plan, now);
        let first = plan.remaining_hours;
        tick(&mut plan, now);
        assert_eq!(first, plan.remaining_hours);
    }

    #[test]
    fn gap_merge_and_min_length() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let now = Local.from_local_datetime(&date.and_hms_opt(6, 0, 0).unwrap()).unwrap();
        // Two 10-minute slots with a 5-minute gap between them; slot_gap_minutes=10 merges them.
        let sorted = vec![slot(date, 7, 0, 10, 10.0), slot(date, 7, 15, 10, 10.0)];
        let planner = RunPlanner::new(RunPlanSource::BestPrice, None);
        let plan = planner.calculate_run_plan(now, &sorted, 20.0 / 60.0, 0.0, 30.0, 40.0, 0.0, 0, 10, None).unwrap();
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.slots[0].slot.minutes, 25);
    }
}
