//! Scheduler: parses configured operating schedules into today's active
//! time windows and delegates to RunPlanner in Schedule mode. Dawn/dusk
//! anchors used by relative time strings ("dawn+00:10") are computed once
//! per day from the configured location via a solar-position calculation.

use chrono::{DateTime, DurationRound, Local, NaiveTime, TimeDelta, Timelike, Weekday};
use spa_sra::spa::{Function, Input, SpaData};

use crate::config::{Location, OperatingSchedule};
use crate::models::{PriceSlot, RunPlan, RunPlanSource};
use crate::run_plan::RunPlanner;

use errors::SchedulerError;

pub struct Scheduler {
    schedules: Vec<OperatingSchedule>,
    default_price: f64,
    dawn: NaiveTime,
    dusk: NaiveTime,
}

impl Scheduler {
    /// Builds a Scheduler from the configured operating schedules, computing
    /// today's dawn/dusk anchors from the configured location.
    ///
    /// # Arguments
    ///
    /// * 'schedules' - the `OperatingSchedules` section of config
    /// * 'location' - the `Location` section of config
    /// * 'default_price' - the fallback price for windows that don't set one
    /// * 'now' - the instant used to compute today's dawn/dusk
    pub fn new(schedules: Vec<OperatingSchedule>, location: &Location, default_price: f64, now: DateTime<Local>) -> Result<Self, SchedulerError> {
        let (lat, lon) = resolve_lat_lon(location);
        let (dawn, dusk) = compute_dawn_dusk(lat, lon, now)?;

        Ok(Scheduler {
            schedules,
            default_price,
            dawn,
            dusk,
        })
    }

    pub fn get_schedule_by_name(&self, name: &str) -> Option<&OperatingSchedule> {
        self.schedules.iter().find(|s| s.name == name)
    }

    /// Returns today's active windows for a schedule, filtered to
    /// `DaysOfWeek` and clipped to "now or later".
    pub fn get_schedule_slots(&self, schedule: &OperatingSchedule, now: DateTime<Local>) -> Result<Vec<PriceSlot>, SchedulerError> {
        let today = now.date_naive();
        let weekday_str = weekday_abbreviation(today.weekday());
        let time_now = now.time().with_second(0).unwrap().with_nanosecond(0).unwrap();

        let mut slots = Vec::new();

        for window in &schedule.windows {
            if let Some(days) = &window.days_of_week {
                let today_included = days.iter().any(|d| d.trim().eq_ignore_ascii_case(weekday_str));
                if !today_included {
                    continue;
                }
            }

            let mut start_time = self.parse_time(&window.start_time)?;
            let end_time = self.parse_time(&window.end_time)?;

            if end_time < time_now {
                continue;
            }
            if start_time < time_now {
                start_time = time_now;
            }

            let start_dt = today.and_time(start_time).and_local_timezone(Local).single().ok_or(SchedulerError::InvalidTime(window.start_time.clone()))?;
            let end_dt = today.and_time(end_time).and_local_timezone(Local).single().ok_or(SchedulerError::InvalidTime(window.end_time.clone()))?;

            let price = window.price.unwrap_or(self.default_price);
            slots.push(PriceSlot::new(start_dt, end_dt, price));
        }

        Ok(slots)
    }

    /// Resolves "HH:MM" or "dawn"/"dusk" with an optional ±hh:mm offset.
    pub fn parse_time(&self, time_str: &str) -> Result<NaiveTime, SchedulerError> {
        let lower = time_str.to_ascii_lowercase();

        if let Some(rest) = lower.strip_prefix("dawn") {
            return apply_offset(self.dawn, rest).ok_or_else(|| SchedulerError::InvalidTime(time_str.to_string()));
        }
        if let Some(rest) = lower.strip_prefix("dusk") {
            return apply_offset(self.dusk, rest).ok_or_else(|| SchedulerError::InvalidTime(time_str.to_string()));
        }

        NaiveTime::parse_from_str(time_str, "%H:%M").map_err(|_| SchedulerError::InvalidTime(time_str.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_run_plan(
        &self,
        schedule_name: &str,
        now: DateTime<Local>,
        required_hours: f64,
        priority_hours: f64,
        max_price: f64,
        max_priority_price: f64,
        hourly_energy_usage: f64,
        slot_min_minutes: i64,
        slot_gap_minutes: i64,
    ) -> Result<Option<RunPlan>, SchedulerError> {
        let Some(schedule) = self.get_schedule_by_name(schedule_name) else {
            return Ok(None);
        };

        let mut sorted = self.get_schedule_slots(schedule, now)?;
        if sorted.is_empty() {
            return Ok(None);
        }
        sorted.sort_by(|a, b| a.price_per_kwh.partial_cmp(&b.price_per_kwh).unwrap_or(std::cmp::Ordering::Equal));

        let planner = RunPlanner::new(RunPlanSource::Schedule, Some(schedule_name.to_string()));
        let plan = planner
            .calculate_run_plan(now, &sorted, required_hours, priority_hours, max_price, max_priority_price, hourly_energy_usage, slot_min_minutes, slot_gap_minutes, None)
            .map_err(|e| SchedulerError::Planning(e.to_string()))?;

        Ok(Some(plan))
    }

    pub fn get_current_price(&self, schedule_name: &str, now: DateTime<Local>) -> f64 {
        let Some(schedule) = self.get_schedule_by_name(schedule_name) else {
            return self.default_price;
        };
        let Ok(slots) = self.get_schedule_slots(schedule, now) else {
            return self.default_price;
        };
        if slots.is_empty() {
            return self.default_price;
        }

        slots
            .iter()
            .find(|s| s.start_dt <= now && now <= s.end_dt)
            .map(|s| s.price_per_kwh)
            .unwrap_or(self.default_price)
    }
}

fn weekday_abbreviation(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

/// Parses an offset like "+00:10" or "-01:30" and applies it to `base`.
fn apply_offset(base: NaiveTime, offset_part: &str) -> Option<NaiveTime> {
    if offset_part.is_empty() {
        return Some(base);
    }

    let mut chars = offset_part.chars();
    let sign = chars.next()?;
    if sign != '+' && sign != '-' {
        return None;
    }
    let rest: &str = offset_part.get(1..)?;
    let (hh, mm) = rest.split_once(':')?;
    if hh.len() != 2 || mm.len() != 2 {
        return None;
    }
    let hours: i64 = hh.parse().ok()?;
    let minutes: i64 = mm.parse().ok()?;
    let mut total = hours * 60 + minutes;
    if sign == '-' {
        total = -total;
    }

    let base_dt = Local::now().date_naive().and_time(base);
    Some((base_dt + TimeDelta::minutes(total)).time())
}

fn resolve_lat_lon(location: &Location) -> (f64, f64) {
    if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
        return (lat, lon);
    }

    if let Some(url) = &location.google_maps_url {
        if let Some((lat, lon)) = parse_google_maps_url(url) {
            return (lat, lon);
        }
    }

    (0.0, 0.0)
}

/// Extracts the "@lat,lon" pair from a Google Maps URL, e.g.
/// `https://maps.google.com/?q=@-27.470000,153.021000,15z`.
fn parse_google_maps_url(url: &str) -> Option<(f64, f64)> {
    let at_pos = url.find('@')?;
    let coords = &url[at_pos + 1..];
    let (lat_str, rest) = coords.split_once(',')?;
    let lon_str = rest.split(|c: char| c != '.' && c != '-' && !c.is_ascii_digit()).next()?;

    let lat: f64 = lat_str.parse().ok()?;
    let lon: f64 = lon_str.parse().ok()?;
    Some((lat, lon))
}

/// Uses the same solar-position crate and `SpaZaRts` function the
/// production-estimate module uses to get sunrise/sunset, repurposed here
/// as the dawn/dusk anchors for schedule-window offsets.
fn compute_dawn_dusk(lat: f64, lon: f64, now: DateTime<Local>) -> Result<(NaiveTime, NaiveTime), SchedulerError> {
    let mut input = Input::from_date_time(now);
    input.latitude = lat;
    input.longitude = lon;
    input.pressure = 1013.0;
    input.temperature = 10.0;
    input.elevation = 61.0;
    input.slope = 0.0;
    input.azm_rotation = 0.0;
    input.function = Function::SpaZaRts;

    let mut spa = SpaData::new(input);
    spa.spa_calculate().map_err(|e| SchedulerError::SolarPosition(e.to_string()))?;

    let sunrise = spa.get_sunrise().duration_round(TimeDelta::minutes(1)).map_err(|e| SchedulerError::SolarPosition(e.to_string()))?;
    let sunset = spa.get_sunset().duration_round(TimeDelta::minutes(1)).map_err(|e| SchedulerError::SolarPosition(e.to_string()))?;

    Ok((sunrise.time(), sunset.time()))
}

pub mod errors {
    use std::fmt;
    use std::fmt::Formatter;

    #[derive(Debug)]
    pub enum SchedulerError {
        InvalidTime(String),
        SolarPosition(String),
        Planning(String),
    }

    impl fmt::Display for SchedulerError {
        fn fmt(&self, f: &mut Formatter) -> fmt::Result {
            match self {
                SchedulerError::InvalidTime(e) => write!(f, "SchedulerError::InvalidTime: {}", e),
                SchedulerError::SolarPosition(e) => write!(f, "SchedulerError::SolarPosition: {}", e),
                SchedulerError::Planning(e) => write!(f, "SchedulerError::Planning: {}", e),
            }
        }
    }
    impl std::error::Error for SchedulerError {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Window;
    use chrono::TimeZone;

    fn scheduler_with_windows(windows: Vec<Window>, now: DateTime<Local>) -> Scheduler {
        let location = Location {
            timezone: "Australia/Brisbane".into(),
            latitude: Some(-27.47),
            longitude: Some(153.02),
            google_maps_url: None,
        };
        let schedule = OperatingSchedule { name: "test".into(), windows };
        Scheduler::new(vec![schedule], &location, 15.0, now).unwrap()
    }

    #[test]
    fn clips_window_start_to_now_when_in_progress() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 10, 30, 0).unwrap();
        let scheduler = scheduler_with_windows(
            vec![Window {
                start_time: "09:00".into(),
                end_time: "12:00".into(),
                price: Some(10.0),
                days_of_week: None,
            }],
            now,
        );
        let schedule = scheduler.get_schedule_by_name("test").unwrap();
        let slots = scheduler.get_schedule_slots(schedule, now).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start_dt, now.with_second(0).unwrap().with_nanosecond(0).unwrap());
    }

    #[test]
    fn excludes_window_for_wrong_day_of_week() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap(); // a Saturday
        let scheduler = scheduler_with_windows(
            vec![Window {
                start_time: "09:00".into(),
                end_time: "12:00".into(),
                price: Some(10.0),
                days_of_week: Some(vec!["Mon".into(), "Tue".into()]),
            }],
            now,
        );
        let schedule = scheduler.get_schedule_by_name("test").unwrap();
        let slots = scheduler.get_schedule_slots(schedule, now).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn parses_plain_hh_mm() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
        let scheduler = scheduler_with_windows(vec![], now);
        assert_eq!(scheduler.parse_time("14:30").unwrap(), NaiveTime::from_hms_opt(14, 30, 0).unwrap());
    }

    #[test]
    fn parses_dawn_with_positive_offset() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
        let scheduler = scheduler_with_windows(vec![], now);
        let base = scheduler.dawn;
        let parsed = scheduler.parse_time("dawn+00:10").unwrap();
        assert_eq!(parsed, (base + TimeDelta::minutes(10)));
    }

    #[test]
    fn unknown_schedule_name_falls_back_to_default_price() {
        let now = Local.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
        let scheduler = scheduler_with_windows(vec![], now);
        assert_eq!(scheduler.get_current_price("missing", now), 15.0);
    }
}
