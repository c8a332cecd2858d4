//! PricingManager: fetches and caches tariff slots per Amber channel, and
//! exposes the price-sorted view RunPlanner consumes.

pub mod errors;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use log::{error, info, warn};

use crate::config::AmberMode;
use crate::errors::SchedulingError;
use crate::interfaces::{ChannelType, TariffFeed, TariffInterval};
use crate::models::{PriceSlot, RunPlan, RunPlanSource};
use crate::run_plan::RunPlanner;

use errors::PricingError;

const SHORT_TERM_RESOLUTION_MINUTES: i64 = 5;
const SHORT_TERM_HORIZON_MINUTES: i64 = 120;
const LONG_TERM_RESOLUTION_MINUTES: i64 = 30;
const LONG_TERM_HORIZON_MINUTES: i64 = 48 * 60;

pub struct PricingManager {
    feed: Arc<dyn TariffFeed>,
    mode: AmberMode,
    cache_file: String,
    refresh_interval_s: i64,
    max_concurrent_errors: u32,
    consecutive_errors: u32,
    next_refresh: DateTime<Utc>,
    data: HashMap<ChannelType, Vec<PriceSlot>>,
    sorted: HashMap<ChannelType, Vec<PriceSlot>>,
}

impl PricingManager {
    /// Builds a PricingManager over the given tariff feed.
    ///
    /// # Arguments
    ///
    /// * 'feed' - the collaborator that fetches tariff intervals
    /// * 'mode' - Live/Offline/Disabled
    /// * 'cache_file' - path used to persist/restore the consolidated lists
    /// * 'refresh_interval_s' - seconds between successful refreshes
    /// * 'max_concurrent_errors' - consecutive failures before the manager becomes fatal
    pub fn new(feed: Arc<dyn TariffFeed>, mode: AmberMode, cache_file: String, refresh_interval_s: i64, max_concurrent_errors: u32) -> Self {
        PricingManager {
            feed,
            mode,
            cache_file,
            refresh_interval_s,
            max_concurrent_errors,
            consecutive_errors: 0,
            next_refresh: Utc.timestamp_opt(0, 0).single().unwrap(),
            data: HashMap::new(),
            sorted: HashMap::new(),
        }
    }

    pub fn is_refresh_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_refresh
    }

    /// Refreshes tariff data per the configured mode. In Live mode, fetches
    /// short- then long-term intervals and consolidates them; in Offline
    /// mode, reloads the persisted cache; in Disabled mode, does nothing.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Result<(), PricingError> {
        match self.mode {
            AmberMode::Disabled => Ok(()),
            AmberMode::Offline => self.load_from_disk(),
            AmberMode::Live => match self.fetch_and_consolidate(now) {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    self.next_refresh = now + Duration::seconds(self.refresh_interval_s);
                    if let Err(e) = self.persist() {
                        warn!("failed to persist pricing cache: {}", e);
                    }
                    Ok(())
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    self.next_refresh = now + Duration::seconds(60);
                    error!("pricing refresh failed ({}/{}): {}", self.consecutive_errors, self.max_concurrent_errors, e);
                    if self.consecutive_errors > self.max_concurrent_errors {
                        return Err(PricingError::Fatal(format!(
                            "pricing refresh failed {} times consecutively: {}",
                            self.consecutive_errors, e
                        )));
                    }
                    Err(e)
                }
            },
        }
    }

    fn fetch_and_consolidate(&mut self, now: DateTime<Utc>) -> Result<(), PricingError> {
        let short_intervals = (SHORT_TERM_HORIZON_MINUTES / SHORT_TERM_RESOLUTION_MINUTES) as u32;
        let long_intervals = (LONG_TERM_HORIZON_MINUTES / LONG_TERM_RESOLUTION_MINUTES) as u32;

        let short_term = self.feed.fetch(now, short_intervals, SHORT_TERM_RESOLUTION_MINUTES)?;
        let long_term = self.feed.fetch(now, long_intervals, LONG_TERM_RESOLUTION_MINUTES)?;

        let mut by_channel: HashMap<ChannelType, Vec<TariffInterval>> = HashMap::new();
        for interval in short_term.into_iter().chain(long_term.into_iter()) {
            by_channel.entry(interval.channel_type).or_default().push(interval);
        }

        for (channel, intervals) in by_channel {
            let consolidated = consolidate_channel(intervals);
            let slots: Vec<PriceSlot> = consolidated.iter().map(interval_to_slot).collect();
            let mut sorted = slots.clone();
            sorted.sort_by(|a, b| a.price_per_kwh.partial_cmp(&b.price_per_kwh).unwrap_or(std::cmp::Ordering::Equal));

            self.data.insert(channel, slots);
            self.sorted.insert(channel, sorted);
        }

        Ok(())
    }

    fn persist(&self) -> Result<(), PricingError> {
        let json = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.cache_file, json)?;
        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<(), PricingError> {
        let json = fs::read_to_string(&self.cache_file)?;
        let data: HashMap<ChannelType, Vec<PriceSlot>> = serde_json::from_str(&json)?;

        for (channel, slots) in &data {
            let mut sorted = slots.clone();
            sorted.sort_by(|a, b| a.price_per_kwh.partial_cmp(&b.price_per_kwh).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted.insert(*channel, sorted);
        }
        self.data = data;

        info!("loaded pricing cache from {}", self.cache_file);
        Ok(())
    }

    pub fn get_current_price(&self, channel: ChannelType) -> f64 {
        self.data.get(&channel).and_then(|v| v.first()).map(|s| s.price_per_kwh).unwrap_or(0.0)
    }

    pub fn get_available_time(&self, channel: ChannelType, now: DateTime<Local>) -> f64 {
        let minutes: i64 = self
            .data
            .get(&channel)
            .map(|v| {
                v.iter()
                    .filter(|s| s.end_dt > now)
                    .map(|s| if s.start_dt >= now { s.minutes } else { (s.end_dt - now).num_minutes() })
                    .sum()
            })
            .unwrap_or(0);
        minutes as f64 / 60.0
    }

    pub fn get_sorted(&self, channel: ChannelType) -> &[PriceSlot] {
        self.sorted.get(&channel).map(|v| v.as_slice()).unwrap_or(&[])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_run_plan(
        &self,
        channel: ChannelType,
        amber_channel_name: &str,
        now: DateTime<Local>,
        required_hours: f64,
        priority_hours: f64,
        max_price: f64,
        max_priority_price: f64,
        hourly_energy_usage: f64,
    ) -> Result<RunPlan, SchedulingError> {
        let planner = RunPlanner::new(RunPlanSource::BestPrice, Some(amber_channel_name.to_string()));
        planner.calculate_run_plan(
            now,
            self.get_sorted(channel),
            required_hours,
            priority_hours,
            max_price,
            max_priority_price,
            hourly_energy_usage,
            0,
            0,
            None,
        )
    }
}

/// Short-term first, then long-term entries after the last short-term end.
fn consolidate_channel(mut intervals: Vec<TariffInterval>) -> Vec<TariffInterval> {
    intervals.sort_by_key(|i| (i.duration_minutes, i.start_time));
    let short: Vec<TariffInterval> = intervals.iter().filter(|i| i.duration_minutes <= SHORT_TERM_RESOLUTION_MINUTES).cloned().collect();
    let last_short_end = short.iter().map(|i| i.end_time).max();

    let mut long: Vec<TariffInterval> = intervals
        .into_iter()
        .filter(|i| i.duration_minutes > SHORT_TERM_RESOLUTION_MINUTES)
        .filter(|i| last_short_end.map(|end| i.start_time >= end).unwrap_or(true))
        .collect();

    let mut result = short;
    result.append(&mut long);
    result.sort_by_key(|i| i.start_time);
    result
}

fn interval_to_slot(interval: &TariffInterval) -> PriceSlot {
    let start = interval.start_time.with_timezone(&Local);
    let end = interval.end_time.with_timezone(&Local);
    PriceSlot::new(start, end, interval.per_kwh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeFeed {
        calls: Mutex<Vec<i64>>,
    }

    impl TariffFeed for FakeFeed {
        fn fetch(&self, now: DateTime<Utc>, next_intervals: u32, resolution_minutes: i64) -> anyhow::Result<Vec<TariffInterval>> {
            self.calls.lock().unwrap().push(resolution_minutes);
            let mut out = Vec::new();
            for i in 0..next_intervals.min(4) {
                let start = now + Duration::minutes(resolution_minutes * i as i64);
                let end = start + Duration::minutes(resolution_minutes);
                out.push(TariffInterval {
                    start_time: start,
                    end_time: end,
                    channel_type: ChannelType::General,
                    duration_minutes: resolution_minutes,
                    per_kwh: 20.0 + i as f64,
                });
            }
            Ok(out)
        }
    }

    #[test]
    fn consolidation_prefers_short_term_then_long_term_tail() {
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let feed = Arc::new(FakeFeed { calls: Mutex::new(Vec::new()) });
        let mut mgr = PricingManager::new(feed, AmberMode::Live, "/tmp/does-not-matter.json".into(), 300, 3);
        mgr.fetch_and_consolidate(now).unwrap();

        let slots = mgr.get_sorted(ChannelType::General);
        assert!(!slots.is_empty());
        assert!(slots.windows(2).all(|w| w[0].price_per_kwh <= w[1].price_per_kwh));
        assert!((mgr.get_current_price(ChannelType::General) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_mode_refresh_is_a_no_op() {
        let feed = Arc::new(FakeFeed { calls: Mutex::new(Vec::new()) });
        let mut mgr = PricingManager::new(feed, AmberMode::Disabled, "/tmp/unused.json".into(), 300, 3);
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        assert!(mgr.refresh(now).is_ok());
        assert_eq!(mgr.get_current_price(ChannelType::General), 0.0);
    }
}
