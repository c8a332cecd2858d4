use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info};

use crate::config::load_config;
use crate::controller::{resolve_ids, supervise_worker, Controller, WakeEvent};
use crate::device_worker::DeviceWorker;
use crate::logging::setup_logger;
use crate::manager_pricing::PricingManager;
use crate::notify::Notifier;
use crate::output::OutputManager;
use crate::scheduler::Scheduler;
use crate::state::load_latest_state;

mod config;
mod controller;
mod device_worker;
mod errors;
mod history;
mod interfaces;
#[cfg(feature = "live-io")]
mod live_io;
mod logging;
mod macros;
mod manager_pricing;
pub mod models;
mod notify;
mod output;
mod run_plan;
mod scheduler;
mod state;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const MAX_WORKER_RESTARTS: u32 = 10;
const HEARTBEAT_INTERVAL_S: i64 = 3600;

fn config_path_from_args() -> String {
    env::args()
        .find_map(|a| a.strip_prefix("--config=").map(|s| s.to_string()))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

fn main() -> Result<()> {
    let config_path = config_path_from_args();
    let config = load_config(&config_path).with_context(|| format!("failed to load config from {}", config_path))?;

    setup_logger(&config.general.log_path, config.general.log_level, config.general.log_to_stdout)
        .context("failed to set up logging")?;

    info!("power_controller starting, config={}", config_path);

    let now = Local::now();

    let label_to_id: HashMap<String, u32> = config
        .shelly_devices
        .devices
        .iter()
        .enumerate()
        .map(|(i, d)| (d.label.clone(), (i + 1) as u32))
        .collect();

    let notifier = Notifier::new(&config.mail, HEARTBEAT_INTERVAL_S).context("failed to build mail notifier")?;

    let scheduler = Scheduler::new(config.operating_schedules.clone(), &config.location, config.general.default_price, now)
        .context("failed to build scheduler (dawn/dusk computation)")?;

    let device = build_device(&config, &label_to_id)?;
    let tariff_feed = build_tariff_feed(&config)?;

    let pricing = PricingManager::new(
        tariff_feed,
        config.amber_api.mode,
        config.amber_api.prices_cache_file.clone(),
        config.amber_api.refresh_interval,
        config.amber_api.max_concurrent_errors,
    );

    let device_ids: Vec<u32> = label_to_id.values().copied().collect();
    let (worker, worker_handle) = DeviceWorker::new(
        device,
        device_ids,
        config.shelly_devices.max_concurrent_errors,
        config.general.report_critical_errors_delay as u64,
    );
    let worker_snapshot = worker.snapshot();

    let saved_state = load_latest_state(&config.general.state_dir).context("failed to load persisted state")?;

    let outputs: Vec<OutputManager> = config
        .outputs
        .iter()
        .map(|output_config| {
            let ids = resolve_ids(output_config, &label_to_id);
            let saved_output = saved_state.as_ref().and_then(|s| s.outputs.iter().find(|o| o.name == output_config.name));
            let saved_history = saved_output.map(|o| o.history.clone());
            let mut manager = OutputManager::new(output_config.clone(), ids, saved_history, config.general.history_days, now);
            if let Some(saved_output) = saved_output {
                manager.restore(saved_output);
            }
            manager
        })
        .collect();

    let (admin_tx, admin_rx) = crossbeam_channel::unbounded();
    let wake = WakeEvent::new();
    let stop = Arc::new(AtomicBool::new(false));

    install_signal_handler(stop.clone(), wake.clone())?;

    let worker_thread = supervise_worker(worker, stop.clone(), MAX_WORKER_RESTARTS);

    let mut controller = Controller::new(
        &config,
        config_path.clone(),
        outputs,
        pricing,
        scheduler,
        worker_handle,
        worker_snapshot,
        notifier,
        admin_rx,
        wake,
        stop.clone(),
    );

    // admin_tx is the producer half external collaborators (the admin HTTP
    // server, out of scope here) would hold; it simply stays in scope for
    // the rest of main so the channel isn't torn down under the controller.
    let result = controller.run_forever();
    drop(admin_tx);

    stop.store(true, Ordering::Relaxed);
    let _ = worker_thread.join();

    match &result {
        Ok(()) => info!("power_controller stopped cleanly"),
        Err(e) => error!("power_controller stopped with error: {}", e),
    }

    result.context("controller run loop failed")
}

fn install_signal_handler(stop: Arc<AtomicBool>, wake: Arc<WakeEvent>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        stop.store(true, Ordering::Relaxed);
        wake.wake();
    })
    .context("failed to install SIGINT handler")
}

#[cfg(feature = "live-io")]
fn build_device(config: &config::Config, label_to_id: &HashMap<String, u32>) -> Result<Arc<dyn interfaces::Device>> {
    let hosts: HashMap<u32, String> = config
        .shelly_devices
        .devices
        .iter()
        .filter_map(|d| label_to_id.get(&d.label).map(|id| (*id, d.name.clone())))
        .collect();
    Ok(Arc::new(live_io::ShellyHttpDevice::new(hosts)?))
}

#[cfg(not(feature = "live-io"))]
fn build_device(_config: &config::Config, _label_to_id: &HashMap<String, u32>) -> Result<Arc<dyn interfaces::Device>> {
    anyhow::bail!("rebuild with --features live-io to run against real Shelly hardware")
}

#[cfg(feature = "live-io")]
fn build_tariff_feed(config: &config::Config) -> Result<Arc<dyn interfaces::TariffFeed>> {
    Ok(Arc::new(live_io::AmberHttpFeed::new(&config.amber_api)?))
}

#[cfg(not(feature = "live-io"))]
fn build_tariff_feed(_config: &config::Config) -> Result<Arc<dyn interfaces::TariffFeed>> {
    anyhow::bail!("rebuild with --features live-io to fetch tariffs from Amber")
}
