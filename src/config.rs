use std::collections::HashMap;
use std::fs;

use log::LevelFilter;
use serde::Deserialize;

use crate::errors::ConfigError;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct General {
    pub polling_interval: u32,
    pub default_price: f64,
    pub report_critical_errors_delay: u32,
    pub testing_mode: bool,
    pub consumption_data_file: Option<String>,
    pub consumption_data_max_days: Option<u32>,
    pub log_path: String,
    pub log_level: LevelFilter,
    pub log_to_stdout: bool,
    /// Directory state backups and schedule artifacts are written to.
    pub state_dir: String,
    pub state_backup_max_hours: i64,
    pub history_days: usize,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum AmberMode {
    Live,
    Offline,
    Disabled,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AmberAPI {
    pub mode: AmberMode,
    pub api_url: String,
    pub api_key: String,
    pub timeout: u64,
    pub max_concurrent_errors: u32,
    pub refresh_interval: i64,
    pub prices_cache_file: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShellyDevice {
    pub name: String,
    pub label: String,
    pub device_alert_temp: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShellyDevices {
    pub max_concurrent_errors: u32,
    #[serde(default)]
    pub devices: Vec<ShellyDevice>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    pub timezone: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub google_maps_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Window {
    pub start_time: String,
    pub end_time: String,
    pub price: Option<f64>,
    pub days_of_week: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperatingSchedule {
    pub name: String,
    pub windows: Vec<Window>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum OutputMode {
    Schedule,
    BestPrice,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum AmberChannel {
    #[serde(rename = "general")]
    General,
    #[serde(rename = "controlledLoad")]
    ControlledLoad,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum InputMode {
    TurnOn,
    TurnOff,
    Ignore,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum TempCondition {
    GreaterThan,
    LessThan,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TempProbeConstraint {
    pub temp_probe: String,
    pub condition: TempCondition,
    pub temperature: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputConfig {
    pub name: String,
    pub device_output: String,
    pub mode: OutputMode,
    pub schedule: Option<String>,
    pub constraint_schedule: Option<String>,
    pub amber_channel: Option<AmberChannel>,
    pub target_hours: f64,
    pub monthly_target_hours: Option<HashMap<String, f64>>,
    pub min_hours: f64,
    pub max_hours: f64,
    pub max_shortfall_hours: f64,
    pub max_best_price: f64,
    pub max_priority_price: f64,
    #[serde(default)]
    pub dates_off: Vec<DateRange>,
    pub device_meter: Option<String>,
    pub device_input: Option<String>,
    pub device_input_mode: Option<InputMode>,
    pub parent_output: Option<String>,
    pub stop_on_exit: bool,
    pub min_on_time: u32,
    pub min_off_time: u32,
    pub max_app_on_time: Option<u32>,
    pub max_app_off_time: Option<u32>,
    pub turn_on_sequence: Option<String>,
    pub turn_off_sequence: Option<String>,
    #[serde(default)]
    pub temp_probe_constraints: Vec<TempProbeConstraint>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum StepType {
    Sleep,
    Delay,
    ChangeOutput,
    RefreshStatus,
    GetLocation,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepConfig {
    #[serde(rename = "Type")]
    pub step_type: StepType,
    pub seconds: Option<u64>,
    pub output_identity: Option<String>,
    pub device_identity: Option<String>,
    pub state: Option<bool>,
    pub retries: Option<u32>,
    pub retry_backoff: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputSequence {
    pub name: String,
    pub timeout: u64,
    pub steps: Vec<StepConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MailParameters {
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_endpoint: String,
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub general: General,
    pub amber_api: AmberAPI,
    pub shelly_devices: ShellyDevices,
    pub location: Location,
    #[serde(default)]
    pub operating_schedules: Vec<OperatingSchedule>,
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub output_sequences: Vec<OutputSequence>,
    pub mail: MailParameters,
}

/// Loads the configuration file, parses the YAML and runs post-parse
/// validation (duplicate output names, dangling references, parent cycles).
///
/// # Arguments
///
/// * 'config_path' - path to the YAML configuration file
pub fn load_config(config_path: &str) -> Result<Config, ConfigError> {
    let yaml = fs::read_to_string(config_path)?;
    let config: Config = serde_yaml::from_str(&yaml)?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen_names = std::collections::HashSet::new();
    for output in &config.outputs {
        if !seen_names.insert(output.name.as_str()) {
            return Err(ConfigError(format!("duplicate output name: {}", output.name)));
        }
    }

    for output in &config.outputs {
        if let Some(schedule) = &output.schedule {
            if output.mode == OutputMode::Schedule
                && !config.operating_schedules.iter().any(|s| &s.name == schedule)
            {
                return Err(ConfigError(format!(
                    "output '{}' references unknown schedule '{}'",
                    output.name, schedule
                )));
            }
        }
        if let Some(seq) = &output.turn_on_sequence {
            if !config.output_sequences.iter().any(|s| &s.name == seq) {
                return Err(ConfigError(format!(
                    "output '{}' references unknown turn-on sequence '{}'",
                    output.name, seq
                )));
            }
        }
        if let Some(seq) = &output.turn_off_sequence {
            if !config.output_sequences.iter().any(|s| &s.name == seq) {
                return Err(ConfigError(format!(
                    "output '{}' references unknown turn-off sequence '{}'",
                    output.name, seq
                )));
            }
        }
        if let Some(parent) = &output.parent_output {
            if !config.outputs.iter().any(|o| &o.name == parent) {
                return Err(ConfigError(format!(
                    "output '{}' references unknown parent '{}'",
                    output.name, parent
                )));
            }
        }
    }

    for output in &config.outputs {
        if has_parent_cycle(output, config) {
            return Err(ConfigError(format!("cyclic parent chain at output '{}'", output.name)));
        }
    }

    Ok(())
}

/// Depth-limited walk up the parent chain to detect a cycle, per the
/// "cycles are rejected at init" ownership rule.
fn has_parent_cycle(start: &OutputConfig, config: &Config) -> bool {
    let mut current = start.parent_output.clone();
    let mut depth = 0;
    while let Some(name) = current {
        depth += 1;
        if depth > config.outputs.len() {
            return true;
        }
        if name == start.name {
            return true;
        }
        current = config
            .outputs
            .iter()
            .find(|o| o.name == name)
            .and_then(|o| o.parent_output.clone());
    }
    false
}
