//! Wire contracts the core consumes from external collaborators. These are
//! the seams named in the configuration/external-interfaces design: the core
//! is built and tested entirely against these traits, never against a
//! concrete HTTP client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::OutputState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    General,
    ControlledLoad,
}

/// One priced interval as returned by a tariff feed, timestamps in UTC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TariffInterval {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub channel_type: ChannelType,
    pub duration_minutes: i64,
    pub per_kwh: f64,
}

/// Supplied by the implementer; fetches upcoming tariff intervals.
pub trait TariffFeed: Send + Sync {
    fn fetch(
        &self,
        now: DateTime<Utc>,
        next_intervals: u32,
        resolution_minutes: i64,
    ) -> anyhow::Result<Vec<TariffInterval>>;
}

#[derive(Clone, Debug)]
pub struct DeviceLocation {
    pub tz: String,
    pub lat: f64,
    pub lon: f64,
}

/// Supplied by the implementer; talks to the physical relay hardware.
pub trait Device: Send + Sync {
    /// Refreshes and returns the latest state for one physical device.
    fn refresh(&self, device_id: u32) -> anyhow::Result<crate::models::DeviceInfo>;
    /// Commands an output on a device; returns (ok, did_change).
    fn change_output(&self, output_id: u32, state: OutputState) -> anyhow::Result<(bool, bool)>;
    fn get_location(&self, device_id: u32) -> anyhow::Result<DeviceLocation>;
}

/// Admin-surface commands posted into the controller. The admin HTTP server
/// itself is out of scope; the core only reads from this channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum AdminCommand {
    #[serde(rename = "set_mode")]
    SetMode {
        output_id: u32,
        mode: AdminOutputMode,
        revert_minutes: Option<u32>,
    },
    #[serde(rename = "shelly_sequence_completed")]
    SequenceCompleted {
        sequence_id: u64,
        label: String,
        ok: bool,
        error: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminOutputMode {
    On,
    Off,
    Auto,
}
