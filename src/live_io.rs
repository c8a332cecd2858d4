//! Concrete `Device`/`TariffFeed` implementations over `reqwest::blocking`.
//! Not exercised by core logic or its tests (see `interfaces.rs`) — only a
//! production binary wiring real hardware needs this module, so it is built
//! only under the `live-io` feature.
//!
//! `ShellyDevice.name` is taken as the device's network address (hostname or
//! IP); `Label` stays the human identifier `OutputConfig` references.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::AmberAPI;
use crate::interfaces::{ChannelType, Device, DeviceLocation, TariffFeed, TariffInterval};
use crate::models::{DeviceInfo, OutputState};

pub struct AmberHttpFeed {
    client: reqwest::blocking::Client,
    api_url: String,
    api_key: String,
}

impl AmberHttpFeed {
    pub fn new(config: &AmberAPI) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(config.timeout)).build()?;
        Ok(AmberHttpFeed { client, api_url: config.api_url.clone(), api_key: config.api_key.clone() })
    }
}

#[derive(Deserialize)]
struct AmberPriceItem {
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    end_time: DateTime<Utc>,
    #[serde(rename = "channelType")]
    channel_type: String,
    #[serde(rename = "perKwh")]
    per_kwh: f64,
}

impl TariffFeed for AmberHttpFeed {
    fn fetch(&self, _now: DateTime<Utc>, next_intervals: u32, resolution_minutes: i64) -> anyhow::Result<Vec<TariffInterval>> {
        let response = self
            .client
            .get(format!("{}/prices/current", self.api_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .query(&[("next", next_intervals.to_string()), ("resolution", resolution_minutes.to_string())])
            .send()
            .context("amber price request failed")?
            .error_for_status()
            .context("amber price request returned an error status")?;

        let items: Vec<AmberPriceItem> = response.json().context("amber price response was not valid JSON")?;

        items
            .into_iter()
            .map(|i| {
                let channel_type = match i.channel_type.as_str() {
                    "general" => ChannelType::General,
                    "controlledLoad" => ChannelType::ControlledLoad,
                    other => return Err(anyhow!("unknown amber channel type '{}'", other)),
                };
                Ok(TariffInterval {
                    start_time: i.start_time,
                    end_time: i.end_time,
                    channel_type,
                    duration_minutes: (i.end_time - i.start_time).num_minutes(),
                    per_kwh: i.per_kwh,
                })
            })
            .collect()
    }
}

pub struct ShellyHttpDevice {
    client: reqwest::blocking::Client,
    hosts: HashMap<u32, String>,
}

impl ShellyHttpDevice {
    pub fn new(hosts: HashMap<u32, String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(ShellyHttpDevice { client, hosts })
    }

    fn host(&self, device_id: u32) -> anyhow::Result<&str> {
        self.hosts.get(&device_id).map(|s| s.as_str()).ok_or_else(|| anyhow!("unknown shelly device id {}", device_id))
    }
}

impl Device for ShellyHttpDevice {
    fn refresh(&self, device_id: u32) -> anyhow::Result<DeviceInfo> {
        let host = self.host(device_id)?;
        let url = format!("http://{}/rpc/Switch.GetStatus?id=0", host);
        let online = self.client.get(&url).send().and_then(|r| r.error_for_status()).is_ok();
        Ok(DeviceInfo { id: device_id, online, expect_offline: false, name: host.to_string(), temp_c: None })
    }

    fn change_output(&self, output_id: u32, state: OutputState) -> anyhow::Result<(bool, bool)> {
        let host = self.host(output_id)?;
        let url = format!("http://{}/rpc/Switch.Set?id=0&on={}", host, state == OutputState::On);
        let response = self.client.get(&url).send().context("shelly switch command failed")?.error_for_status().context("shelly switch command returned an error status")?;
        let _ = response.text();
        Ok((true, true))
    }

    fn get_location(&self, device_id: u32) -> anyhow::Result<DeviceLocation> {
        let host = self.host(device_id)?;
        let url = format!("http://{}/rpc/Sys.GetConfig", host);
        #[derive(Deserialize)]
        struct SysConfig {
            location: SysLocation,
        }
        #[derive(Deserialize)]
        struct SysLocation {
            tz: String,
            lat: f64,
            lon: f64,
        }
        let config: SysConfig = self.client.get(&url).send()?.error_for_status()?.json()?;
        Ok(DeviceLocation { tz: config.location.tz, lat: config.location.lat, lon: config.location.lon })
    }
}
