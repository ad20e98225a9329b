//! Core model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Network UPS Tools text protocol over TCP.
    Nut,
    /// SNMPv1 against the standard UPS-MIB over UDP.
    Snmp,
}

impl Protocol {
    /// Conventional port for the protocol: 3493 for NUT, 161 for SNMP.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Nut => 3493,
            Protocol::Snmp => 161,
        }
    }
}

/// A monitored UPS device.
///
/// The protocol kind determines which credential fields are meaningful:
/// `ups_name`/`username`/`password` for NUT, `community` for SNMP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Registry identity. 0 means "assign on add".
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub host: String,
    /// 0 means "use the protocol's conventional port".
    #[serde(default)]
    pub port: u16,
    pub protocol: Protocol,
    /// Name of the UPS on the NUT server (the `<upsname>` in commands).
    #[serde(default)]
    pub ups_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// SNMP community string.
    #[serde(default = "default_community")]
    pub community: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub battery_installed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub battery_notes: String,
}

fn default_community() -> String {
    "public".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Device {
    /// The port to connect to, falling back to the protocol default.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.protocol.default_port()
        } else {
            self.port
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: String::new(),
            port: 0,
            protocol: Protocol::Nut,
            ups_name: String::new(),
            username: None,
            password: None,
            community: default_community(),
            enabled: true,
            battery_installed: None,
            battery_notes: String::new(),
        }
    }
}

/// Battery charge/discharge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Discharging,
    Low,
    Normal,
    Unknown,
}

/// Where the UPS output power is coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Mains,
    Battery,
    Bypass,
}

/// Estimated battery runtime.
///
/// `Unbounded` means the firmware reports no finite discharge horizon,
/// typically a unit on mains with a full battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryRuntime {
    Minutes(u32),
    Unbounded,
}

/// Normalized status snapshot for one device.
///
/// Replaced wholesale on every poll. Numeric fields are optional: `None`
/// means "not reported", never "measured zero". When `is_online` is false
/// the numeric fields carry the last successfully observed values and
/// consumers must treat them as stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsStatus {
    pub device_id: i64,
    pub is_online: bool,
    pub battery_charge_pct: Option<f64>,
    pub runtime: Option<BatteryRuntime>,
    pub battery_state: BatteryState,
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub load_pct: Option<f64>,
    pub output_power_w: Option<f64>,
    pub output_source: Option<OutputSource>,
    pub temperature_c: Option<f64>,
    pub active_alarms: u32,
    /// Cumulative count of input power failures reported by the device.
    pub power_failures: Option<u32>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub ups_name: Option<String>,
    /// Reason the last poll failed, for diagnostics. Cleared on success.
    pub last_failure: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl UpsStatus {
    /// An online snapshot with every optional field absent.
    pub fn online(device_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            is_online: true,
            battery_charge_pct: None,
            runtime: None,
            battery_state: BatteryState::Unknown,
            input_voltage: None,
            output_voltage: None,
            battery_voltage: None,
            load_pct: None,
            output_power_w: None,
            output_source: None,
            temperature_c: None,
            active_alarms: 0,
            power_failures: None,
            manufacturer: None,
            model: None,
            ups_name: None,
            last_failure: None,
            last_update: now,
        }
    }

    /// The snapshot recorded for a failed poll.
    ///
    /// Carries the numeric fields of the previous snapshot unchanged (or
    /// leaves them absent when the device was never successfully polled),
    /// marks the device offline, and records the failure reason.
    pub fn offline_from(
        prev: Option<&UpsStatus>,
        device_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut status = match prev {
            Some(p) => p.clone(),
            None => {
                let mut empty = Self::online(device_id, now);
                empty.is_online = false;
                empty
            }
        };
        status.device_id = device_id;
        status.is_online = false;
        status.last_failure = Some(reason.to_string());
        status.last_update = now;
        status
    }
}

/// One timestamped energy observation, appended per successful poll.
///
/// Voltages and the cumulative failure counter ride along because the
/// aggregation queries consume them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySample {
    pub device_id: i64,
    pub time: DateTime<Utc>,
    /// Instantaneous output power in watts.
    pub power_w: f64,
    /// Instantaneous output load in percent.
    pub load_pct: f64,
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,
    pub power_failures: Option<u32>,
}

impl EnergySample {
    /// Build a sample from a snapshot, or `None` when the snapshot has no
    /// trustworthy wattage (offline, or power/load not reported).
    pub fn from_status(status: &UpsStatus) -> Option<Self> {
        if !status.is_online {
            return None;
        }
        let power_w = status.output_power_w?;
        let load_pct = status.load_pct?;
        Some(Self {
            device_id: status.device_id,
            time: status.last_update,
            power_w,
            load_pct,
            input_voltage: status.input_voltage,
            output_voltage: status.output_voltage,
            power_failures: status.power_failures,
        })
    }
}

/// Aggregated energy metrics for one device over a queried range.
///
/// Computed on demand from the sample series; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyMetrics {
    pub sample_count: usize,
    /// Mean of per-sample efficiency, output V / input V, capped at 100.
    pub avg_efficiency_pct: Option<f64>,
    /// Total energy consumed over the range, watt-hours.
    pub total_energy_wh: f64,
    pub peak_load_pct: Option<f64>,
    pub avg_load_pct: Option<f64>,
    pub peak_power_w: Option<f64>,
    pub avg_power_w: Option<f64>,
    /// Span between the first and last sample in range, seconds.
    pub uptime_seconds: i64,
    /// Power failures observed within the range.
    pub power_failures: u32,
    /// Average consumption per calendar day of the queried range, Wh.
    pub daily_avg_wh: f64,
}

impl EnergyMetrics {
    /// The well-defined "no data" result for a range with zero samples.
    pub fn empty() -> Self {
        Self {
            sample_count: 0,
            avg_efficiency_pct: None,
            total_energy_wh: 0.0,
            peak_load_pct: None,
            avg_load_pct: None,
            peak_power_w: None,
            avg_power_w: None,
            uptime_seconds: 0,
            power_failures: 0,
            daily_avg_wh: 0.0,
        }
    }
}
