//! Status normalization.
//!
//! Turns the raw output of either protocol client into the common
//! `UpsStatus` snapshot. Pure: no I/O and no clocks, the caller supplies
//! the timestamp. Partial data is the common case and never an error;
//! any field that cannot be populated stays absent so consumers can tell
//! "measured zero" from "not reported".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::db::{BatteryRuntime, BatteryState, Device, OutputSource, UpsStatus};
use crate::protocol::{RawPoll, SnmpField, SnmpValue};

/// Raw runtime values at or above this (or negative ones) mean the
/// firmware reports no finite discharge horizon.
const UNBOUNDED_RUNTIME_FLOOR: i64 = 0x7FFF_FFFF;

/// Normalize one successful poll into a status snapshot.
pub fn normalize(device: &Device, raw: &RawPoll, now: DateTime<Utc>) -> UpsStatus {
    match raw {
        RawPoll::Nut { vars } => normalize_nut(device, vars, now),
        RawPoll::Snmp { values, .. } => normalize_snmp(device, values, now),
    }
}

fn normalize_nut(
    device: &Device,
    vars: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> UpsStatus {
    let mut status = UpsStatus::online(device.id, now);

    status.battery_charge_pct = num(vars, "battery.charge");
    status.runtime = int(vars, "battery.runtime").map(runtime_from_seconds);

    let tokens: Vec<&str> = vars
        .get("ups.status")
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    status.output_source = output_source_from_tokens(&tokens);
    status.battery_state = battery_state_from_tokens(&tokens);

    status.input_voltage = num(vars, "input.voltage");
    status.output_voltage = num(vars, "output.voltage");
    status.battery_voltage = num(vars, "battery.voltage");
    status.load_pct = num(vars, "ups.load");

    // Prefer the measured wattage; fall back to load against the nominal
    // rating when the driver only exposes the latter.
    status.output_power_w = num(vars, "ups.realpower").or_else(|| {
        match (status.load_pct, num(vars, "ups.realpower.nominal")) {
            (Some(load), Some(nominal)) => Some(load * nominal / 100.0),
            _ => None,
        }
    });

    status.temperature_c = num(vars, "ups.temperature").or_else(|| num(vars, "battery.temperature"));

    status.active_alarms = match vars.get("ups.alarm") {
        Some(alarm) => alarm
            .split(';')
            .filter(|entry| !entry.trim().is_empty())
            .count() as u32,
        None if tokens.contains(&"ALARM") => 1,
        None => 0,
    };

    status.power_failures = int(vars, "input.transfer.count").and_then(|v| u32::try_from(v).ok());

    status.manufacturer = string(vars, "ups.mfr").or_else(|| string(vars, "device.mfr"));
    status.model = string(vars, "ups.model").or_else(|| string(vars, "device.model"));
    status.ups_name = string(vars, "ups.id");

    status
}

fn normalize_snmp(
    device: &Device,
    values: &BTreeMap<SnmpField, SnmpValue>,
    now: DateTime<Utc>,
) -> UpsStatus {
    let mut status = UpsStatus::online(device.id, now);

    status.battery_charge_pct = field_i64(values, SnmpField::ChargePercent).map(|v| v as f64);
    status.runtime = field_i64(values, SnmpField::RuntimeMinutes).map(runtime_from_minutes);

    status.input_voltage = field_i64(values, SnmpField::InputVoltage).map(|v| v as f64);
    status.output_voltage = field_i64(values, SnmpField::OutputVoltage).map(|v| v as f64);
    // upsBatteryVoltage is reported in 0.1 V units.
    status.battery_voltage =
        field_i64(values, SnmpField::BatteryVoltage).map(battery_voltage_from_decivolts);
    status.load_pct = field_i64(values, SnmpField::OutputLoad).map(|v| v as f64);
    status.output_power_w = field_i64(values, SnmpField::OutputPower).map(|v| v as f64);
    status.temperature_c = field_i64(values, SnmpField::BatteryTemperature).map(|v| v as f64);

    status.output_source =
        field_i64(values, SnmpField::OutputSource).and_then(output_source_from_snmp);

    let seconds_on_battery = field_i64(values, SnmpField::SecondsOnBattery);
    status.battery_state = battery_state_from_snmp(
        field_i64(values, SnmpField::BatteryStatus),
        seconds_on_battery,
    );

    status.active_alarms = field_i64(values, SnmpField::AlarmsPresent)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    status.power_failures =
        field_i64(values, SnmpField::InputLineBads).and_then(|v| u32::try_from(v).ok());

    status.manufacturer = field_string(values, SnmpField::Manufacturer);
    status.model = field_string(values, SnmpField::Model);
    status.ups_name = field_string(values, SnmpField::IdentName);

    status
}

// --- NUT helpers ---

fn num(vars: &BTreeMap<String, String>, key: &str) -> Option<f64> {
    vars.get(key).and_then(|v| v.trim().parse().ok())
}

fn int(vars: &BTreeMap<String, String>, key: &str) -> Option<i64> {
    vars.get(key).and_then(|v| v.trim().parse().ok())
}

fn string(vars: &BTreeMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn output_source_from_tokens(tokens: &[&str]) -> Option<OutputSource> {
    if tokens.contains(&"BYPASS") {
        Some(OutputSource::Bypass)
    } else if tokens.contains(&"OB") {
        Some(OutputSource::Battery)
    } else if tokens.contains(&"OL") {
        Some(OutputSource::Mains)
    } else {
        None
    }
}

fn battery_state_from_tokens(tokens: &[&str]) -> BatteryState {
    if tokens.contains(&"LB") {
        BatteryState::Low
    } else if tokens.contains(&"CHRG") {
        BatteryState::Charging
    } else if tokens.contains(&"DISCHRG") || tokens.contains(&"OB") {
        BatteryState::Discharging
    } else if tokens.is_empty() {
        BatteryState::Unknown
    } else {
        BatteryState::Normal
    }
}

/// NUT reports `battery.runtime` in seconds.
fn runtime_from_seconds(seconds: i64) -> BatteryRuntime {
    if seconds < 0 || seconds >= UNBOUNDED_RUNTIME_FLOOR {
        BatteryRuntime::Unbounded
    } else {
        BatteryRuntime::Minutes((seconds / 60) as u32)
    }
}

// --- SNMP helpers ---

fn field_i64(values: &BTreeMap<SnmpField, SnmpValue>, field: SnmpField) -> Option<i64> {
    values.get(&field).and_then(SnmpValue::as_i64)
}

fn field_string(values: &BTreeMap<SnmpField, SnmpValue>, field: SnmpField) -> Option<String> {
    values
        .get(&field)
        .and_then(SnmpValue::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn runtime_from_minutes(minutes: i64) -> BatteryRuntime {
    if minutes < 0 || minutes >= UNBOUNDED_RUNTIME_FLOOR {
        BatteryRuntime::Unbounded
    } else {
        BatteryRuntime::Minutes(minutes as u32)
    }
}

/// upsOutputSource: 3 normal, 4 bypass, 5 battery; 6/7 are the
/// booster/reducer states of line-interactive units, still mains-fed.
fn output_source_from_snmp(code: i64) -> Option<OutputSource> {
    match code {
        3 | 6 | 7 => Some(OutputSource::Mains),
        4 => Some(OutputSource::Bypass),
        5 => Some(OutputSource::Battery),
        _ => None,
    }
}

/// upsBatteryStatus: 1 unknown, 2 normal, 3 low, 4 depleted. A nonzero
/// seconds-on-battery overrides "normal" with discharging.
fn battery_state_from_snmp(code: Option<i64>, seconds_on_battery: Option<i64>) -> BatteryState {
    match code {
        Some(3) | Some(4) => BatteryState::Low,
        Some(2) => {
            if seconds_on_battery.unwrap_or(0) > 0 {
                BatteryState::Discharging
            } else {
                BatteryState::Normal
            }
        }
        _ => BatteryState::Unknown,
    }
}

/// Battery voltage needs its own conversion: the MIB unit is 0.1 V.
fn battery_voltage_from_decivolts(decivolts: i64) -> f64 {
    decivolts as f64 / 10.0
}
