//! Firmware quirk table.
//!
//! Some UPS firmware misreports units. Each quirk names one known case,
//! matches on the manufacturer/model signature, and fixes the raw poll
//! output in place before normalization. The main parse path never
//! special-cases a vendor.

use super::{RawPoll, SnmpField, SnmpValue};

pub struct Quirk {
    pub name: &'static str,
    applies: fn(manufacturer: &str, model: &str) -> bool,
    apply: fn(&mut RawPoll),
}

static QUIRKS: &[Quirk] = &[
    Quirk {
        // Liebert/Vertiv GXT-family cards fill the runtime-minutes OID
        // with seconds.
        name: "liebert-runtime-seconds",
        applies: |manufacturer, _| {
            manufacturer.contains("liebert") || manufacturer.contains("vertiv")
        },
        apply: |raw| {
            scale_snmp_integer(raw, SnmpField::RuntimeMinutes, |v| v / 60);
        },
    },
    Quirk {
        // APC cards report battery voltage in whole volts instead of the
        // MIB's 0.1 V units; pre-scale so the normal conversion holds.
        name: "apc-battery-whole-volts",
        applies: |manufacturer, _| {
            manufacturer.contains("apc") || manufacturer.contains("american power conversion")
        },
        apply: |raw| {
            scale_snmp_integer(raw, SnmpField::BatteryVoltage, |v| v * 10);
        },
    },
    Quirk {
        // CyberPower firmware revisions that report load in tenths of a
        // percent; values at or below 100 are already sane.
        name: "cyberpower-load-permille",
        applies: |manufacturer, _| manufacturer.contains("cyber"),
        apply: |raw| {
            scale_snmp_integer(raw, SnmpField::OutputLoad, |v| {
                if v > 100 {
                    v / 10
                } else {
                    v
                }
            });
        },
    },
    Quirk {
        // Megatec/Q1-derived NUT drivers report battery.runtime already in
        // minutes; pre-scale so the seconds conversion holds.
        name: "megatec-runtime-minutes",
        applies: |manufacturer, model| manufacturer.contains("megatec") || model.contains("q1"),
        apply: |raw| {
            if let RawPoll::Nut { vars } = raw {
                if let Some(value) = vars.get_mut("battery.runtime") {
                    if let Ok(minutes) = value.parse::<i64>() {
                        *value = (minutes * 60).to_string();
                    }
                }
            }
        },
    },
];

/// Apply every quirk whose signature matches the polled device.
pub fn apply(raw: &mut RawPoll) {
    let manufacturer = raw.manufacturer().unwrap_or_default().to_ascii_lowercase();
    let model = raw.model().unwrap_or_default().to_ascii_lowercase();

    for quirk in QUIRKS {
        if (quirk.applies)(&manufacturer, &model) {
            tracing::debug!(quirk = quirk.name, "applying firmware quirk");
            (quirk.apply)(raw);
        }
    }
}

fn scale_snmp_integer(raw: &mut RawPoll, field: SnmpField, fix: fn(i64) -> i64) {
    if let RawPoll::Snmp { values, .. } = raw {
        if let Some(SnmpValue::Integer(v)) = values.get(&field) {
            let fixed = fix(*v);
            values.insert(field, SnmpValue::Integer(fixed));
        }
    }
}
