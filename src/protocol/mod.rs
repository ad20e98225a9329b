//! Protocol clients for polling UPS devices.
//!
//! Supports the NUT text protocol (TCP) and SNMPv1 (UDP).

pub mod nut;
pub mod quirks;
pub mod snmp;

pub use nut::NutError;
pub use snmp::{SnmpError, SnmpField, SnmpFieldError, SnmpValue};

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::db::{Device, Protocol};

/// Protocol error types.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Nut(#[from] NutError),
    #[error(transparent)]
    Snmp(#[from] SnmpError),
}

impl ProtocolError {
    /// True when the failure was the device not answering in time, as
    /// opposed to answering with a protocol-level rejection.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Nut(NutError::ConnectTimeout { .. })
                | ProtocolError::Nut(NutError::ReadTimeout(_))
        )
    }
}

/// Raw output of one poll, before normalization.
#[derive(Debug, Clone)]
pub enum RawPoll {
    /// NUT variable map: `battery.charge` -> `87`.
    Nut { vars: BTreeMap<String, String> },
    /// SNMP per-field results: a value or a failure reason per OID.
    Snmp {
        values: BTreeMap<SnmpField, SnmpValue>,
        failures: BTreeMap<SnmpField, SnmpFieldError>,
    },
}

impl RawPoll {
    /// Manufacturer string as reported by the device, if any.
    pub fn manufacturer(&self) -> Option<&str> {
        match self {
            RawPoll::Nut { vars } => vars
                .get("ups.mfr")
                .or_else(|| vars.get("device.mfr"))
                .map(String::as_str),
            RawPoll::Snmp { values, .. } => values
                .get(&SnmpField::Manufacturer)
                .and_then(SnmpValue::as_str),
        }
    }

    /// Model string as reported by the device, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            RawPoll::Nut { vars } => vars
                .get("ups.model")
                .or_else(|| vars.get("device.model"))
                .map(String::as_str),
            RawPoll::Snmp { values, .. } => {
                values.get(&SnmpField::Model).and_then(SnmpValue::as_str)
            }
        }
    }
}

/// Poll a device over its configured protocol.
///
/// Returns the quirk-corrected raw output. Retry is the scheduler's job;
/// a failure here simply means "offline this cycle".
pub async fn poll_device(device: &Device, timeout: Duration) -> Result<RawPoll, ProtocolError> {
    // Jitter to avoid hitting every device at the same instant; some UPS
    // network cards choke under simultaneous connections.
    let jitter = rand::random::<u64>() % 250;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let mut raw = match device.protocol {
        Protocol::Nut => nut::poll(device, timeout).await?,
        Protocol::Snmp => snmp::poll(device, timeout).await?,
    };

    quirks::apply(&mut raw);
    Ok(raw)
}
