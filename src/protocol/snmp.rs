//! SNMPv1 client for the standard UPS-MIB (RFC 1628).
//!
//! Speaks plain GET over UDP with community-string authentication. The
//! BER encoder/decoder covers exactly what those GETs need; no SNMP crate
//! is involved. Every OID in the catalog is requested independently so a
//! partial MIB implementation on the device degrades one field at a time
//! instead of failing the whole poll.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use super::RawPoll;
use crate::db::Device;

/// Whole-poll failure: nothing at all came back from the agent.
#[derive(Error, Debug)]
pub enum SnmpError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("agent at {0} answered no catalog OID")]
    NoResponse(String),
}

/// Per-OID failure. One field failing never fails the others.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnmpFieldError {
    #[error("request timed out")]
    Timeout,
    #[error("object not implemented by the agent")]
    NoSuchObject,
    #[error("agent error status {0}")]
    ErrorStatus(i64),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("network error: {0}")]
    Network(String),
}

/// A decoded SNMP value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(String),
    Counter(u64),
    Gauge(u64),
    TimeTicks(u64),
    Null,
}

impl SnmpValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SnmpValue::Integer(v) => Some(*v),
            SnmpValue::Counter(v) | SnmpValue::Gauge(v) | SnmpValue::TimeTicks(v) => {
                Some(*v as i64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SnmpValue::OctetString(s) => Some(s),
            _ => None,
        }
    }
}

/// The fixed catalog of UPS-MIB objects the client polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnmpField {
    Manufacturer,
    Model,
    IdentName,
    BatteryStatus,
    SecondsOnBattery,
    RuntimeMinutes,
    ChargePercent,
    BatteryVoltage,
    BatteryTemperature,
    InputLineBads,
    InputVoltage,
    OutputSource,
    OutputVoltage,
    OutputPower,
    OutputLoad,
    AlarmsPresent,
}

impl SnmpField {
    pub fn all() -> &'static [SnmpField] {
        use SnmpField::*;
        &[
            Manufacturer,
            Model,
            IdentName,
            BatteryStatus,
            SecondsOnBattery,
            RuntimeMinutes,
            ChargePercent,
            BatteryVoltage,
            BatteryTemperature,
            InputLineBads,
            InputVoltage,
            OutputSource,
            OutputVoltage,
            OutputPower,
            OutputLoad,
            AlarmsPresent,
        ]
    }

    /// Object identifier under 1.3.6.1.2.1.33 (upsMIB).
    pub fn oid(self) -> &'static [u32] {
        match self {
            SnmpField::Manufacturer => &[1, 3, 6, 1, 2, 1, 33, 1, 1, 1, 0],
            SnmpField::Model => &[1, 3, 6, 1, 2, 1, 33, 1, 1, 2, 0],
            SnmpField::IdentName => &[1, 3, 6, 1, 2, 1, 33, 1, 1, 5, 0],
            SnmpField::BatteryStatus => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 1, 0],
            SnmpField::SecondsOnBattery => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 2, 0],
            SnmpField::RuntimeMinutes => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 3, 0],
            SnmpField::ChargePercent => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 4, 0],
            SnmpField::BatteryVoltage => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 5, 0],
            SnmpField::BatteryTemperature => &[1, 3, 6, 1, 2, 1, 33, 1, 2, 7, 0],
            SnmpField::InputLineBads => &[1, 3, 6, 1, 2, 1, 33, 1, 3, 1, 0],
            SnmpField::InputVoltage => &[1, 3, 6, 1, 2, 1, 33, 1, 3, 3, 1, 3, 1],
            SnmpField::OutputSource => &[1, 3, 6, 1, 2, 1, 33, 1, 4, 1, 0],
            SnmpField::OutputVoltage => &[1, 3, 6, 1, 2, 1, 33, 1, 4, 4, 1, 2, 1],
            SnmpField::OutputPower => &[1, 3, 6, 1, 2, 1, 33, 1, 4, 4, 1, 4, 1],
            SnmpField::OutputLoad => &[1, 3, 6, 1, 2, 1, 33, 1, 4, 4, 1, 5, 1],
            SnmpField::AlarmsPresent => &[1, 3, 6, 1, 2, 1, 33, 1, 6, 1, 0],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SnmpField::Manufacturer => "upsIdentManufacturer",
            SnmpField::Model => "upsIdentModel",
            SnmpField::IdentName => "upsIdentName",
            SnmpField::BatteryStatus => "upsBatteryStatus",
            SnmpField::SecondsOnBattery => "upsSecondsOnBattery",
            SnmpField::RuntimeMinutes => "upsEstimatedMinutesRemaining",
            SnmpField::ChargePercent => "upsEstimatedChargeRemaining",
            SnmpField::BatteryVoltage => "upsBatteryVoltage",
            SnmpField::BatteryTemperature => "upsBatteryTemperature",
            SnmpField::InputLineBads => "upsInputLineBads",
            SnmpField::InputVoltage => "upsInputVoltage",
            SnmpField::OutputSource => "upsOutputSource",
            SnmpField::OutputVoltage => "upsOutputVoltage",
            SnmpField::OutputPower => "upsOutputPower",
            SnmpField::OutputLoad => "upsOutputPercentLoad",
            SnmpField::AlarmsPresent => "upsAlarmsPresent",
        }
    }
}

// BER tags used by SNMPv1.
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

const SNMP_VERSION_1: i64 = 0;

/// Request id counter so concurrent polls can match replies to requests.
static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Poll an SNMP agent for the full OID catalog.
///
/// Each OID gets its own GET with its own bounded timeout; the result
/// carries a value or a failure reason per field. The poll as a whole
/// fails only when no OID resolves at all.
pub async fn poll(device: &Device, timeout: Duration) -> Result<RawPoll, SnmpError> {
    let addr = format!("{}:{}", device.host, device.effective_port());
    let target = tokio::net::lookup_host(&addr)
        .await?
        .next()
        .ok_or_else(|| SnmpError::Resolve(addr.clone()))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;

    let per_request = timeout.min(Duration::from_secs(2));
    let mut values = BTreeMap::new();
    let mut failures = BTreeMap::new();

    for &field in SnmpField::all() {
        match get_one(&socket, &device.community, field, per_request).await {
            Ok(value) => {
                values.insert(field, value);
            }
            Err(reason) => {
                tracing::debug!(oid = field.name(), %reason, "SNMP field unavailable");
                failures.insert(field, reason);
            }
        }
    }

    if values.is_empty() {
        return Err(SnmpError::NoResponse(addr));
    }

    Ok(RawPoll::Snmp { values, failures })
}

/// One GET exchange. Waits past responses with stale request ids, which
/// show up when an earlier request timed out and its answer arrived late.
async fn get_one(
    socket: &UdpSocket,
    community: &str,
    field: SnmpField,
    timeout: Duration,
) -> Result<SnmpValue, SnmpFieldError> {
    let request_id = next_request_id();
    let packet = build_get_request(community, field.oid(), request_id);

    socket
        .send(&packet)
        .await
        .map_err(|e| SnmpFieldError::Network(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => return Err(SnmpFieldError::Network(e.to_string())),
            Err(_) => return Err(SnmpFieldError::Timeout),
        };

        let response = parse_get_response(&buf[..len], field.oid())?;
        if response.request_id != request_id as i64 {
            continue;
        }
        return response.result;
    }
}

// --- BER encoding ---

fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Strip redundant leading octets while keeping the sign bit intact.
    while start < 7 {
        let first = bytes[start];
        let next_high_bit = bytes[start + 1] & 0x80;
        if (first == 0x00 && next_high_bit == 0) || (first == 0xFF && next_high_bit != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn oid_content(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oid.len() + 2);
    if oid.len() >= 2 {
        out.push((oid[0] * 40 + oid[1]) as u8);
    }
    for &arc in oid.iter().skip(2) {
        let mut groups = [0u8; 5];
        let mut n = 0;
        let mut v = arc;
        loop {
            groups[n] = (v & 0x7F) as u8;
            n += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            let continuation = if i > 0 { 0x80 } else { 0 };
            out.push(groups[i] | continuation);
        }
    }
    out
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let len_bytes = (len as u32).to_be_bytes();
        let skip = len_bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (4 - skip) as u8);
        out.extend_from_slice(&len_bytes[skip..]);
    }
    out.extend_from_slice(content);
}

fn build_get_request(community: &str, oid: &[u32], request_id: i32) -> Vec<u8> {
    let mut varbind = Vec::new();
    push_tlv(&mut varbind, TAG_OID, &oid_content(oid));
    push_tlv(&mut varbind, TAG_NULL, &[]);

    let mut varbind_list = Vec::new();
    push_tlv(&mut varbind_list, TAG_SEQUENCE, &varbind);

    let mut pdu = Vec::new();
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(request_id as i64));
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(0)); // error-status
    push_tlv(&mut pdu, TAG_INTEGER, &integer_content(0)); // error-index
    push_tlv(&mut pdu, TAG_SEQUENCE, &varbind_list);

    let mut message = Vec::new();
    push_tlv(&mut message, TAG_INTEGER, &integer_content(SNMP_VERSION_1));
    push_tlv(&mut message, TAG_OCTET_STRING, community.as_bytes());
    push_tlv(&mut message, TAG_GET_REQUEST, &pdu);

    let mut packet = Vec::new();
    push_tlv(&mut packet, TAG_SEQUENCE, &message);
    packet
}

// --- BER decoding ---

struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), SnmpFieldError> {
        let tag = *self
            .data
            .get(self.pos)
            .ok_or_else(|| SnmpFieldError::Malformed("truncated tag".to_string()))?;
        self.pos += 1;

        let first = *self
            .data
            .get(self.pos)
            .ok_or_else(|| SnmpFieldError::Malformed("truncated length".to_string()))?;
        self.pos += 1;

        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 4 {
                return Err(SnmpFieldError::Malformed(format!(
                    "unsupported length form {first:#04x}"
                )));
            }
            let mut len = 0usize;
            for _ in 0..count {
                let byte = *self
                    .data
                    .get(self.pos)
                    .ok_or_else(|| SnmpFieldError::Malformed("truncated length".to_string()))?;
                self.pos += 1;
                len = (len << 8) | byte as usize;
            }
            len
        };

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| SnmpFieldError::Malformed("content overruns packet".to_string()))?;
        let content = &self.data[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8], SnmpFieldError> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            return Err(SnmpFieldError::Malformed(format!(
                "expected tag {expected:#04x}, got {tag:#04x}"
            )));
        }
        Ok(content)
    }
}

/// Two's-complement big-endian integer. Content longer than eight octets
/// cannot be a sane SNMP integer; only the low eight are read so a hostile
/// packet cannot overflow the shift.
fn read_integer(content: &[u8]) -> i64 {
    if content.is_empty() {
        return 0;
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content.iter().take(8) {
        value = (value << 8) | byte as i64;
    }
    value
}

fn read_unsigned(content: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for &byte in content.iter().take(8) {
        value = (value << 8) | byte as u64;
    }
    value
}

#[derive(Debug)]
struct ParsedResponse {
    request_id: i64,
    result: Result<SnmpValue, SnmpFieldError>,
}

/// Decode a GetResponse and pull out the value for the expected OID.
fn parse_get_response(
    packet: &[u8],
    expected_oid: &[u32],
) -> Result<ParsedResponse, SnmpFieldError> {
    let mut outer = BerReader::new(packet);
    let message = outer.expect(TAG_SEQUENCE)?;

    let mut message = BerReader::new(message);
    let _version = read_integer(message.expect(TAG_INTEGER)?);
    let _community = message.expect(TAG_OCTET_STRING)?;
    let pdu = message.expect(TAG_GET_RESPONSE)?;

    let mut pdu = BerReader::new(pdu);
    let request_id = read_integer(pdu.expect(TAG_INTEGER)?);
    let error_status = read_integer(pdu.expect(TAG_INTEGER)?);
    let _error_index = read_integer(pdu.expect(TAG_INTEGER)?);

    if error_status != 0 {
        // noSuchName is the common "partial MIB" answer; anything else is
        // a real agent error.
        let result = if error_status == 2 {
            Err(SnmpFieldError::NoSuchObject)
        } else {
            Err(SnmpFieldError::ErrorStatus(error_status))
        };
        return Ok(ParsedResponse { request_id, result });
    }

    let varbind_list = pdu.expect(TAG_SEQUENCE)?;
    let mut varbind_list = BerReader::new(varbind_list);
    let varbind = varbind_list.expect(TAG_SEQUENCE)?;

    let mut varbind = BerReader::new(varbind);
    let oid = varbind.expect(TAG_OID)?;
    if oid != oid_content(expected_oid).as_slice() {
        return Err(SnmpFieldError::Malformed("OID mismatch".to_string()));
    }

    let (tag, content) = varbind.read_tlv()?;
    let result = match tag {
        TAG_INTEGER => Ok(SnmpValue::Integer(read_integer(content))),
        TAG_OCTET_STRING => Ok(SnmpValue::OctetString(
            String::from_utf8_lossy(content)
                .trim_end_matches('\0')
                .to_string(),
        )),
        TAG_COUNTER32 => Ok(SnmpValue::Counter(read_unsigned(content))),
        TAG_GAUGE32 => Ok(SnmpValue::Gauge(read_unsigned(content))),
        TAG_TIMETICKS => Ok(SnmpValue::TimeTicks(read_unsigned(content))),
        TAG_NULL => Ok(SnmpValue::Null),
        0x80..=0x82 => Err(SnmpFieldError::NoSuchObject),
        other => Err(SnmpFieldError::Malformed(format!(
            "unsupported value tag {other:#04x}"
        ))),
    };

    Ok(ParsedResponse { request_id, result })
}
