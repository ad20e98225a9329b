//! SQLite-backed energy sample store.
//!
//! The sample series is append-only from the poll path and read-only from
//! the aggregation path; rows are never updated in place.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::EnergySample;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Thread-safe sample store.
#[derive(Clone)]
pub struct SampleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SampleStore {
    /// Open (or create) a store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with the embedded migration.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    /// Append one sample to a device's series.
    pub fn add_sample(&self, sample: &EnergySample) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO samples (device_id, time, power_w, load_pct, input_voltage, output_voltage, power_failures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.device_id,
                format_db_time(sample.time),
                sample.power_w,
                sample.load_pct,
                sample.input_voltage,
                sample.output_voltage,
                sample.power_failures,
            ],
        )?;
        Ok(())
    }

    /// Get a device's samples within a time range, ascending by time.
    pub fn get_samples(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergySample>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT device_id, time, power_w, load_pct, input_voltage, output_voltage, power_failures
             FROM samples
             WHERE device_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;

        let samples = stmt
            .query_map(
                params![device_id, format_db_time(start), format_db_time(end)],
                |row| {
                    let time_str: String = row.get(1)?;
                    let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                    Ok(EnergySample {
                        device_id: row.get(0)?,
                        time,
                        power_w: row.get(2)?,
                        load_pct: row.get(3)?,
                        input_voltage: row.get(4)?,
                        output_voltage: row.get(5)?,
                        power_failures: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Number of samples stored for a device.
    pub fn sample_count(&self, device_id: i64) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE device_id = ?1",
            params![device_id],
            |r| r.get(0),
        )?)
    }

    /// Delete a device's entire series (used when the device is removed).
    pub fn delete_samples(&self, device_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM samples WHERE device_id = ?1", params![device_id])?;
        Ok(())
    }

    /// Earliest sample time for a device.
    pub fn earliest_sample_time(&self, device_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM samples WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Latest sample time for a device.
    pub fn latest_sample_time(&self, device_id: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn.query_row(
            "SELECT MAX(time) FROM samples WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn sample(device_id: i64, time: DateTime<Utc>, power_w: f64) -> EnergySample {
        EnergySample {
            device_id,
            time,
            power_w,
            load_pct: 30.0,
            input_voltage: Some(230.0),
            output_voltage: Some(228.0),
            power_failures: Some(2),
        }
    }

    #[test]
    fn test_append_and_range_query() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SampleStore::new(tmp.path()).unwrap();

        let base = Utc::now();
        for i in 0..5 {
            store
                .add_sample(&sample(1, base + Duration::seconds(i * 30), 100.0 + i as f64))
                .unwrap();
        }
        // Sibling device series must stay separate.
        store.add_sample(&sample(2, base, 500.0)).unwrap();

        let rows = store
            .get_samples(1, base, base + Duration::seconds(61))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].power_w, 100.0);
        assert_eq!(rows[2].power_w, 102.0);
        assert!(rows.windows(2).all(|w| w[0].time <= w[1].time));

        assert_eq!(store.sample_count(1).unwrap(), 5);
        assert_eq!(store.sample_count(2).unwrap(), 1);
    }

    #[test]
    fn test_optional_fields_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SampleStore::new(tmp.path()).unwrap();

        let base = Utc::now();
        let mut s = sample(1, base, 75.0);
        s.input_voltage = None;
        s.power_failures = None;
        store.add_sample(&s).unwrap();

        let rows = store
            .get_samples(1, base - Duration::seconds(1), base + Duration::seconds(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_voltage, None);
        assert_eq!(rows[0].output_voltage, Some(228.0));
        assert_eq!(rows[0].power_failures, None);
    }

    #[test]
    fn test_delete_samples() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SampleStore::new(tmp.path()).unwrap();

        let base = Utc::now();
        store.add_sample(&sample(1, base, 100.0)).unwrap();
        store.add_sample(&sample(2, base, 200.0)).unwrap();

        store.delete_samples(1).unwrap();
        assert_eq!(store.sample_count(1).unwrap(), 0);
        assert_eq!(store.sample_count(2).unwrap(), 1);
    }

    #[test]
    fn test_earliest_and_latest() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SampleStore::new(tmp.path()).unwrap();

        assert!(store.earliest_sample_time(1).unwrap().is_none());

        let base = Utc::now();
        store.add_sample(&sample(1, base, 100.0)).unwrap();
        store
            .add_sample(&sample(1, base + Duration::minutes(5), 110.0))
            .unwrap();

        let earliest = store.earliest_sample_time(1).unwrap().unwrap();
        let latest = store.latest_sample_time(1).unwrap().unwrap();
        assert!(earliest < latest);
        assert_eq!((latest - earliest).num_minutes(), 5);
    }
}
