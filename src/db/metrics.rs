//! Range aggregation over the energy sample series.
//!
//! All metrics are recomputed from the fetched samples on every query;
//! nothing here holds state, so re-querying the same range yields
//! identical results.

use chrono::{DateTime, Utc};

use super::models::{EnergyMetrics, EnergySample};
use super::store::{DbError, SampleStore};

/// Efficiency values above this are clamped; a UPS never amplifies power.
const EFFICIENCY_CAP_PCT: f64 = 100.0;

/// Fetch a device's samples for the range and aggregate them.
pub fn query_metrics(
    store: &SampleStore,
    device_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<EnergyMetrics, DbError> {
    let samples = store.get_samples(device_id, start, end)?;
    Ok(compute_metrics(&samples, start, end))
}

/// Aggregate a sorted sample slice over the queried range.
///
/// A range with zero samples returns [`EnergyMetrics::empty`]; a range
/// with one sample has peaks and averages equal to that sample and zero
/// integrated energy (no elapsed interval).
pub fn compute_metrics(
    samples: &[EnergySample],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> EnergyMetrics {
    if samples.is_empty() {
        return EnergyMetrics::empty();
    }

    let mut peak_load: f64 = 0.0;
    let mut peak_power: f64 = 0.0;
    let mut load_sum = 0.0;
    let mut power_sum = 0.0;
    let mut efficiency_sum = 0.0;
    let mut efficiency_count = 0usize;

    for s in samples {
        peak_load = peak_load.max(s.load_pct);
        peak_power = peak_power.max(s.power_w);
        load_sum += s.load_pct;
        power_sum += s.power_w;

        if let Some(eff) = sample_efficiency(s) {
            efficiency_sum += eff;
            efficiency_count += 1;
        }
    }

    // Trapezoidal integration: the mean of two adjacent power readings
    // times the elapsed hours between them. Robust to irregular sampling
    // intervals such as a missed poll.
    let mut total_energy_wh = 0.0;
    for pair in samples.windows(2) {
        let elapsed_hours = (pair[1].time - pair[0].time).num_milliseconds() as f64 / 3_600_000.0;
        if elapsed_hours <= 0.0 {
            continue;
        }
        total_energy_wh += (pair[0].power_w + pair[1].power_w) / 2.0 * elapsed_hours;
    }

    let count = samples.len();
    let uptime_seconds = (samples[count - 1].time - samples[0].time).num_seconds();

    let first_failures = samples.iter().find_map(|s| s.power_failures);
    let last_failures = samples.iter().rev().find_map(|s| s.power_failures);
    let power_failures = match (first_failures, last_failures) {
        (Some(first), Some(last)) => last.saturating_sub(first),
        _ => 0,
    };

    let days = calendar_days_spanned(start, end);
    let daily_avg_wh = total_energy_wh / days as f64;

    EnergyMetrics {
        sample_count: count,
        avg_efficiency_pct: if efficiency_count > 0 {
            Some(efficiency_sum / efficiency_count as f64)
        } else {
            None
        },
        total_energy_wh,
        peak_load_pct: Some(peak_load),
        avg_load_pct: Some(load_sum / count as f64),
        peak_power_w: Some(peak_power),
        avg_power_w: Some(power_sum / count as f64),
        uptime_seconds,
        power_failures,
        daily_avg_wh,
    }
}

/// Per-sample efficiency: output V over input V as a percentage, capped at
/// 100. `None` when either voltage is missing or non-positive, which
/// excludes the sample from the average.
fn sample_efficiency(sample: &EnergySample) -> Option<f64> {
    let input = sample.input_voltage?;
    let output = sample.output_voltage?;
    if input <= 0.0 || output <= 0.0 {
        return None;
    }
    Some((output / input * 100.0).min(EFFICIENCY_CAP_PCT))
}

/// Calendar days spanned by the range, minimum one day so sub-day ranges
/// never blow up the daily average.
fn calendar_days_spanned(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let days = (end.date_naive() - start.date_naive()).num_days() + 1;
    days.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    fn sample(time: DateTime<Utc>, power_w: f64, load_pct: f64) -> EnergySample {
        EnergySample {
            device_id: 1,
            time,
            power_w,
            load_pct,
            input_voltage: Some(230.0),
            output_voltage: Some(227.7),
            power_failures: None,
        }
    }

    #[test]
    fn test_empty_range_is_well_defined() {
        let metrics = compute_metrics(&[], at(0), at(30));
        assert_eq!(metrics, EnergyMetrics::empty());
        assert_eq!(metrics.sample_count, 0);
        assert!(metrics.avg_efficiency_pct.is_none());
        assert_eq!(metrics.total_energy_wh, 0.0);
    }

    #[test]
    fn test_single_sample() {
        let samples = vec![sample(at(0), 150.0, 42.0)];
        let metrics = compute_metrics(&samples, at(0), at(30));

        assert_eq!(metrics.sample_count, 1);
        assert_eq!(metrics.peak_load_pct, Some(42.0));
        assert_eq!(metrics.avg_load_pct, Some(42.0));
        assert_eq!(metrics.peak_power_w, Some(150.0));
        assert_eq!(metrics.avg_power_w, Some(150.0));
        // No elapsed interval to integrate over.
        assert_eq!(metrics.total_energy_wh, 0.0);
        assert_eq!(metrics.uptime_seconds, 0);
    }

    #[test]
    fn test_trapezoidal_energy_regular_intervals() {
        // 100 W for a flat hour, sampled every 30 minutes: exactly 100 Wh.
        let samples = vec![
            sample(at(0), 100.0, 20.0),
            sample(at(30), 100.0, 20.0),
            sample(Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap(), 100.0, 20.0),
        ];
        let metrics = compute_metrics(&samples, at(0), at(0) + Duration::hours(1));
        assert!((metrics.total_energy_wh - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_trapezoidal_energy_irregular_intervals() {
        // A missed poll must not double- or under-count: 100 W -> 200 W over
        // 30 min (75 Wh), then 200 W flat over 90 min (300 Wh).
        let samples = vec![
            sample(at(0), 100.0, 20.0),
            sample(at(30), 200.0, 40.0),
            sample(Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap(), 200.0, 40.0),
        ];
        let metrics = compute_metrics(&samples, at(0), at(0) + Duration::hours(2));
        assert!((metrics.total_energy_wh - 375.0).abs() < 1e-9);
    }

    #[test]
    fn test_efficiency_average_and_cap() {
        let mut boosted = sample(at(0), 100.0, 20.0);
        // Output above input reads as >100%; must clamp.
        boosted.input_voltage = Some(220.0);
        boosted.output_voltage = Some(231.0);

        let mut normal = sample(at(1), 100.0, 20.0);
        normal.input_voltage = Some(230.0);
        normal.output_voltage = Some(207.0); // 90%

        let mut unusable = sample(at(2), 100.0, 20.0);
        unusable.input_voltage = None;

        let metrics = compute_metrics(&[boosted, normal, unusable], at(0), at(30));
        // (100 + 90) / 2, the voltage-less sample excluded.
        assert!((metrics.avg_efficiency_pct.unwrap() - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_power_failures_observed_in_range() {
        let mut first = sample(at(0), 100.0, 20.0);
        first.power_failures = Some(10);
        let middle = sample(at(1), 100.0, 20.0); // counter not reported this poll
        let mut last = sample(at(2), 100.0, 20.0);
        last.power_failures = Some(13);

        let metrics = compute_metrics(&[first, middle, last], at(0), at(30));
        assert_eq!(metrics.power_failures, 3);
    }

    #[test]
    fn test_daily_average_minimum_one_day() {
        // Sub-day range: denominator clamps to one day.
        let samples = vec![sample(at(0), 100.0, 20.0), sample(at(30), 100.0, 20.0)];
        let metrics = compute_metrics(&samples, at(0), at(30));
        assert!((metrics.total_energy_wh - 50.0).abs() < 1e-9);
        assert!((metrics.daily_avg_wh - 50.0).abs() < 1e-9);

        // Three calendar days.
        let end = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        let metrics = compute_metrics(&samples, at(0), end);
        assert!((metrics.daily_avg_wh - 50.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_requery_is_idempotent() {
        let samples = vec![
            sample(at(0), 100.0, 20.0),
            sample(at(7), 180.0, 36.0),
            sample(at(30), 90.0, 18.0),
        ];
        let first = compute_metrics(&samples, at(0), at(31));
        let second = compute_metrics(&samples, at(0), at(31));
        assert_eq!(first, second);
    }
}
