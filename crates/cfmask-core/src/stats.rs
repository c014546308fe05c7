//! Percentile routines over clear-pixel samples.
//!
//! Both walk candidate thresholds upward from the sample minimum in unit
//! steps and return the first threshold at which the cumulative fraction of
//! samples at or below it reaches the requested percentage. This matches the
//! histogram semantics the dynamic cloud-probability thresholds are defined
//! against, rather than an interpolated order statistic.

/// Percentile of i16 samples via a bucket histogram over `[min, max]`.
///
/// Returns 0.0 for an empty sample set.
pub fn prctile_i16(samples: &[i16], min: i16, max: i16, pct: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let lo = min as i32;
    let hi = max as i32;
    let levels = (hi - lo + 1) as usize;
    let mut hist = vec![0u32; levels];
    for &v in samples {
        hist[(v as i32 - lo) as usize] += 1;
    }

    let total = samples.len() as f64;
    let mut cum = 0u64;
    for (i, &count) in hist.iter().enumerate() {
        cum += count as u64;
        if 100.0 * cum as f64 / total >= pct as f64 {
            return (lo + i as i32) as f32;
        }
    }

    max as f32
}

/// Percentile of f32 samples: thresholds step by 1.0 from `min`, and the
/// result is the first `min + i` whose at-or-below fraction reaches `pct`.
///
/// Returns 0.0 for an empty sample set.
pub fn prctile_f32(samples: &[f32], min: f32, max: f32, pct: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let total = sorted.len() as f64;
    let steps = (max - min + 1.0).ceil() as i64;
    for i in 0..steps.max(1) {
        let threshold = min + i as f32;
        let at_or_below = sorted.partition_point(|&v| v <= threshold);
        if 100.0 * at_or_below as f64 / total >= pct as f64 {
            return threshold;
        }
    }

    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_samples_return_zero() {
        assert_eq!(prctile_i16(&[], 0, 0, 50.0), 0.0);
        assert_eq!(prctile_f32(&[], 0.0, 0.0, 50.0), 0.0);
    }

    #[test]
    fn uniform_samples_return_the_value() {
        let v = vec![2500i16; 100];
        assert_relative_eq!(prctile_i16(&v, 2500, 2500, 17.5), 2500.0);
        assert_relative_eq!(prctile_i16(&v, 2500, 2500, 82.5), 2500.0);
    }

    #[test]
    fn i16_percentile_walks_histogram() {
        // 1..=100: the 82.5 percentile is the smallest v with >= 82.5% of
        // samples at or below it, i.e. 83.
        let v: Vec<i16> = (1..=100).collect();
        assert_relative_eq!(prctile_i16(&v, 1, 100, 82.5), 83.0);
        assert_relative_eq!(prctile_i16(&v, 1, 100, 17.5), 18.0);
    }

    #[test]
    fn i16_percentile_ignores_slack_bounds() {
        // A caller-supplied min below the true minimum only adds empty
        // buckets; the result is unchanged.
        let v: Vec<i16> = (1..=100).collect();
        assert_relative_eq!(prctile_i16(&v, 0, 100, 17.5), 18.0);
    }

    #[test]
    fn f32_percentile_steps_by_one_from_min() {
        let v = vec![10.0f32, 10.0, 10.0, 50.5, 50.5];
        // 60% of samples are <= 10.0, so the 50th percentile lands on min.
        assert_relative_eq!(prctile_f32(&v, 10.0, 50.5, 50.0), 10.0);
        // The 90th requires walking up to the first threshold at or above
        // 50.5, which is min + 41 = 51.0... capped by the walk reaching it.
        let p90 = prctile_f32(&v, 10.0, 50.5, 90.0);
        assert!(p90 >= 50.5 && p90 <= 51.0, "p90 = {p90}");
    }

    #[test]
    fn bimodal_threshold_prefers_lower_mode() {
        // 952 low values and 36 high ones: the 82.5 percentile must stay on
        // the low mode.
        let mut v = vec![28.6f32; 952];
        v.extend(std::iter::repeat(77.0).take(36));
        let p = prctile_f32(&v, 28.6, 77.0, 82.5);
        assert_relative_eq!(p, 28.6);
    }
}
