//! Response time histogram derived from the recursor's answer buckets
//!
//! The recursor does not expose individual response times. It counts answers
//! into five linear buckets instead: `answers0-1` holds answers served in
//! under a millisecond, `answers1-10` those between one and ten and so on,
//! with `answers-slow` catching everything above one second. A Prometheus
//! histogram wants cumulative buckets, so each bucket here reports its own
//! count plus that of every faster bucket. Sum is unknown and reported as
//! zero.
//!
//! The histogram is not a standing instrument. It is assembled as a
//! [`MetricFamily`] every cycle and handed out next to the gathered ones.

use prometheus::{
    Opts,
    proto::{Bucket, Histogram, Metric, MetricFamily, MetricType},
};
use rustc_hash::FxHashMap;

use crate::collector::MissingKey;

/// Metric name of the derived histogram, without namespace or subsystem.
pub const NAME: &str = "response_time_seconds";
/// Help text of the derived histogram.
pub const HELP: &str = "Histogram of PowerDNS recursor response times in seconds.";

/// The recursor's answer buckets and their upper bounds, in seconds.
pub const BUCKETS: [(&str, f64); 5] = [
    ("answers0-1", 0.001),
    ("answers1-10", 0.01),
    ("answers10-100", 0.1),
    ("answers100-1000", 1.0),
    ("answers-slow", f64::INFINITY),
];

// 2^64, the first float no u64 count can hold.
const COUNT_LIMIT: f64 = 18_446_744_073_709_551_616.0;

/// Errors produced by [`build`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// A bucket statistic is absent from the snapshot.
    #[error(transparent)]
    Missing(#[from] MissingKey),
    /// A bucket statistic is negative, fractional or not finite.
    #[error("Bucket statistic {key} is not a count: {value}")]
    NotACount {
        /// The offending statistic
        key: &'static str,
        /// Its value
        value: f64,
    },
}

/// Build the response time histogram from a statistics snapshot.
///
/// `opts` supplies the fully qualified name and help text.
///
/// # Errors
///
/// Returns an error for the first bucket statistic that is absent from
/// `snapshot` or does not hold a count. No histogram is produced in that
/// case.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn build(opts: &Opts, snapshot: &FxHashMap<String, f64>) -> Result<MetricFamily, Error> {
    let mut bounds: Vec<(f64, u64)> = Vec::with_capacity(BUCKETS.len());
    for (key, upper_bound) in BUCKETS {
        let value = snapshot.get(key).copied().ok_or(MissingKey { key })?;
        let is_count =
            value.is_finite() && value >= 0.0 && value < COUNT_LIMIT && value.fract() <= 0.0;
        if !is_count {
            return Err(Error::NotACount { key, value });
        }
        bounds.push((upper_bound, value as u64));
    }
    bounds.sort_by(|a, b| a.0.total_cmp(&b.0));

    let count = bounds
        .iter()
        .fold(0_u64, |total, (_, n)| total.saturating_add(*n));

    let mut histogram = Histogram::default();
    histogram.set_sample_count(count);
    histogram.set_sample_sum(0.0);
    // The encoder adds the +Inf bucket from the sample count.
    let mut cumulative = 0_u64;
    for (upper_bound, n) in bounds {
        if !upper_bound.is_finite() {
            continue;
        }
        cumulative = cumulative.saturating_add(n);
        let mut bucket = Bucket::default();
        bucket.set_upper_bound(upper_bound);
        bucket.set_cumulative_count(cumulative);
        histogram.mut_bucket().push(bucket);
    }

    let mut metric = Metric::default();
    metric.set_histogram(histogram);

    let mut family = MetricFamily::default();
    family.set_name(opts.fq_name());
    family.set_help(opts.help.clone());
    family.set_field_type(MetricType::HISTOGRAM);
    family.mut_metric().push(metric);
    Ok(family)
}
