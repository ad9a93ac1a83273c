//! The collection cycle
//!
//! A [`Collector`] turns one PowerDNS statistics list into one set of metric
//! families. Every call to [`Collector::collect`] runs a full cycle:
//!
//! 1. scrape: fetch the statistics list, recording health and scrape counts,
//! 2. reset: drop every label value of every labeled counter,
//! 3. populate: set gauges and counter labels from the fresh snapshot,
//! 4. publish: gather every instrument, plus the response time histogram for
//!    recursors.
//!
//! A failed fetch stops the cycle after step 1 and publishes only the
//! exporter's own instruments. A statistic missing from the snapshot never
//! stops the cycle: it counts as a parse failure and the affected gauge keeps
//! its previous value, or the affected label is left out. An empty statistics
//! list is a snapshot in which every statistic is missing, not a no-op.
//!
//! Instruments are shared by every caller of [`Collector::collect`]. Steps 1
//! through 4 mutate and read them under one lock, so cycles never interleave
//! and nobody observes a half-populated set. The fetch itself runs before the
//! lock is taken.

use std::{fmt, time::Instant};

use prometheus::{Counter, CounterVec, Gauge, Opts, proto::MetricFamily};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::{
    fetch::{StatEntry, StatsSource},
    histogram,
    registry::{NAMESPACE, Registry, ServerFlavor},
    telemetry,
};

/// Gauges reading a statistic with this suffix are reported by PowerDNS in
/// microseconds and exported in seconds.
const LATENCY_SUFFIX: &str = "latency";
const MICROSECONDS_PER_SECOND: f64 = 1_000_000.0;

/// Errors produced by [`Collector`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An instrument could not be created or registered, most likely because
    /// the flavor does not form a valid metric name.
    #[error("Failed to create instrument: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A statistic the registry expects was absent from the snapshot.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Expected PowerDNS stats key not found: {key}")]
pub struct MissingKey {
    /// The absent statistic
    pub key: &'static str,
}

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

struct Instruments {
    up: Gauge,
    total_scrapes: Counter,
    json_parse_failures: Counter,
    gauges: FxHashMap<u32, Gauge>,
    counter_vecs: FxHashMap<u32, CounterVec>,
    // the exporter's own instruments, published on every cycle
    health: prometheus::Registry,
    // instruments fed by PowerDNS statistics
    stats: prometheus::Registry,
}

impl Instruments {
    fn new(subsystem: &str, registry: &Registry) -> Result<Self, Error> {
        let health = prometheus::Registry::new();
        let up = Gauge::with_opts(opts(
            subsystem,
            "up",
            "Was the last scrape of PowerDNS successful.",
        ))?;
        let total_scrapes = Counter::with_opts(opts(
            subsystem,
            "exporter_total_scrapes",
            "Current total PowerDNS scrapes.",
        ))?;
        let json_parse_failures = Counter::with_opts(opts(
            subsystem,
            "exporter_json_parse_failures",
            "Number of errors while parsing PowerDNS JSON stats.",
        ))?;
        health.register(Box::new(up.clone()))?;
        health.register(Box::new(total_scrapes.clone()))?;
        health.register(Box::new(json_parse_failures.clone()))?;

        let stats = prometheus::Registry::new();
        let mut gauges = FxHashMap::default();
        for def in registry.gauges {
            let gauge = Gauge::with_opts(opts(subsystem, def.name, def.desc))?;
            stats.register(Box::new(gauge.clone()))?;
            gauges.insert(def.id, gauge);
        }
        let mut counter_vecs = FxHashMap::default();
        for def in registry.counter_vecs {
            let counter_vec = CounterVec::new(opts(subsystem, def.name, def.desc), &[def.label])?;
            stats.register(Box::new(counter_vec.clone()))?;
            counter_vecs.insert(def.id, counter_vec);
        }

        Ok(Self {
            up,
            total_scrapes,
            json_parse_failures,
            gauges,
            counter_vecs,
            health,
            stats,
        })
    }

    // Look `key` up, counting and logging its absence.
    fn lookup(&self, snapshot: &FxHashMap<String, f64>, key: &'static str) -> Option<f64> {
        if let Some(value) = snapshot.get(key) {
            Some(*value)
        } else {
            let err = MissingKey { key };
            warn!(key, "{err}");
            self.json_parse_failures.inc();
            None
        }
    }
}

/// Collects PowerDNS statistics into metric families.
pub struct Collector<S> {
    source: S,
    registry: Registry,
    histogram_opts: Opts,
    instruments: Mutex<Instruments>,
}

impl<S> fmt::Debug for Collector<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("source", &self.source)
            .field("registry", &self.registry)
            .field("histogram_opts", &self.histogram_opts)
            .finish_non_exhaustive()
    }
}

impl<S> Collector<S>
where
    S: StatsSource,
{
    /// Create a new [`Collector`]
    ///
    /// Instruments for every definition in `registry` are created here and
    /// live as long as the collector. Metric names carry `flavor` as their
    /// subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if `flavor` does not yield valid metric names.
    pub fn new(source: S, flavor: &ServerFlavor, registry: Registry) -> Result<Self, Error> {
        let subsystem = flavor.as_str();
        let instruments = Instruments::new(subsystem, &registry)?;

        Ok(Self {
            source,
            registry,
            histogram_opts: opts(subsystem, histogram::NAME, histogram::HELP),
            instruments: Mutex::new(instruments),
        })
    }

    /// Run one collection cycle and return the published families.
    ///
    /// The exporter's own families come first, then those fed by PowerDNS
    /// statistics, each group sorted by name, and last the response time
    /// histogram when the registry derives one. Labeled counters left
    /// without labels are not published.
    pub async fn collect(&self) -> Vec<MetricFamily> {
        let started = Instant::now();
        let fetched = self.source.fetch_stats().await;

        let instruments = self.instruments.lock().await;
        instruments.total_scrapes.inc();

        let stats = match fetched {
            Ok(stats) => stats,
            Err(err) => {
                error!("Error scraping PowerDNS: {err}");
                instruments.up.set(0.0);
                instruments.json_parse_failures.inc();
                telemetry::record_cycle(telemetry::Outcome::ScrapeFailed, started.elapsed());
                return instruments.health.gather();
            }
        };
        instruments.up.set(1.0);

        let snapshot = snapshot(stats);
        debug!("scraped {} PowerDNS statistics", snapshot.len());

        for counter_vec in instruments.counter_vecs.values() {
            counter_vec.reset();
        }
        let failures_before = instruments.json_parse_failures.get();
        self.populate(&instruments, &snapshot);

        let mut families = instruments.health.gather();
        families.extend(instruments.stats.gather());
        if self.registry.response_time_histogram {
            match histogram::build(&self.histogram_opts, &snapshot) {
                Ok(family) => families.push(family),
                Err(err) => error!("Could not create response time histogram: {err}"),
            }
        }

        let outcome = if instruments.json_parse_failures.get() > failures_before {
            telemetry::Outcome::MissingKeys
        } else {
            telemetry::Outcome::Complete
        };
        telemetry::record_cycle(outcome, started.elapsed());
        families
    }

    fn populate(&self, instruments: &Instruments, snapshot: &FxHashMap<String, f64>) {
        for def in self.registry.gauges {
            let Some(mut value) = instruments.lookup(snapshot, def.key) else {
                continue;
            };
            if def.key.ends_with(LATENCY_SUFFIX) {
                value /= MICROSECONDS_PER_SECOND;
            }
            if let Some(gauge) = instruments.gauges.get(&def.id) {
                gauge.set(value);
            }
        }

        for def in self.registry.counter_vecs {
            let Some(counter_vec) = instruments.counter_vecs.get(&def.id) else {
                continue;
            };
            for &(key, label_value) in def.label_map {
                let Some(value) = instruments.lookup(snapshot, key) else {
                    continue;
                };
                if value.is_nan() || value < 0.0 {
                    warn!(key, value, "Counter statistic is negative, skipping");
                    instruments.json_parse_failures.inc();
                    continue;
                }
                counter_vec.with_label_values(&[label_value]).inc_by(value);
            }
        }
    }
}

// Later entries win when PowerDNS repeats a name.
fn snapshot(stats: Vec<StatEntry>) -> FxHashMap<String, f64> {
    let mut map = FxHashMap::default();
    map.reserve(stats.len());
    for entry in stats {
        map.insert(entry.name, entry.value);
    }
    map
}
