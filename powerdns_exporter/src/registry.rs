//! Static tables mapping PowerDNS statistics onto exported metrics
//!
//! PowerDNS exposes a flat list of named statistics. Which of those we care
//! about, and under what metric name and label they are exported, depends on
//! the flavor of the server answering: a recursor and an authoritative server
//! share almost no statistic names. Every table here is `'static` data; a
//! [`Registry`] is simply the pair of tables selected for one flavor and is
//! handed to [`crate::collector::Collector`] at construction.

use std::{fmt, str::FromStr};

/// The metric namespace shared by every exported metric.
pub const NAMESPACE: &str = "powerdns";

/// Definition of a gauge fed by a single PowerDNS statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaugeDefinition {
    /// Identifier, unique within its table
    pub id: u32,
    /// Metric name, without namespace or subsystem
    pub name: &'static str,
    /// Help text
    pub desc: &'static str,
    /// The PowerDNS statistic this gauge reads
    pub key: &'static str,
}

/// Definition of a counter with one label dimension.
///
/// Each `(key, label_value)` pair says that the PowerDNS statistic `key`
/// is exported under this counter with `label = label_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterVecDefinition {
    /// Identifier, unique within its table
    pub id: u32,
    /// Metric name, without namespace or subsystem
    pub name: &'static str,
    /// Help text
    pub desc: &'static str,
    /// The single label name of this counter
    pub label: &'static str,
    /// PowerDNS statistic to label value
    pub label_map: &'static [(&'static str, &'static str)],
}

/// The operating mode of the PowerDNS server being scraped.
///
/// Parsed from the `daemon_type` field of the server identity document. The
/// flavor's string form doubles as the metric subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerFlavor {
    /// The PowerDNS recursor
    Recursor,
    /// The PowerDNS authoritative server
    Authoritative,
    /// dnsdist, the PowerDNS load balancer
    Dnsdist,
    /// Anything else PowerDNS might report
    Other(String),
}

impl ServerFlavor {
    /// The string form of this flavor, as reported by PowerDNS.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ServerFlavor::Recursor => "recursor",
            ServerFlavor::Authoritative => "authoritative",
            ServerFlavor::Dnsdist => "dnsdist",
            ServerFlavor::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for ServerFlavor {
    fn from(s: &str) -> Self {
        match s {
            "recursor" => ServerFlavor::Recursor,
            "authoritative" => ServerFlavor::Authoritative,
            "dnsdist" => ServerFlavor::Dnsdist,
            other => ServerFlavor::Other(other.to_string()),
        }
    }
}

impl From<String> for ServerFlavor {
    fn from(s: String) -> Self {
        ServerFlavor::from(s.as_str())
    }
}

impl FromStr for ServerFlavor {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ServerFlavor::from(s))
    }
}

impl fmt::Display for ServerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The metric definitions bound to one [`ServerFlavor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registry {
    /// Gauges, in export order
    pub gauges: &'static [GaugeDefinition],
    /// Labeled counters, in export order
    pub counter_vecs: &'static [CounterVecDefinition],
    /// Whether the response time histogram is derived for this flavor
    pub response_time_histogram: bool,
}

impl Registry {
    /// Select the tables for `flavor`.
    ///
    /// Flavors without tables, dnsdist among them, get an empty registry. The
    /// exporter then only reports its own health and scrape counters.
    #[must_use]
    pub fn for_flavor(flavor: &ServerFlavor) -> Self {
        match flavor {
            ServerFlavor::Recursor => Self {
                gauges: RECURSOR_GAUGES,
                counter_vecs: RECURSOR_COUNTER_VECS,
                response_time_histogram: true,
            },
            ServerFlavor::Authoritative => Self {
                gauges: AUTHORITATIVE_GAUGES,
                counter_vecs: AUTHORITATIVE_COUNTER_VECS,
                response_time_histogram: false,
            },
            ServerFlavor::Dnsdist => Self {
                gauges: DNSDIST_GAUGES,
                counter_vecs: DNSDIST_COUNTER_VECS,
                response_time_histogram: false,
            },
            ServerFlavor::Other(_) => Self::empty(),
        }
    }

    /// A registry without any definitions.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            gauges: &[],
            counter_vecs: &[],
            response_time_histogram: false,
        }
    }

    // Count the gauge and label definitions that read `key`.
    #[cfg(test)]
    pub(crate) fn references(&self, key: &str) -> usize {
        let gauges = self.gauges.iter().filter(|def| def.key == key).count();
        let labels = self
            .counter_vecs
            .iter()
            .flat_map(|def| def.label_map.iter())
            .filter(|(k, _)| *k == key)
            .count();
        gauges + labels
    }
}

const RECURSOR_RTIME_LABELS: &[(&str, &str)] = &[
    ("answers0-1", "0-1ms"),
    ("answers1-10", "1-10ms"),
    ("answers10-100", "10-100ms"),
    ("answers100-1000", "100-1000ms"),
    ("answers-slow", ">1000ms"),
    ("packetcache-hits", "0ms"),
];

const RECURSOR_RCODE_LABELS: &[(&str, &str)] = &[
    ("servfail-answers", "servfail"),
    ("nxdomain-answers", "nxdomain"),
    ("noerror-answers", "noerror"),
];

const RECURSOR_EXCEPTION_LABELS: &[(&str, &str)] = &[
    ("resource-limits", "resource-limit"),
    ("over-capacity-drops", "over-capacity-drop"),
    ("unreachables", "ns-unreachable"),
    ("outgoing-timeouts", "outgoing-timeout"),
];

const RECURSOR_GAUGES: &[GaugeDefinition] = &[
    GaugeDefinition {
        id: 1,
        name: "latency_avg_microseconds",
        desc: "Question-to-answer latency average in microseconds.",
        key: "qa-latency",
    },
    GaugeDefinition {
        id: 2,
        name: "concurrent_queries",
        desc: "Number of concurrent queries.",
        key: "concurrent-queries",
    },
    GaugeDefinition {
        id: 3,
        name: "cache_size",
        desc: "Number of entries in the cache.",
        key: "cache-entries",
    },
];

const RECURSOR_COUNTER_VECS: &[CounterVecDefinition] = &[
    CounterVecDefinition {
        id: 1,
        name: "incoming_queries_total",
        desc: "Total number of incoming queries by network.",
        label: "net",
        label_map: &[("questions", "udp"), ("tcp-questions", "tcp")],
    },
    CounterVecDefinition {
        id: 2,
        name: "outgoing_queries_total",
        desc: "Total number of outgoing queries by network.",
        label: "net",
        label_map: &[("all-outqueries", "udp"), ("tcp-outqueries", "tcp")],
    },
    CounterVecDefinition {
        id: 3,
        name: "cache_lookups_total",
        desc: "Total number of cache lookups by result.",
        label: "result",
        label_map: &[("cache-hits", "hit"), ("cache-misses", "miss")],
    },
    CounterVecDefinition {
        id: 4,
        name: "answers_rcodes_total",
        desc: "Total number of answers by response code.",
        label: "rcode",
        label_map: RECURSOR_RCODE_LABELS,
    },
    CounterVecDefinition {
        id: 5,
        name: "answers_rtime_total",
        desc: "Total number of answers by response time.",
        label: "responsetime",
        label_map: RECURSOR_RTIME_LABELS,
    },
    CounterVecDefinition {
        id: 6,
        name: "exceptions_total",
        desc: "Total number of exceptions by type.",
        label: "type",
        label_map: RECURSOR_EXCEPTION_LABELS,
    },
];

const AUTHORITATIVE_GAUGES: &[GaugeDefinition] = &[
    GaugeDefinition {
        id: 1,
        name: "latency_avg_microseconds",
        desc: "Question-to-answer latency average in microseconds.",
        key: "latency",
    },
    GaugeDefinition {
        id: 2,
        name: "packet_cache_size",
        desc: "Number of entries in the packet cache.",
        key: "packetcache-size",
    },
    GaugeDefinition {
        id: 3,
        name: "signature_cache_size",
        desc: "Number of entries in the signature cache.",
        key: "signature-cache-size",
    },
    GaugeDefinition {
        id: 4,
        name: "key_cache_size",
        desc: "Number of entries in the key cache.",
        key: "key-cache-size",
    },
    GaugeDefinition {
        id: 5,
        name: "metadata_cache_size",
        desc: "Number of entries in the metadata cache.",
        key: "meta-cache-size",
    },
    GaugeDefinition {
        id: 6,
        name: "qsize",
        desc: "Number of packets waiting for database attention.",
        key: "qsize-q",
    },
];

const AUTHORITATIVE_COUNTER_VECS: &[CounterVecDefinition] = &[
    CounterVecDefinition {
        id: 1,
        name: "queries_total",
        desc: "Total number of queries by network.",
        label: "net",
        label_map: &[("tcp-queries", "tcp"), ("udp-queries", "udp")],
    },
    CounterVecDefinition {
        id: 2,
        name: "answers_total",
        desc: "Total number of answers by network.",
        label: "net",
        label_map: &[("tcp-answers", "tcp"), ("udp-answers", "udp")],
    },
    CounterVecDefinition {
        id: 3,
        name: "recursive_queries_total",
        desc: "Total number of recursive queries by status.",
        label: "status",
        label_map: &[
            ("rd-queries", "requested"),
            ("recursing-questions", "processed"),
            ("recursing-answers", "answered"),
            ("recursion-unanswered", "unanswered"),
        ],
    },
    CounterVecDefinition {
        id: 4,
        name: "update_queries_total",
        desc: "Total number of DNS update queries by status.",
        label: "status",
        label_map: &[
            ("dnsupdate-answers", "answered"),
            ("dnsupdate-changes", "applied"),
            ("dnsupdate-queries", "requested"),
            ("dnsupdate-refused", "refused"),
        ],
    },
    CounterVecDefinition {
        id: 5,
        name: "packet_cache_lookups_total",
        desc: "Total number of packet-cache lookups by result.",
        label: "result",
        label_map: &[("packetcache-hit", "hit"), ("packetcache-miss", "miss")],
    },
    CounterVecDefinition {
        id: 6,
        name: "query_cache_lookups_total",
        desc: "Total number of query-cache lookups by result.",
        label: "result",
        label_map: &[("query-cache-hit", "hit"), ("query-cache-miss", "miss")],
    },
    CounterVecDefinition {
        id: 7,
        name: "exceptions_total",
        desc: "Total number of exceptions by type.",
        label: "type",
        label_map: &[
            ("servfail-packets", "servfail"),
            ("timedout-questions", "timeout"),
            ("udp-recvbuf-errors", "recvbuf-error"),
            ("udp-sndbuf-errors", "sndbuf-error"),
        ],
    },
];

// dnsdist statistics are not mapped yet.
const DNSDIST_GAUGES: &[GaugeDefinition] = &[];
const DNSDIST_COUNTER_VECS: &[CounterVecDefinition] = &[];

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const ALL_FLAVORS: [ServerFlavor; 3] = [
        ServerFlavor::Recursor,
        ServerFlavor::Authoritative,
        ServerFlavor::Dnsdist,
    ];

    #[test]
    fn flavor_round_trips_through_its_string_form() {
        for flavor in ALL_FLAVORS {
            assert_eq!(ServerFlavor::from(flavor.as_str()), flavor);
        }
        let other: ServerFlavor = "gateway".parse().expect("infallible");
        assert_eq!(other, ServerFlavor::Other("gateway".to_string()));
        assert_eq!(other.to_string(), "gateway");
    }

    #[test]
    fn unknown_flavor_selects_empty_registry() {
        let registry = Registry::for_flavor(&ServerFlavor::Other("gateway".to_string()));
        assert!(registry.gauges.is_empty());
        assert!(registry.counter_vecs.is_empty());
        assert!(!registry.response_time_histogram);
        assert_eq!(registry, Registry::empty());
    }

    #[test]
    fn dnsdist_is_empty_for_now() {
        let registry = Registry::for_flavor(&ServerFlavor::Dnsdist);
        assert!(registry.gauges.is_empty());
        assert!(registry.counter_vecs.is_empty());
    }

    #[test]
    fn only_recursor_derives_response_time_histogram() {
        assert!(Registry::for_flavor(&ServerFlavor::Recursor).response_time_histogram);
        assert!(!Registry::for_flavor(&ServerFlavor::Authoritative).response_time_histogram);
    }

    #[test]
    fn ids_and_label_values_are_distinct() {
        for flavor in ALL_FLAVORS {
            let registry = Registry::for_flavor(&flavor);

            let gauge_ids: HashSet<u32> = registry.gauges.iter().map(|d| d.id).collect();
            assert_eq!(gauge_ids.len(), registry.gauges.len(), "{flavor}: gauge ids");

            let vec_ids: HashSet<u32> = registry.counter_vecs.iter().map(|d| d.id).collect();
            assert_eq!(vec_ids.len(), registry.counter_vecs.len(), "{flavor}: vec ids");

            for def in registry.counter_vecs {
                let labels: HashSet<&str> = def.label_map.iter().map(|(_, l)| *l).collect();
                assert_eq!(labels.len(), def.label_map.len(), "{flavor}: {}", def.name);
            }
        }
    }

    #[test]
    fn references_counts_gauges_and_labels() {
        let registry = Registry::for_flavor(&ServerFlavor::Recursor);
        assert_eq!(registry.references("qa-latency"), 1);
        assert_eq!(registry.references("cache-misses"), 1);
        assert_eq!(registry.references("answers-slow"), 1);
        assert_eq!(registry.references("no-such-statistic"), 0);
    }
}
