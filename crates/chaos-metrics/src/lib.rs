//! Metrics infrastructure for Chaos flooding nodes.
//!
//! Every metric is declared once as a [`Metric`] constant in [`metric_defs`],
//! carrying its name, kind, description, unit and expected label keys. The
//! round scheduler records them once per round, after the slot state machine
//! has been stopped; nothing is recorded from the event path.
//!
//! # Example
//!
//! ```rust,ignore
//! use chaos_metrics::{describe_metrics, metric_defs, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("3", "receiver").to_labels();
//! metrics::counter!(metric_defs::ROUNDS.name, labels.as_slice()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use chaos_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const FRAMES: Metric = Metric::counter("chaos.test.frames")
///     .with_description("Frames seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["node"]);
///
/// assert_eq!(FRAMES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "chaos.slot.tx_packets").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new counter metric.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// Metric definitions for Chaos nodes.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Standard Label Keys
    // ========================================================================

    /// Labels attached to every per-node metric.
    pub const STANDARD_LABELS: &[&str] = &["node", "role"];

    // ========================================================================
    // Slot Anomalies
    // ========================================================================

    pub const MALFORMED_FRAMES: Metric = Metric::counter("chaos.slot.malformed_frames")
        .with_description("Frames dropped for a wrong length or header byte")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const CORRUPT_FRAMES: Metric = Metric::counter("chaos.slot.corrupt_frames")
        .with_description("Frames dropped because the radio reported a bad CRC")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const TIMING_OVERRUNS: Metric = Metric::counter("chaos.slot.timing_overruns")
        .with_description("Relays skipped because the compensation window was exceeded")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const RX_TIMEOUTS: Metric = Metric::counter("chaos.slot.rx_timeouts")
        .with_description("Receptions abandoned after the packet-duration budget")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    // ========================================================================
    // Slot Traffic
    // ========================================================================

    pub const TX_PACKETS: Metric = Metric::counter("chaos.slot.tx_packets")
        .with_description("Frames transmitted")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const TIMEOUT_TX: Metric = Metric::counter("chaos.slot.timeout_tx")
        .with_description("Transmissions triggered by the backoff timeout")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const RX_PACKETS: Metric = Metric::counter("chaos.slot.rx_packets")
        .with_description("Valid frames received and merged")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const RECEPTION_COUNT: Metric = Metric::histogram("chaos.round.reception_count")
        .with_description("Valid receptions per round")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    // ========================================================================
    // Rounds and Synchronization
    // ========================================================================

    pub const ROUNDS: Metric = Metric::counter("chaos.round.count")
        .with_description("Rounds executed")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const ROUNDS_COMPLETE: Metric = Metric::counter("chaos.round.complete")
        .with_description("Rounds that ended with every contribution flag set")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const SYNC_MISSED: Metric = Metric::counter("chaos.sync.missed")
        .with_description("Rounds that ended without an updated reference time")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const SLOT_LENGTH: Metric = Metric::gauge("chaos.sync.slot_length_ticks")
        .with_description("Current slot length estimate in high-resolution ticks")
        .with_labels(STANDARD_LABELS);

    pub const PERIOD_SKEW: Metric = Metric::gauge("chaos.sync.period_skew_ticks")
        .with_description("Reference time drift over the last period in low-resolution ticks")
        .with_labels(STANDARD_LABELS);

    pub const ALL: &[&Metric] = &[
        // Slot anomalies
        &MALFORMED_FRAMES,
        &CORRUPT_FRAMES,
        &TIMING_OVERRUNS,
        &RX_TIMEOUTS,
        // Slot traffic
        &TX_PACKETS,
        &TIMEOUT_TX,
        &RX_PACKETS,
        &RECEPTION_COUNT,
        // Rounds and synchronization
        &ROUNDS,
        &ROUNDS_COMPLETE,
        &SYNC_MISSED,
        &SLOT_LENGTH,
        &PERIOD_SKEW,
    ];
}

/// Standard labels for a node's metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node identifier.
    pub node: String,
    /// Node role ("initiator" or "receiver").
    pub role: String,
}

impl MetricLabels {
    /// Creates labels for a node.
    pub fn new(node: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            role: role.into(),
        }
    }

    /// Converts to the label vector accepted by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("role", self.role.clone())]
    }
}

/// Describes all metrics. Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
