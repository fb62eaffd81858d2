//! The diperiodic metric reader: a collector polling instruments on one
//! cadence and an exporter flushing the sample ring on another, so
//! high-frequency gauges never overwhelm the exporter.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ReaderSchema;
use crate::Result;

/// How many samples the ring retains before dropping the oldest.
const RING_CAPACITY: usize = 65_536;

/// Instrument shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstrumentKind {
    /// Point-in-time value, overwritten per series.
    Gauge,
    /// Monotonically accumulated value.
    Sum,
}

/// One collected measurement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricSample {
    /// Instrument name, e.g. `latency` or `request.sum`.
    pub name: String,
    /// Instrument shape.
    pub kind: InstrumentKind,
    /// Measured value.
    pub value: f64,
    /// Tag set, merged from attribute providers and operation tags.
    pub attributes: BTreeMap<String, String>,
    /// Collection instant, nanoseconds since the Unix epoch.
    pub observed_at_nanos: u64,
}

#[derive(Debug, Clone)]
struct Series {
    name: &'static str,
    kind: InstrumentKind,
    attributes: BTreeMap<String, String>,
    value: f64,
}

/// Current instrument values, keyed by name plus tag set.
#[derive(Debug, Default)]
pub struct Instruments {
    series: Mutex<HashMap<String, Series>>,
}

impl Instruments {
    /// Overwrites a gauge series.
    pub fn record_gauge(&self, name: &'static str, attributes: BTreeMap<String, String>, value: f64) {
        self.upsert(name, InstrumentKind::Gauge, attributes, value, false);
    }

    /// Accumulates into a sum series.
    pub fn record_sum(&self, name: &'static str, attributes: BTreeMap<String, String>, delta: f64) {
        self.upsert(name, InstrumentKind::Sum, attributes, delta, true);
    }

    fn upsert(
        &self,
        name: &'static str,
        kind: InstrumentKind,
        attributes: BTreeMap<String, String>,
        value: f64,
        accumulate: bool,
    ) {
        let key = series_key(name, &attributes);
        let mut series = self.series.lock().expect("instrument state poisoned");
        series
            .entry(key)
            .and_modify(|s| {
                if accumulate {
                    s.value += value;
                } else {
                    s.value = value;
                }
            })
            .or_insert(Series {
                name,
                kind,
                attributes,
                value,
            });
    }

    /// Snapshots every series as samples stamped now.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let observed_at_nanos = now_nanos();
        self.series
            .lock()
            .expect("instrument state poisoned")
            .values()
            .map(|s| MetricSample {
                name: s.name.to_string(),
                kind: s.kind,
                value: s.value,
                attributes: s.attributes.clone(),
                observed_at_nanos,
            })
            .collect()
    }
}

fn series_key(name: &str, attributes: &BTreeMap<String, String>) -> String {
    let mut key = String::from(name);
    for (tag, value) in attributes {
        key.push('|');
        key.push_str(tag);
        key.push('=');
        key.push_str(value);
    }
    key
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Bounded buffer between the collector and the exporter.
#[derive(Debug, Default)]
pub struct SampleRing {
    inner: Mutex<VecDeque<MetricSample>>,
}

impl SampleRing {
    /// Appends a batch, dropping the oldest samples past capacity.
    pub fn push(&self, samples: Vec<MetricSample>) {
        let mut ring = self.inner.lock().expect("sample ring poisoned");
        for sample in samples {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(sample);
        }
    }

    /// Takes everything currently buffered.
    pub fn drain(&self) -> Vec<MetricSample> {
        self.inner
            .lock()
            .expect("sample ring poisoned")
            .drain(..)
            .collect()
    }

    /// Buffered sample count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("sample ring poisoned").len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination of exported sample batches.
#[async_trait]
pub trait MetricExporter: Send + Sync + std::fmt::Debug {
    /// Ships one batch.
    async fn export(&self, batch: &[MetricSample]) -> Result<()>;
}

/// Writes each sample as a JSON line through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleExporter;

#[async_trait]
impl MetricExporter for ConsoleExporter {
    async fn export(&self, batch: &[MetricSample]) -> Result<()> {
        for sample in batch {
            match serde_json::to_string(sample) {
                Ok(line) => tracing::info!(target: "msc_telemetry", "{}", line),
                Err(err) => tracing::warn!(error = %err, "unexportable sample"),
            }
        }
        Ok(())
    }
}

/// Background tasks of one reader. Aborted when dropped.
#[derive(Debug)]
pub struct ReaderTasks {
    collector: tokio::task::JoinHandle<()>,
    exporter: tokio::task::JoinHandle<()>,
}

impl Drop for ReaderTasks {
    fn drop(&mut self) {
        self.collector.abort();
        self.exporter.abort();
    }
}

/// Spawns the collector and exporter loops on the current runtime.
pub fn spawn_reader(
    schema: &ReaderSchema,
    instruments: std::sync::Arc<Instruments>,
    ring: std::sync::Arc<SampleRing>,
    exporter: std::sync::Arc<dyn MetricExporter>,
) -> ReaderTasks {
    let collect_interval = Duration::from_millis(schema.collect_interval_millis.max(1));
    let collect_timeout = Duration::from_millis(schema.collect_interval_timeout.max(1));
    let export_interval = Duration::from_millis(schema.export_interval_millis.max(1));
    let export_timeout = Duration::from_millis(schema.export_timeout_millis.max(1));

    let collector = {
        let instruments = instruments.clone();
        let ring = ring.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collect_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = tokio::time::timeout(collect_timeout, async {
                    instruments.snapshot()
                })
                .await;
                match snapshot {
                    Ok(samples) => ring.push(samples),
                    Err(_) => tracing::warn!("metric collection pass timed out"),
                }
            }
        })
    };

    let exporter_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(export_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let batch = ring.drain();
            if batch.is_empty() {
                continue;
            }
            match tokio::time::timeout(export_timeout, exporter.export(&batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "metric export failed"),
                Err(_) => tracing::warn!("metric export pass timed out"),
            }
        }
    });

    ReaderTasks {
        collector,
        exporter: exporter_task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sums_accumulate_and_gauges_overwrite() {
        let instruments = Instruments::default();
        let attrs = tags(&[("operation", "read")]);
        instruments.record_sum("request.sum", attrs.clone(), 1.0);
        instruments.record_sum("request.sum", attrs.clone(), 1.0);
        instruments.record_gauge("latency", attrs.clone(), 0.5);
        instruments.record_gauge("latency", attrs, 0.25);

        let snapshot = instruments.snapshot();
        let sum = snapshot.iter().find(|s| s.name == "request.sum").unwrap();
        assert_eq!(sum.value, 2.0);
        assert_eq!(sum.kind, InstrumentKind::Sum);
        let gauge = snapshot.iter().find(|s| s.name == "latency").unwrap();
        assert_eq!(gauge.value, 0.25);
    }

    #[test]
    fn distinct_tag_sets_are_distinct_series() {
        let instruments = Instruments::default();
        instruments.record_sum("response.sum", tags(&[("status", "success")]), 1.0);
        instruments.record_sum("response.sum", tags(&[("status", "error.not_found")]), 1.0);
        assert_eq!(instruments.snapshot().len(), 2);
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let ring = SampleRing::default();
        let sample = MetricSample {
            name: "latency".to_string(),
            kind: InstrumentKind::Gauge,
            value: 1.0,
            attributes: BTreeMap::new(),
            observed_at_nanos: 0,
        };
        ring.push(vec![sample.clone(); RING_CAPACITY + 10]);
        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.drain().len(), RING_CAPACITY);
        assert!(ring.is_empty());
    }
}
