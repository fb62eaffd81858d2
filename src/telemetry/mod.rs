//! The telemetry pipeline: attribute providers, per-operation instruments,
//! the diperiodic metric reader, a tail-sampled span pipeline, and the
//! cross-process manager.

mod attributes;
mod manager;
mod reader;
mod trace;

pub use self::attributes::{
    merged_attributes, AttributesProvider, EnvironmentAttributes, HostAttributes,
    ProcessAttributes, StaticAttributes, ThreadAttributes,
};
pub use self::manager::{TcpExporter, TelemetryManager, DEFAULT_MANAGER_ADDR};
pub use self::reader::{
    ConsoleExporter, InstrumentKind, Instruments, MetricExporter, MetricSample, SampleRing,
};
pub use self::trace::{ConsoleSpanExporter, SpanExporter, SpanSample, TailSampler};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ReaderSchema, TelemetrySchema};
use crate::{Error, Result};

/// Records every storage operation into the metric and span pipelines.
///
/// One recorder is shared by every client in the process. The reader tasks
/// start lazily on the first recording made inside a tokio runtime.
#[derive(Debug)]
pub struct Recorder {
    base_attributes: BTreeMap<String, String>,
    instruments: Arc<Instruments>,
    ring: Arc<SampleRing>,
    reader: ReaderSchema,
    exporter: Arc<dyn MetricExporter>,
    tail: Option<TailSampler>,
    tasks: once_cell::sync::OnceCell<reader::ReaderTasks>,
}

impl Recorder {
    /// Builds the recorder a `opentelemetry` config block describes.
    pub fn from_schema(schema: &TelemetrySchema) -> Result<Arc<Recorder>> {
        let metrics = schema.metrics.clone().unwrap_or_default();
        let exporter: Arc<dyn MetricExporter> = match &metrics.exporter {
            None => Arc::new(ConsoleExporter),
            Some(exporter) => match exporter.provider_type.as_str() {
                "console" => Arc::new(ConsoleExporter),
                "tcp" => Arc::new(TcpExporter::new(
                    exporter
                        .option_str("endpoint")
                        .unwrap_or(DEFAULT_MANAGER_ADDR),
                )),
                other => {
                    return Err(Error::invalid(format!(
                        "unknown metric exporter type {:?}",
                        other
                    )))
                }
            },
        };
        let tail = schema.traces.as_ref().map(|traces| {
            TailSampler::new(
                Duration::from_millis(traces.latency_threshold_millis),
                Box::new(ConsoleSpanExporter),
            )
        });
        Ok(Arc::new(Recorder {
            base_attributes: merged_attributes(&metrics.attributes)?,
            instruments: Arc::new(Instruments::default()),
            ring: Arc::new(SampleRing::default()),
            reader: metrics.reader.unwrap_or_default(),
            exporter,
            tail,
            tasks: once_cell::sync::OnceCell::new(),
        }))
    }

    /// A recorder with explicit cadences and exporter; used directly by
    /// tests and by child processes forwarding to a manager.
    pub fn with_exporter(
        reader: ReaderSchema,
        base_attributes: BTreeMap<String, String>,
        exporter: Arc<dyn MetricExporter>,
    ) -> Arc<Recorder> {
        Arc::new(Recorder {
            base_attributes,
            instruments: Arc::new(Instruments::default()),
            ring: Arc::new(SampleRing::default()),
            reader,
            exporter,
            tail: None,
            tasks: once_cell::sync::OnceCell::new(),
        })
    }

    /// Marks an operation as issued: one `request.sum` increment.
    pub fn operation_started(&self, provider: &str, operation: &'static str) {
        self.ensure_started();
        self.instruments
            .record_sum("request.sum", self.tags(provider, operation, None), 1.0);
    }

    /// Marks an operation as finished: latency/size/rate gauges plus
    /// `response.sum` and `data_size.sum`, all tagged with the status.
    pub fn operation_finished(
        &self,
        provider: &str,
        operation: &'static str,
        status: &str,
        latency_secs: f64,
        bytes: Option<u64>,
    ) {
        self.ensure_started();
        let tags = self.tags(provider, operation, Some(status));
        self.instruments
            .record_gauge("latency", tags.clone(), latency_secs);
        if let Some(bytes) = bytes {
            self.instruments
                .record_gauge("data_size", tags.clone(), bytes as f64);
            if latency_secs > 0.0 {
                self.instruments
                    .record_gauge("data_rate", tags.clone(), bytes as f64 / latency_secs);
            }
            self.instruments
                .record_sum("data_size.sum", tags.clone(), bytes as f64);
        }
        self.instruments.record_sum("response.sum", tags, 1.0);

        if let Some(tail) = &self.tail {
            tail.observe(&SpanSample {
                provider: provider.to_string(),
                operation: operation.to_string(),
                status: status.to_string(),
                duration_secs: latency_secs,
            });
        }
    }

    /// Accepts samples forwarded by a child process; they enter the ring as
    /// collected and leave through this recorder's exporter.
    pub fn ingest(&self, samples: Vec<MetricSample>) {
        self.ensure_started();
        self.ring.push(samples);
    }

    /// Current instrument values; test and diagnostic hook.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.instruments.snapshot()
    }

    fn tags(
        &self,
        provider: &str,
        operation: &'static str,
        status: Option<&str>,
    ) -> BTreeMap<String, String> {
        let mut tags = self.base_attributes.clone();
        tags.insert("provider".to_string(), provider.to_string());
        tags.insert("operation".to_string(), operation.to_string());
        if let Some(status) = status {
            tags.insert("status".to_string(), status.to_string());
        }
        tags
    }

    // The reader needs a runtime; recordings made before one exists stay in
    // the instruments and are picked up once the tasks start.
    fn ensure_started(&self) {
        if self.tasks.get().is_some() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        self.tasks.get_or_init(|| {
            reader::spawn_reader(
                &self.reader,
                self.instruments.clone(),
                self.ring.clone(),
                self.exporter.clone(),
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CaptureExporter {
        batches: Mutex<Vec<Vec<MetricSample>>>,
    }

    #[async_trait::async_trait]
    impl MetricExporter for CaptureExporter {
        async fn export(&self, batch: &[MetricSample]) -> Result<()> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn fast_reader() -> ReaderSchema {
        ReaderSchema {
            collect_interval_millis: 10,
            collect_interval_timeout: 50,
            export_interval_millis: 20,
            export_timeout_millis: 50,
        }
    }

    #[tokio::test]
    async fn one_request_pairs_with_one_response() {
        let recorder =
            Recorder::with_exporter(fast_reader(), BTreeMap::new(), Arc::new(ConsoleExporter));
        recorder.operation_started("memory", "read");
        recorder.operation_finished("memory", "read", "success", 0.05, Some(128));

        let snapshot = recorder.snapshot();
        let value = |name: &str| {
            snapshot
                .iter()
                .filter(|s| s.name == name)
                .map(|s| s.value)
                .sum::<f64>()
        };
        assert_eq!(value("request.sum"), 1.0);
        assert_eq!(value("response.sum"), 1.0);
        assert_eq!(value("data_size.sum"), 128.0);
        assert_eq!(value("latency"), 0.05);

        let rate = snapshot.iter().find(|s| s.name == "data_rate").unwrap();
        assert!((rate.value - 128.0 / 0.05).abs() < 1e-6);
        let response = snapshot.iter().find(|s| s.name == "response.sum").unwrap();
        assert_eq!(
            response.attributes.get("status").map(String::as_str),
            Some("success")
        );
    }

    #[tokio::test]
    async fn error_statuses_form_their_own_series() {
        let recorder =
            Recorder::with_exporter(fast_reader(), BTreeMap::new(), Arc::new(ConsoleExporter));
        recorder.operation_finished("memory", "read", "success", 0.01, None);
        recorder.operation_finished("memory", "read", "error.not_found", 0.01, None);

        let responses: Vec<MetricSample> = recorder
            .snapshot()
            .into_iter()
            .filter(|s| s.name == "response.sum")
            .collect();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn collector_and_exporter_run_on_their_own_cadences() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("msc_telemetry=info")
            .try_init();
        let capture = Arc::new(CaptureExporter::default());
        let recorder = Recorder::with_exporter(
            fast_reader(),
            BTreeMap::from([("service".to_string(), "msc".to_string())]),
            capture.clone(),
        );
        recorder.operation_started("memory", "write");
        recorder.operation_finished("memory", "write", "success", 0.01, Some(4));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let batches = capture.batches.lock().unwrap();
        assert!(!batches.is_empty());
        let exported: Vec<&MetricSample> = batches.iter().flatten().collect();
        assert!(exported.iter().any(|s| s.name == "request.sum"));
        assert!(exported.iter().any(|s| s.name == "response.sum"));
        assert!(exported
            .iter()
            .all(|s| s.attributes.get("service").map(String::as_str) == Some("msc")));
    }
}
