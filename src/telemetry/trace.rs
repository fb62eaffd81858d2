//! The span pipeline: a tail sampler that retains slow or failed spans and
//! drops the rest before export.

use std::time::Duration;

/// One finished operation span.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpanSample {
    /// Backend name.
    pub provider: String,
    /// Operation name.
    pub operation: String,
    /// `success` or `error.{kind}`.
    pub status: String,
    /// Wall-clock duration in seconds.
    pub duration_secs: f64,
}

/// Destination of retained spans.
pub trait SpanExporter: Send + Sync + std::fmt::Debug {
    /// Ships one span.
    fn export(&self, span: &SpanSample);
}

/// Writes each retained span as a JSON line through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSpanExporter;

impl SpanExporter for ConsoleSpanExporter {
    fn export(&self, span: &SpanSample) {
        match serde_json::to_string(span) {
            Ok(line) => tracing::info!(target: "msc_traces", "{}", line),
            Err(err) => tracing::warn!(error = %err, "unexportable span"),
        }
    }
}

/// Retains spans that are slow or carry an error status; everything else is
/// dropped before export.
#[derive(Debug)]
pub struct TailSampler {
    threshold: Duration,
    exporter: Box<dyn SpanExporter>,
}

impl TailSampler {
    /// Samples with the given latency threshold and exporter.
    pub fn new(threshold: Duration, exporter: Box<dyn SpanExporter>) -> Self {
        TailSampler {
            threshold,
            exporter,
        }
    }

    /// Feeds one finished span through the sampler. Returns whether it was
    /// retained.
    pub fn observe(&self, span: &SpanSample) -> bool {
        let retain =
            span.status != "success" || span.duration_secs >= self.threshold.as_secs_f64();
        if retain {
            self.exporter.export(span);
        }
        retain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(threshold_millis: u64) -> TailSampler {
        TailSampler::new(
            Duration::from_millis(threshold_millis),
            Box::new(ConsoleSpanExporter),
        )
    }

    fn span(status: &str, duration_secs: f64) -> SpanSample {
        SpanSample {
            provider: "memory".to_string(),
            operation: "read".to_string(),
            status: status.to_string(),
            duration_secs,
        }
    }

    #[test]
    fn fast_successful_spans_are_dropped() {
        assert!(!sampler(1_000).observe(&span("success", 0.01)));
    }

    #[test]
    fn slow_spans_are_retained() {
        assert!(sampler(100).observe(&span("success", 0.5)));
    }

    #[test]
    fn error_spans_are_always_retained() {
        assert!(sampler(10_000).observe(&span("error.not_found", 0.001)));
    }
}
