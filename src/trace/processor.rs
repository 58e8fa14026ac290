//! Background batch export of closed spans.
//!
//! # Responsibilities
//! - Drain the span queue filled by [`SpanSink`](super::span::SpanSink)
//! - Flush a batch when it is full or when the flush interval elapses
//! - Drain and flush one last time on shutdown
//!
//! # Design Decisions
//! - Runs as one spawned task; request paths never wait on export
//! - Each export call is bounded by `export_timeout_ms`
//! - Failed batches are dropped and counted, never retried

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use super::exporter::SpanExporter;
use super::sampler::Sampler;
use super::span::{SpanData, SpanSink};
use super::tracer::Tracer;
use crate::config::schema::TracingConfig;
use crate::observability::metrics::{MetricsRecorder, SPAN_EXPORT_TOTAL};

/// Batching parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub flush_interval: Duration,
    pub export_timeout: Duration,
}

impl BatchConfig {
    pub fn from_config(config: &TracingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_queue_size: config.max_queue_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            export_timeout: Duration::from_millis(config.export_timeout_ms.max(1)),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_config(&TracingConfig::default())
    }
}

/// Owns the receiving end of the span queue.
pub struct BatchSpanProcessor<E> {
    exporter: E,
    receiver: mpsc::Receiver<SpanData>,
    config: BatchConfig,
    recorder: MetricsRecorder,
}

impl<E: SpanExporter> BatchSpanProcessor<E> {
    pub fn new(
        exporter: E,
        receiver: mpsc::Receiver<SpanData>,
        config: BatchConfig,
        recorder: MetricsRecorder,
    ) -> Self {
        Self {
            exporter,
            receiver,
            config,
            recorder,
        }
    }

    /// Run until shutdown is signalled or every sender is gone, then drain
    /// the queue and flush.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Self {
            exporter,
            mut receiver,
            config,
            recorder,
        } = self;

        tracing::info!(
            exporter = exporter.name(),
            max_batch_size = config.max_batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Span processor started"
        );

        let mut batch: Vec<SpanData> = Vec::with_capacity(config.max_batch_size);
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(span) => {
                        batch.push(span);
                        if batch.len() >= config.max_batch_size {
                            flush(&exporter, &mut batch, &config, &recorder).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        flush(&exporter, &mut batch, &config, &recorder).await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Span processor draining queue");
                    break;
                }
            }
        }

        receiver.close();
        while let Some(span) = receiver.recv().await {
            batch.push(span);
            if batch.len() >= config.max_batch_size {
                flush(&exporter, &mut batch, &config, &recorder).await;
            }
        }
        if !batch.is_empty() {
            flush(&exporter, &mut batch, &config, &recorder).await;
        }

        tracing::info!("Span processor stopped");
    }
}

async fn flush<E: SpanExporter>(
    exporter: &E,
    batch: &mut Vec<SpanData>,
    config: &BatchConfig,
    recorder: &MetricsRecorder,
) {
    let spans = std::mem::take(batch);
    let count = spans.len() as u64;

    match tokio::time::timeout(config.export_timeout, exporter.export(&spans)).await {
        Ok(Ok(())) => {
            recorder.add_counter(SPAN_EXPORT_TOTAL, &[("outcome", "exported")], count);
            tracing::debug!(exporter = exporter.name(), spans = count, "Exported span batch");
        }
        Ok(Err(e)) => {
            recorder.add_counter(SPAN_EXPORT_TOTAL, &[("outcome", "failed")], count);
            tracing::warn!(
                exporter = exporter.name(),
                spans = count,
                error = %e,
                "Span export failed, dropping batch"
            );
        }
        Err(_) => {
            recorder.add_counter(SPAN_EXPORT_TOTAL, &[("outcome", "failed")], count);
            tracing::warn!(
                exporter = exporter.name(),
                spans = count,
                timeout_ms = config.export_timeout.as_millis() as u64,
                "Span export timed out, dropping batch"
            );
        }
    }
}

/// Wire a tracer to a batch processor exporting through `exporter`.
///
/// The processor must be spawned for spans to leave the process.
pub fn pipeline<E: SpanExporter>(
    exporter: E,
    config: &TracingConfig,
    recorder: MetricsRecorder,
) -> (Tracer, BatchSpanProcessor<E>) {
    let batch = BatchConfig::from_config(config);
    let (sink, receiver) = SpanSink::bounded(batch.max_queue_size, recorder.clone());
    let tracer = Tracer::new(Sampler::from_config(config), sink);
    let processor = BatchSpanProcessor::new(exporter, receiver, batch, recorder);
    (tracer, processor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::error::{TraceError, TraceResult};
    use crate::trace::exporter::InMemoryExporter;
    use crate::trace::span::SpanKind;

    struct FailingExporter;

    impl SpanExporter for FailingExporter {
        async fn export(&self, _spans: &[SpanData]) -> TraceResult<()> {
            Err(TraceError::Export("collector down".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn config(batch: usize, flush_ms: u64) -> TracingConfig {
        TracingConfig {
            max_batch_size: batch,
            max_queue_size: 64,
            flush_interval_ms: flush_ms,
            ..TracingConfig::default()
        }
    }

    fn emit(tracer: &Tracer, n: usize) {
        for i in 0..n {
            tracer
                .start_root(format!("span-{}", i), SpanKind::Internal, None)
                .end();
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_spans() {
        let exporter = InMemoryExporter::new();
        let recorder = MetricsRecorder::new();
        let (tracer, processor) = pipeline(exporter.clone(), &config(100, 60_000), recorder.clone());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(processor.run(rx));

        emit(&tracer, 5);
        tokio::task::yield_now().await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(exporter.len(), 5);
        assert_eq!(
            recorder.counter_value(SPAN_EXPORT_TOTAL, &[("outcome", "exported")]),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_interval() {
        let exporter = InMemoryExporter::new();
        let (tracer, processor) =
            pipeline(exporter.clone(), &config(3, 60_000), MetricsRecorder::new());
        let (_tx, rx) = broadcast::channel(1);
        tokio::spawn(processor.run(rx));

        emit(&tracer, 3);
        for _ in 0..100 {
            if exporter.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exporter.len(), 3);
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let exporter = InMemoryExporter::new();
        let (tracer, processor) = pipeline(exporter.clone(), &config(100, 20), MetricsRecorder::new());
        let (_tx, rx) = broadcast::channel(1);
        tokio::spawn(processor.run(rx));

        emit(&tracer, 2);
        for _ in 0..100 {
            if exporter.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exporter.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_export_is_counted_not_propagated() {
        let recorder = MetricsRecorder::new();
        let (tracer, processor) = pipeline(FailingExporter, &config(100, 60_000), recorder.clone());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(processor.run(rx));

        emit(&tracer, 4);
        tokio::task::yield_now().await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(
            recorder.counter_value(SPAN_EXPORT_TOTAL, &[("outcome", "failed")]),
            Some(4)
        );
        assert_eq!(recorder.counter_value(SPAN_EXPORT_TOTAL, &[("outcome", "exported")]), None);
    }

    #[tokio::test]
    async fn test_processor_stops_when_tracers_are_gone() {
        let exporter = InMemoryExporter::new();
        let (tracer, processor) =
            pipeline(exporter.clone(), &config(100, 60_000), MetricsRecorder::new());
        let (_tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(processor.run(rx));

        emit(&tracer, 1);
        drop(tracer);
        handle.await.unwrap();
        assert_eq!(exporter.len(), 1);
    }
}
