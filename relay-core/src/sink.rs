//! The sink boundary. An [AsyncSink] is the capability contract a transport
//! must honor to receive writes: connect, a blocking write, and an async
//! close pair. The [SinkWriter] drives a pool of writer workers over a
//! transaction channel, reconnecting with backoff whenever a worker observes
//! [Error::NotConnected] and acknowledging every transaction with its final
//! outcome.
//!
//! Reconnection is serialised through one mutex. A worker entering the
//! protocol first re-attempts its write, because a peer may have restored the
//! connection while it was blocked on the mutex; only if that write still
//! reports [Error::NotConnected] does it rebuild the connection itself. This
//! keeps exactly one `connection_up` tick per real reconnect however many
//! workers observed the outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Span};

use crate::config::SinkWriterConfig;
use crate::error::{Error, Result};
use crate::mapper::PartMapper;
use crate::message::{Batch, Transaction};
use crate::metrics::{sink_labels, sink_metrics};
use crate::shutdown::Signaller;

mod blackhole;
mod log;

pub use blackhole::BlackholeSink;
pub use log::LogSink;

/// The sink type whose write failures are intentional dead-letters, logged at
/// debug rather than error.
const REJECT_SINK_NAME: &str = "reject";

/// Set of items a transport has to implement to become a sink.
#[trait_variant::make(AsyncSink: Send)]
pub trait LocalAsyncSink {
    /// Establishes a connection to the sink. Returns `Ok` if the attempt was
    /// successful or unnecessary.
    async fn connect(&self, cln_token: CancellationToken) -> Result<()>;

    /// Blocks until the batch is written and acknowledged by the transport,
    /// a transport error occurred, or the sink was closed. Returns
    /// [Error::NotConnected] to request a reconnect.
    async fn write(&self, cln_token: CancellationToken, batch: Batch) -> Result<()>;

    /// Triggers shutdown of the transport without blocking.
    fn close_async(&self);

    /// Blocks until the transport has finished shutting down.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}

struct SinkWriterState<W> {
    config: SinkWriterConfig,
    writer: W,
    is_connected: AtomicBool,
    connect_mutex: tokio::sync::Mutex<()>,
    inject_tracing_map: Option<Arc<dyn PartMapper>>,
    shut_sig: Signaller,
    labels: Vec<(String, String)>,
}

/// Builder for a [SinkWriter].
pub struct SinkWriterBuilder<W> {
    config: SinkWriterConfig,
    writer: W,
    inject_tracing_map: Option<Arc<dyn PartMapper>>,
}

impl<W> SinkWriterBuilder<W>
where
    W: AsyncSink + Send + Sync + 'static,
{
    pub fn new(config: SinkWriterConfig, writer: W) -> Self {
        Self {
            config,
            writer,
            inject_tracing_map: None,
        }
    }

    /// Sets a mapping used to inject tracing context into each part before it
    /// is written.
    pub fn inject_tracing_map(mut self, mapper: Arc<dyn PartMapper>) -> Self {
        self.inject_tracing_map = Some(mapper);
        self
    }

    pub fn build(self) -> SinkWriter<W> {
        let labels = sink_labels(&self.config.name);
        SinkWriter {
            state: Arc::new(SinkWriterState {
                config: self.config,
                writer: self.writer,
                is_connected: AtomicBool::new(false),
                connect_mutex: tokio::sync::Mutex::new(()),
                inject_tracing_map: self.inject_tracing_map,
                shut_sig: Signaller::new(),
                labels,
            }),
            started: false,
        }
    }
}

/// Drives a pool of writer workers over a channel of transactions.
pub struct SinkWriter<W> {
    state: Arc<SinkWriterState<W>>,
    started: bool,
}

impl<W> SinkWriter<W>
where
    W: AsyncSink + Send + Sync + 'static,
{
    /// Assigns the transaction channel and starts the driver. Every
    /// transaction received is acknowledged exactly once with its final
    /// outcome, except when the sink reports [Error::TypeClosed], which is
    /// itself the shutdown signal.
    pub fn consume(&mut self, transactions: mpsc::Receiver<Transaction>) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;
        tokio::spawn(Self::run(Arc::clone(&self.state), transactions));
        Ok(())
    }

    /// Whether the driver currently holds an established connection.
    pub fn connected(&self) -> bool {
        self.state.is_connected.load(Ordering::Acquire)
    }

    /// Signals all workers to finish their current transaction and exit.
    pub fn close_at_leisure(&self) {
        self.state.shut_sig.close_at_leisure();
    }

    /// Blocks until the driver has fully stopped, or returns
    /// [Error::Timeout].
    pub async fn wait_until_stopped(&self, timeout: Duration) -> Result<()> {
        self.state.shut_sig.wait_for_stop(timeout).await
    }

    async fn run(state: Arc<SinkWriterState<W>>, transactions: mpsc::Receiver<Transaction>) {
        if Self::init_connection(&state).await {
            sink_metrics()
                .connection_up
                .get_or_create(&state.labels)
                .inc();
            state.is_connected.store(true, Ordering::Release);
            info!(sink = %state.config.name, "Connected");

            let transactions = Arc::new(tokio::sync::Mutex::new(transactions));
            let mut workers = Vec::with_capacity(state.config.max_inflight);
            for _ in 0..state.config.max_inflight.max(1) {
                workers.push(tokio::spawn(Self::worker_loop(
                    Arc::clone(&state),
                    Arc::clone(&transactions),
                )));
            }
            for worker in workers {
                let _ = worker.await;
            }
        }

        state.writer.close_async();
        if let Err(err) = state.writer.wait_for_close(state.config.shutdown_grace).await {
            error!(%err, sink = %state.config.name, "Sink failed to close within grace period");
        }
        state.is_connected.store(false, Ordering::Release);
        state.shut_sig.shutdown_complete();
    }

    /// Connects with exponential backoff until success, shutdown, or the sink
    /// reporting it was closed.
    async fn init_connection(state: &Arc<SinkWriterState<W>>) -> bool {
        let mut backoff = state.config.connection_backoff.strategy();
        loop {
            let token = state.shut_sig.at_leisure_child_token();
            let attempt = tokio::select! {
                res = state.writer.connect(token) => res,
                _ = state.shut_sig.closed_at_leisure() => return false,
            };
            match attempt {
                Ok(()) => return true,
                Err(Error::TypeClosed) => return false,
                Err(err) => {
                    error!(%err, sink = %state.config.name, "Failed to connect");
                    sink_metrics()
                        .connection_failed
                        .get_or_create(&state.labels)
                        .inc();
                    let delay = backoff
                        .next()
                        .unwrap_or(state.config.connection_backoff.max_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = state.shut_sig.closed_at_leisure() => return false,
                    }
                }
            }
        }
    }

    async fn timed_write(state: &Arc<SinkWriterState<W>>, batch: &Batch) -> (Duration, Result<()>) {
        let token = if state.config.no_cancel {
            CancellationToken::new()
        } else {
            state.shut_sig.at_leisure_child_token()
        };
        let start = Instant::now();
        let result = state.writer.write(token, batch.clone()).await;
        (start.elapsed(), result)
    }

    /// The reconnect protocol. Serialised through the connect mutex; the
    /// write is re-attempted before reconnecting in case a peer already
    /// restored the connection.
    async fn connect_loop(state: &Arc<SinkWriterState<W>>, batch: &Batch) -> (Duration, Result<()>) {
        state.is_connected.store(false, Ordering::Release);

        let _guard = state.connect_mutex.lock().await;

        if state.is_connected.load(Ordering::Acquire) {
            let (latency, result) = Self::timed_write(state, batch).await;
            if !matches!(result, Err(Error::NotConnected)) {
                if result.is_err() {
                    sink_metrics()
                        .write_error
                        .get_or_create(&state.labels)
                        .inc();
                }
                return (latency, result);
            }
            state.is_connected.store(false, Ordering::Release);
        }
        sink_metrics()
            .connection_lost
            .get_or_create(&state.labels)
            .inc();

        loop {
            if !Self::init_connection(state).await {
                return (Duration::ZERO, Err(Error::TypeClosed));
            }
            let (latency, result) = Self::timed_write(state, batch).await;
            if !matches!(result, Err(Error::NotConnected)) {
                state.is_connected.store(true, Ordering::Release);
                sink_metrics()
                    .connection_up
                    .get_or_create(&state.labels)
                    .inc();
                if result.is_err() {
                    sink_metrics()
                        .write_error
                        .get_or_create(&state.labels)
                        .inc();
                }
                return (latency, result);
            }
        }
    }

    /// Creates a span per part and applies the optional tracing-injection
    /// mapping. A mapping failure keeps the original part.
    fn inject_spans(state: &Arc<SinkWriterState<W>>, batch: &Batch) -> (Batch, Vec<Span>) {
        let mut spans = Vec::with_capacity(batch.len());
        let mut parts = Vec::with_capacity(batch.len());
        for (index, part) in batch.iter().enumerate() {
            let span = info_span!("sink_write", sink = %state.config.name, index);
            let mut mapped = part.clone();
            if let Some(mapper) = &state.inject_tracing_map {
                match mapper.map_part(index, part) {
                    Ok(Some(new_part)) => mapped = new_part,
                    Ok(None) => {}
                    Err(err) => warn!(%err, index, "Failed to inject span"),
                }
            }
            mapped.set_span(span.clone());
            spans.push(span);
            parts.push(mapped);
        }
        (Batch::from(parts), spans)
    }

    async fn worker_loop(
        state: Arc<SinkWriterState<W>>,
        transactions: Arc<tokio::sync::Mutex<mpsc::Receiver<Transaction>>>,
    ) {
        loop {
            let transaction = {
                let mut receiver = transactions.lock().await;
                tokio::select! {
                    ts = receiver.recv() => match ts {
                        Some(ts) => ts,
                        None => return,
                    },
                    _ = state.shut_sig.closed_at_leisure() => return,
                }
            };

            trace!(
                parts = transaction.batch.len(),
                sink = %state.config.name,
                "Attempting to write batch"
            );
            let (batch, spans) = Self::inject_spans(&state, &transaction.batch);

            let (mut latency, mut result) = Self::timed_write(&state, &batch).await;
            if matches!(result, Err(Error::NotConnected)) {
                (latency, result) = Self::connect_loop(&state, &batch).await;
            } else if result.is_err() {
                sink_metrics()
                    .write_error
                    .get_or_create(&state.labels)
                    .inc();
            }

            // the sink closing is the shutdown signal itself; leave the
            // transaction unacked so the caller observes it
            if matches!(result, Err(Error::TypeClosed)) {
                return;
            }

            match &result {
                Ok(()) => {
                    sink_metrics()
                        .batch_sent
                        .get_or_create(&state.labels)
                        .inc();
                    sink_metrics()
                        .sent
                        .get_or_create(&state.labels)
                        .inc_by(batch.message_count() as u64);
                    sink_metrics()
                        .write_latency
                        .get_or_create(&state.labels)
                        .observe(latency.as_micros() as f64);
                    trace!(
                        parts = batch.len(),
                        sink = %state.config.name,
                        "Successfully wrote batch"
                    );
                }
                Err(err) => {
                    if state.config.name == REJECT_SINK_NAME {
                        debug!(%err, "Rejecting batch");
                    } else {
                        error!(%err, sink = %state.config.name, "Failed to write batch");
                    }
                }
            }

            drop(spans);

            if let Err(err) = transaction.ack(result.err()).await {
                error!(%err, sink = %state.config.name, "Failed to acknowledge transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use tokio::sync::{oneshot, Barrier};
    use tokio::time::timeout;

    use super::*;
    use crate::config::BackoffConfig;
    use crate::message::{AckFn, Part};

    type WriteScript = VecDeque<(Option<Arc<Barrier>>, Result<()>)>;

    #[derive(Clone, Default)]
    struct MockSink {
        connects: Arc<AtomicUsize>,
        connect_script: Arc<Mutex<VecDeque<Result<()>>>>,
        write_script: Arc<Mutex<WriteScript>>,
        written: Arc<Mutex<Vec<Vec<String>>>>,
        closed: Arc<AtomicBool>,
    }

    impl MockSink {
        fn script_write(&self, barrier: Option<Arc<Barrier>>, result: Result<()>) {
            self.write_script.lock().push_back((barrier, result));
        }
    }

    impl AsyncSink for MockSink {
        async fn connect(&self, _cln_token: CancellationToken) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn write(&self, _cln_token: CancellationToken, batch: Batch) -> Result<()> {
            let scripted = self.write_script.lock().pop_front();
            if let Some((barrier, result)) = scripted {
                if let Some(barrier) = barrier {
                    barrier.wait().await;
                }
                result?;
            }
            self.written.lock().push(
                batch
                    .iter()
                    .map(|p| String::from_utf8_lossy(p.value()).to_string())
                    .collect(),
            );
            Ok(())
        }

        fn close_async(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn wait_for_close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn transaction(payloads: &[&str]) -> (Transaction, oneshot::Receiver<Option<Error>>) {
        let (tx, rx) = oneshot::channel();
        let ack = AckFn::new(move |cause| async move {
            let _ = tx.send(cause);
            Ok(())
        });
        (
            Transaction::new(
                Batch::from_payloads(payloads.iter().map(|p| p.to_string())),
                ack,
            ),
            rx,
        )
    }

    fn config(name: &str, max_inflight: usize) -> SinkWriterConfig {
        SinkWriterConfig {
            max_inflight,
            ..SinkWriterConfig::named(name)
        }
    }

    async fn acked(rx: oneshot::Receiver<Option<Error>>) -> Option<Error> {
        timeout(Duration::from_secs(2), rx)
            .await
            .expect("transaction not acked in time")
            .expect("ack dropped without firing")
    }

    #[tokio::test]
    async fn writes_and_acks_transactions() {
        let sink = MockSink::default();
        let written = Arc::clone(&sink.written);
        let mut writer = SinkWriterBuilder::new(config("test-sink-happy", 1), sink).build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts1, ack1) = transaction(&["foo", "bar"]);
        let (ts2, ack2) = transaction(&["baz"]);
        tx.send(ts1).await.unwrap();
        tx.send(ts2).await.unwrap();

        assert!(acked(ack1).await.is_none());
        assert!(acked(ack2).await.is_none());
        assert!(writer.connected());

        assert_eq!(
            *written.lock(),
            vec![vec!["foo".to_string(), "bar".to_string()], vec!["baz".to_string()]]
        );

        let labels = sink_labels("test-sink-happy");
        assert_eq!(sink_metrics().sent.get_or_create(&labels).get(), 3);
        assert_eq!(sink_metrics().batch_sent.get_or_create(&labels).get(), 2);
        assert_eq!(sink_metrics().connection_up.get_or_create(&labels).get(), 1);
    }

    #[tokio::test]
    async fn write_error_acks_with_cause_without_retry() {
        let sink = MockSink::default();
        sink.script_write(None, Err(Error::Sink("bad payload".to_string())));
        let mut writer = SinkWriterBuilder::new(config("test-sink-error", 1), sink).build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts, ack) = transaction(&["doomed"]);
        tx.send(ts).await.unwrap();
        let cause = acked(ack).await.expect("expected a failure cause");
        assert!(matches!(cause, Error::Sink(msg) if msg == "bad payload"));

        // the driver keeps serving after a non-retryable failure
        let (ts, ack) = transaction(&["fine"]);
        tx.send(ts).await.unwrap();
        assert!(acked(ack).await.is_none());

        let labels = sink_labels("test-sink-error");
        assert_eq!(sink_metrics().write_error.get_or_create(&labels).get(), 1);
    }

    #[tokio::test]
    async fn not_connected_triggers_reconnect_then_retry() {
        let sink = MockSink::default();
        sink.script_write(None, Err(Error::NotConnected));
        let connects = Arc::clone(&sink.connects);
        let mut writer = SinkWriterBuilder::new(config("test-sink-reconnect", 1), sink).build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts, ack) = transaction(&["retry me"]);
        tx.send(ts).await.unwrap();
        assert!(acked(ack).await.is_none());

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        let labels = sink_labels("test-sink-reconnect");
        assert_eq!(sink_metrics().connection_up.get_or_create(&labels).get(), 2);
        assert_eq!(sink_metrics().connection_lost.get_or_create(&labels).get(), 1);
    }

    #[tokio::test]
    async fn reconnect_race_has_single_winner() {
        let sink = MockSink::default();
        let barrier = Arc::new(Barrier::new(2));
        // both workers must be in flight before either observes the outage
        sink.script_write(Some(Arc::clone(&barrier)), Err(Error::NotConnected));
        sink.script_write(Some(barrier), Err(Error::NotConnected));
        let connects = Arc::clone(&sink.connects);
        let mut writer = SinkWriterBuilder::new(config("test-sink-race", 2), sink).build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts1, ack1) = transaction(&["one"]);
        let (ts2, ack2) = transaction(&["two"]);
        tx.send(ts1).await.unwrap();
        tx.send(ts2).await.unwrap();

        assert!(acked(ack1).await.is_none());
        assert!(acked(ack2).await.is_none());

        // exactly one real reconnect: the loser found the connection alive
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        let labels = sink_labels("test-sink-race");
        assert_eq!(sink_metrics().connection_up.get_or_create(&labels).get(), 2);
        assert_eq!(sink_metrics().connection_lost.get_or_create(&labels).get(), 1);
        assert!(writer.connected());
    }

    #[tokio::test]
    async fn type_closed_stops_worker_without_acking() {
        let sink = MockSink::default();
        sink.script_write(None, Err(Error::TypeClosed));
        let closed = Arc::clone(&sink.closed);
        let mut writer = SinkWriterBuilder::new(config("test-sink-closed", 1), sink).build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts, ack) = transaction(&["never acked"]);
        tx.send(ts).await.unwrap();

        // the ack callback is dropped unresolved
        assert!(timeout(Duration::from_secs(2), ack).await.unwrap().is_err());
        writer.wait_until_stopped(Duration::from_secs(2)).await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(!writer.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_with_backoff() {
        let sink = MockSink::default();
        sink.connect_script
            .lock()
            .push_back(Err(Error::Connection("refused".to_string())));
        let connects = Arc::clone(&sink.connects);
        let mut writer = SinkWriterBuilder::new(
            SinkWriterConfig {
                connection_backoff: BackoffConfig {
                    initial_interval: Duration::from_millis(500),
                    max_interval: Duration::from_secs(1),
                    factor: 2.0,
                    jitter: 0.0,
                },
                ..SinkWriterConfig::named("test-sink-connect-backoff")
            },
            sink,
        )
        .build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts, ack) = transaction(&["after retry"]);
        tx.send(ts).await.unwrap();
        assert!(acked(ack).await.is_none());

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        let labels = sink_labels("test-sink-connect-backoff");
        assert_eq!(
            sink_metrics().connection_failed.get_or_create(&labels).get(),
            1
        );
    }

    #[tokio::test]
    async fn close_at_leisure_stops_the_pool() {
        let sink = MockSink::default();
        let closed = Arc::clone(&sink.closed);
        let mut writer = SinkWriterBuilder::new(config("test-sink-shutdown", 4), sink).build();

        let (_tx, rx) = mpsc::channel::<Transaction>(4);
        writer.consume(rx).unwrap();

        writer.close_at_leisure();
        writer.wait_until_stopped(Duration::from_secs(2)).await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn consume_twice_is_already_started() {
        let sink = MockSink::default();
        let mut writer = SinkWriterBuilder::new(config("test-sink-twice", 1), sink).build();

        let (_tx1, rx1) = mpsc::channel::<Transaction>(1);
        let (_tx2, rx2) = mpsc::channel::<Transaction>(1);
        writer.consume(rx1).unwrap();
        let err = writer.consume(rx2).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        writer.close_at_leisure();
        writer.wait_until_stopped(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_until_stopped_times_out_when_never_started() {
        let sink = MockSink::default();
        let writer = SinkWriterBuilder::new(config("test-sink-timeout", 1), sink).build();
        let err = writer
            .wait_until_stopped(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn tracing_map_failure_keeps_original_part() {
        let sink = MockSink::default();
        let written = Arc::clone(&sink.written);
        let mapper = |index: usize, part: &Part| -> Result<Option<Part>> {
            if index == 0 {
                Err(Error::Mapping("no context".to_string()))
            } else {
                let mut mapped = part.clone();
                let mut value = part.value().to_vec();
                value.extend_from_slice(b"+span");
                mapped.set_value(value);
                Ok(Some(mapped))
            }
        };
        let mut writer = SinkWriterBuilder::new(config("test-sink-inject", 1), sink)
            .inject_tracing_map(Arc::new(mapper))
            .build();

        let (tx, rx) = mpsc::channel(4);
        writer.consume(rx).unwrap();

        let (ts, ack) = transaction(&["a", "b"]);
        tx.send(ts).await.unwrap();
        assert!(acked(ack).await.is_none());

        assert_eq!(
            *written.lock(),
            vec![vec!["a".to_string(), "b+span".to_string()]]
        );
    }
}
